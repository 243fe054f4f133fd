//! Migration status reporting
//!
//! Read-only: takes no lock and never creates the bookkeeping table.

use crate::config::MigrationConfig;
use crate::executor::Executor;
use crate::migration::bootstrap::detect_existing_schema;
use crate::migration::file::{
    discover_migrations, orphaned_records, pending_migrations, MigrationFile,
};
use crate::migration::record::MigrationRecord;
use crate::migration::source::MigrationSource;
use crate::migration::state_table::{load_records, table_exists};
use crate::migration::MigrationError;
use serde::Serialize;
use std::collections::HashSet;

/// Migration status information
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Applied migrations (from database), ordered by filename
    pub applied: Vec<MigrationRecord>,

    /// Pending migrations (from the source), in application order
    pub pending: Vec<MigrationFile>,

    /// Applied filenames with no matching file
    pub orphaned: Vec<String>,

    /// The next run would seed records instead of executing SQL
    pub would_bootstrap: bool,
}

impl MigrationStatus {
    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    /// Most recent applied migration by filename order
    #[must_use]
    pub fn latest_applied(&self) -> Option<&MigrationRecord> {
        self.applied.last()
    }

    /// Next migration a run would execute
    #[must_use]
    pub fn next_pending(&self) -> Option<&MigrationFile> {
        if self.would_bootstrap {
            return None;
        }
        self.pending.first()
    }
}

/// Compare `source` with the bookkeeping table without changing anything.
///
/// A missing bookkeeping table counts as nothing applied.
///
/// # Errors
///
/// Returns `MigrationError::Discovery` if the source cannot be listed, or
/// `MigrationError::Persistence` if the bookkeeping table cannot be read.
pub fn migration_status(
    executor: &dyn Executor,
    source: &dyn MigrationSource,
    config: &MigrationConfig,
) -> Result<MigrationStatus, MigrationError> {
    let discovered = discover_migrations(source)?;

    let exists = table_exists(executor, &config.schema, &config.bookkeeping_table)
        .map_err(|e| {
            MigrationError::persistence("check bookkeeping table", &config.bookkeeping_table, e)
        })?;
    let applied = if exists {
        load_records(executor, config)?
    } else {
        log::debug!("Bookkeeping table {} does not exist yet", config.bookkeeping_table);
        Vec::new()
    };

    let applied_names: HashSet<String> = applied.iter().map(|r| r.filename.clone()).collect();
    let pending: Vec<MigrationFile> = pending_migrations(&discovered, &applied_names)
        .into_iter()
        .cloned()
        .collect();
    let orphaned = orphaned_records(&discovered, &applied_names);
    let would_bootstrap =
        !discovered.is_empty() && applied.is_empty() && detect_existing_schema(executor, config)?;

    Ok(MigrationStatus {
        applied,
        pending,
        orphaned,
        would_bootstrap,
    })
}
