//! Migration file discovery

use crate::migration::source::{EntryKind, MigrationSource};
use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::io;

/// Suffix a file must carry to be treated as a migration.
pub const MIGRATION_SUFFIX: &str = ".sql";

/// Leading digits followed by `_` or `-`, e.g. `001_create_users.sql`.
static NUMERIC_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)[_-]").unwrap());

/// A discovered migration file.
///
/// Identity is the filename; its byte-wise order is the application order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MigrationFile {
    pub filename: String,
}

impl MigrationFile {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }

    /// Numeric prefix of the filename, if it follows the `NNN_slug.sql` convention.
    pub fn prefix(&self) -> Option<&str> {
        NUMERIC_PREFIX
            .captures(&self.filename)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}

/// Discover all migration files in a source
///
/// Keeps regular files ending in `.sql` and sorts them by filename (byte-wise,
/// not numerically: `10_x.sql` sorts before `9_x.sql`, hence zero-padding).
/// Directories and other files are skipped silently. An empty source yields an
/// empty list.
///
/// # Errors
///
/// Returns `MigrationError::Discovery` if the source cannot be listed or lists the
/// same filename twice.
pub fn discover_migrations(
    source: &dyn MigrationSource,
) -> Result<Vec<MigrationFile>, MigrationError> {
    let location = source.location();
    let entries = source.entries().map_err(|e| MigrationError::Discovery {
        location: location.clone(),
        source: e,
    })?;

    let mut seen = HashSet::new();
    let mut migrations = Vec::new();
    for entry in entries {
        if entry.kind != EntryKind::File || !entry.name.ends_with(MIGRATION_SUFFIX) {
            continue;
        }
        if !seen.insert(entry.name.clone()) {
            return Err(MigrationError::Discovery {
                location,
                source: io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("duplicate migration filename '{}'", entry.name),
                ),
            });
        }
        migrations.push(MigrationFile::new(entry.name));
    }

    migrations.sort();
    check_naming(&migrations);
    log::debug!("Discovered {} migration(s) in {}", migrations.len(), location);
    Ok(migrations)
}

/// Warn about filenames whose lexicographic order may not match intent.
///
/// Returns the warnings so callers and tests can inspect them.
pub fn check_naming(migrations: &[MigrationFile]) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut widths = HashSet::new();

    for file in migrations {
        match file.prefix() {
            Some(prefix) => {
                widths.insert(prefix.len());
            }
            None => warnings.push(format!(
                "Migration '{}' has no numeric prefix; it is ordered by name only",
                file.filename
            )),
        }
    }
    if widths.len() > 1 {
        let mut widths: Vec<_> = widths.into_iter().collect();
        widths.sort_unstable();
        warnings.push(format!(
            "Migration prefixes have mixed widths {widths:?}; \
             zero-pad them so name order matches numeric order"
        ));
    }

    for warning in &warnings {
        log::warn!("{warning}");
    }
    warnings
}

/// Files not yet applied, in discovery order.
pub fn pending_migrations<'a>(
    discovered: &'a [MigrationFile],
    applied: &HashSet<String>,
) -> Vec<&'a MigrationFile> {
    discovered
        .iter()
        .filter(|file| !applied.contains(&file.filename))
        .collect()
}

/// Applied filenames with no matching file, sorted.
pub fn orphaned_records(discovered: &[MigrationFile], applied: &HashSet<String>) -> Vec<String> {
    let known: HashSet<&str> = discovered.iter().map(|f| f.filename.as_str()).collect();
    let mut orphaned: Vec<String> = applied
        .iter()
        .filter(|name| !known.contains(name.as_str()))
        .cloned()
        .collect();
    orphaned.sort();
    orphaned
}
