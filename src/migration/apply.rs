//! Applying one pending migration.

use crate::config::MigrationConfig;
use crate::executor::Executor;
use crate::migration::error::ExecutionFailure;
use crate::migration::file::MigrationFile;
use crate::migration::source::MigrationSource;
use crate::migration::state_table::record_migration;
use crate::migration::MigrationError;
use crate::transaction::Transaction;
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::telemetry::tracing_helpers;

/// Run a migration's SQL and record it, in a single transaction
///
/// The script is sent as-is, so it may hold several statements. Either the
/// SQL and its bookkeeping row both commit, or neither does.
///
/// # Errors
///
/// Returns `MigrationError::Execution` naming the file and the failing step.
pub fn apply_migration(
    executor: &dyn Executor,
    source: &dyn MigrationSource,
    config: &MigrationConfig,
    file: &MigrationFile,
) -> Result<(), MigrationError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::migration_span(&file.filename).entered();

    let start = Instant::now();
    let result = apply_inner(executor, source, config, file);
    match &result {
        Ok(()) => log::info!(
            "Applied migration: {} ({}ms)",
            file.filename,
            start.elapsed().as_millis()
        ),
        Err(e) => log::error!("{e}"),
    }
    result
}

fn apply_inner(
    executor: &dyn Executor,
    source: &dyn MigrationSource,
    config: &MigrationConfig,
    file: &MigrationFile,
) -> Result<(), MigrationError> {
    let fail = |cause| MigrationError::execution(&file.filename, cause);

    let sql = source.read(&file.filename).map_err(|e| fail(ExecutionFailure::Read(e)))?;

    let tx = Transaction::begin(executor).map_err(|e| fail(ExecutionFailure::Begin(e)))?;
    // From here on, an early return drops `tx`, which rolls back
    tx.batch_execute(&sql).map_err(|e| fail(ExecutionFailure::Sql(e)))?;
    record_migration(&tx, config, &file.filename, false)
        .map_err(|e| fail(ExecutionFailure::Record(e)))?;
    tx.commit().map_err(|e| fail(ExecutionFailure::Commit(e.into())))
}
