//! Onboarding databases whose schema was provisioned outside the coordinator.
//!
//! When the bookkeeping table is empty but the sentinel table exists, the
//! discovered migrations are recorded as applied without running their SQL.

use crate::config::MigrationConfig;
use crate::executor::Executor;
use crate::migration::file::MigrationFile;
use crate::migration::state_table::{record_migration, table_exists};
use crate::migration::MigrationError;
use crate::transaction::Transaction;

#[cfg(feature = "tracing")]
use crate::telemetry::tracing_helpers;

/// Whether the sentinel table exists.
///
/// Only meaningful while the applied set is empty. Returns `false` when no
/// sentinel is configured.
///
/// # Errors
///
/// Returns `MigrationError::Persistence` if the catalog query fails.
pub fn detect_existing_schema(
    executor: &dyn Executor,
    config: &MigrationConfig,
) -> Result<bool, MigrationError> {
    let Some(sentinel) = config.sentinel() else {
        return Ok(false);
    };
    table_exists(executor, &config.schema, sentinel)
        .map_err(|e| MigrationError::persistence("check for sentinel table", sentinel, e))
}

/// Record every file as applied in one transaction, without executing SQL
///
/// Inserts are conflict-tolerant, so rows that already exist are skipped. Any
/// failure rolls back the whole batch. Returns the number of rows inserted.
///
/// # Errors
///
/// Returns `MigrationError::Persistence` naming the failing step.
pub fn seed_migrations(
    executor: &dyn Executor,
    config: &MigrationConfig,
    files: &[MigrationFile],
) -> Result<usize, MigrationError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::seed_span(files.len()).entered();

    let table = config.bookkeeping_table.as_str();
    let tx = Transaction::begin(executor)
        .map_err(|e| MigrationError::persistence("begin seed transaction", table, e))?;

    let mut inserted = 0usize;
    for file in files {
        // Dropping `tx` on the error path rolls the batch back
        let rows = record_migration(&tx, config, &file.filename, true)
            .map_err(|e| MigrationError::persistence("seed migration record", table, e))?;
        inserted += rows as usize;
    }

    tx.commit()
        .map_err(|e| MigrationError::persistence("commit seed transaction", table, e.into()))?;

    log::info!(
        "Seeded {} existing migration(s) into {} ({} already present)",
        inserted,
        table,
        files.len() - inserted
    );
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::state_table::{initialize_state_table, load_applied};
    use crate::test_helpers::FakeDatabase;

    fn files(names: &[&str]) -> Vec<MigrationFile> {
        names.iter().map(|n| MigrationFile::new(*n)).collect()
    }

    #[test]
    fn test_detect_sentinel() {
        let config = MigrationConfig::default();
        let db = FakeDatabase::new();
        assert!(!detect_existing_schema(&db.session(), &config).unwrap());

        let db = FakeDatabase::new().with_table("tickers");
        assert!(detect_existing_schema(&db.session(), &config).unwrap());
    }

    #[test]
    fn test_detect_disabled_without_sentinel() {
        let config = MigrationConfig {
            sentinel_table: None,
            ..MigrationConfig::default()
        };
        let db = FakeDatabase::new().with_table("tickers");
        let session = db.session();
        assert!(!detect_existing_schema(&session, &config).unwrap());
        assert!(db.statement_log().is_empty());
    }

    #[test]
    fn test_detect_failure_names_sentinel_table() {
        let config = MigrationConfig::default();
        let db = FakeDatabase::new();
        db.fail_when("information_schema.tables");

        let err = detect_existing_schema(&db.session(), &config).unwrap_err();
        match err {
            MigrationError::Persistence { table, .. } => assert_eq!(table, "tickers"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_seed_records_all_without_executing_sql() {
        let config = MigrationConfig::default();
        let db = FakeDatabase::new();
        let session = db.session();
        initialize_state_table(&session, &config).unwrap();

        let files = files(&["001_a.sql", "002_b.sql"]);
        let seeded = seed_migrations(&session, &config, &files).unwrap();
        assert_eq!(seeded, 2);
        assert_eq!(db.records("schema_migrations"), vec!["001_a.sql", "002_b.sql"]);
        assert!(db.script_log().is_empty());
    }

    #[test]
    fn test_seed_tolerates_existing_rows() {
        let config = MigrationConfig::default();
        let db = FakeDatabase::new();
        let session = db.session();
        initialize_state_table(&session, &config).unwrap();
        record_migration(&session, &config, "001_a.sql", false).unwrap();

        let files = files(&["001_a.sql", "002_b.sql"]);
        let seeded = seed_migrations(&session, &config, &files).unwrap();
        assert_eq!(seeded, 1);
        assert_eq!(load_applied(&session, &config).unwrap().len(), 2);
    }

    #[test]
    fn test_seed_failure_rolls_back_everything() {
        let config = MigrationConfig::default();
        let db = FakeDatabase::new();
        let session = db.session();
        initialize_state_table(&session, &config).unwrap();
        db.fail_when("003_c.sql");

        let files = files(&["001_a.sql", "002_b.sql", "003_c.sql"]);
        let err = seed_migrations(&session, &config, &files).unwrap_err();
        assert!(matches!(err, MigrationError::Persistence { .. }));
        assert!(db.records("schema_migrations").is_empty());
        assert_eq!(db.statement_log().last().map(String::as_str), Some("ROLLBACK"));
    }
}
