//! Migration-specific error types

use crate::executor::DbError;

/// Errors that end a coordinator run.
///
/// Every variant is fatal to the current run. None of them leaves a migration
/// recorded as applied without its SQL having committed, so the caller can
/// simply run again (typically by restarting the process).
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The migration source itself could not be listed
    #[error("Failed to list migrations in {location}: {source}")]
    Discovery {
        location: String,
        #[source]
        source: std::io::Error,
    },

    /// A bookkeeping or catalog query failed
    #[error("Failed to {operation} (table {table}): {source}")]
    Persistence {
        operation: &'static str,
        table: String,
        #[source]
        source: DbError,
    },

    /// The cluster lock could not be obtained
    #[error(
        "Failed to acquire migration lock {key}: {reason}\n\
         Another process may be running migrations; the lock is released when its session ends."
    )]
    LockAcquisition { key: i64, reason: String },

    /// One migration failed; it and every later migration remain pending
    #[error("Migration {filename} failed: {cause}")]
    Execution {
        filename: String,
        #[source]
        cause: ExecutionFailure,
    },
}

/// The step of a single migration that failed.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionFailure {
    #[error("failed to read migration file: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] DbError),
    #[error("failed to execute SQL: {0}")]
    Sql(#[source] DbError),
    #[error("failed to record migration: {0}")]
    Record(#[source] DbError),
    #[error("failed to commit: {0}")]
    Commit(#[source] DbError),
}

impl MigrationError {
    /// Filename of the failing migration, for `Execution` errors.
    pub fn filename(&self) -> Option<&str> {
        match self {
            MigrationError::Execution { filename, .. } => Some(filename),
            _ => None,
        }
    }

    pub(crate) fn persistence(operation: &'static str, table: &str, source: DbError) -> Self {
        MigrationError::Persistence {
            operation,
            table: table.to_string(),
            source,
        }
    }

    pub(crate) fn execution(filename: &str, cause: ExecutionFailure) -> Self {
        MigrationError::Execution {
            filename: filename.to_string(),
            cause,
        }
    }
}
