//! Tracing span helpers.
//!
//! Enabled with the `tracing` feature. Plain log lines go through the `log` facade
//! regardless of features; spans only add structure around the slow parts of a run.

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    /// Longest SQL prefix recorded on a query span.
    const MAX_STATEMENT_LEN: usize = 120;

    fn truncate(statement: &str) -> &str {
        let trimmed = statement.trim();
        match trimmed.char_indices().nth(MAX_STATEMENT_LEN) {
            Some((idx, _)) => &trimmed[..idx],
            None => trimmed,
        }
    }

    pub fn execute_query_span(statement: &str) -> Span {
        info_span!("tidemark.query", db.system = "postgresql", db.statement = truncate(statement))
    }

    pub fn acquire_lock_span(key: i64) -> Span {
        info_span!("tidemark.lock.acquire", lock.key = key)
    }

    pub fn migration_span(filename: &str) -> Span {
        info_span!("tidemark.migration.apply", migration.filename = filename)
    }

    pub fn seed_span(count: usize) -> Span {
        info_span!("tidemark.migration.seed", migration.count = count)
    }

    pub fn run_span() -> Span {
        info_span!("tidemark.run")
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("tidemark.transaction.begin")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("tidemark.transaction.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        info_span!("tidemark.transaction.rollback")
    }

}
