//! The migration run: lock, bookkeeping, then bootstrap or apply.
//!
//! A run walks an explicit state machine:
//!
//! ```text
//! Idle -> LockHeld -> BookkeepingReady -> BootstrapPath -> Done
//!                                      \-> ApplyPath     -> Done
//! ```
//!
//! Any transition may end in `Failed`. The cluster lock guard is owned by the
//! state, so leaving the machine for any reason releases it.

use crate::config::MigrationConfig;
use crate::executor::Executor;
use crate::migration::apply::apply_migration;
use crate::migration::bootstrap::{detect_existing_schema, seed_migrations};
use crate::migration::file::{
    discover_migrations, orphaned_records, pending_migrations, MigrationFile,
};
use crate::migration::lock::{ClusterLock, ClusterLockGuard};
use crate::migration::source::MigrationSource;
use crate::migration::state_table::{initialize_state_table, load_applied};
use crate::migration::MigrationError;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::telemetry::tracing_helpers;

/// States of a coordinator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    LockHeld,
    BookkeepingReady,
    BootstrapPath,
    ApplyPath,
    Done,
    Failed,
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The source holds no migration files
    NoMigrations,
    /// Every discovered file was already applied
    UpToDate,
    /// Existing schema detected; records were inserted without running SQL
    Bootstrapped { seeded: usize },
    /// These files were executed, in order
    Applied { filenames: Vec<String> },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::NoMigrations => write!(f, "no migration files found"),
            RunOutcome::UpToDate => write!(f, "database is up to date"),
            RunOutcome::Bootstrapped { seeded } => {
                write!(f, "existing schema detected, seeded {seeded} migration record(s)")
            }
            RunOutcome::Applied { filenames } => {
                write!(f, "applied {} migration(s)", filenames.len())
            }
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Number of migration files discovered
    pub discovered: usize,
    pub outcome: RunOutcome,
    /// Applied records with no matching file
    pub orphaned: Vec<String>,
    /// Every state visited, starting with `Idle` and ending with `Done`
    pub phases: Vec<Phase>,
}

impl RunReport {
    /// Filenames executed by this run (empty unless `Applied`).
    pub fn applied(&self) -> &[String] {
        match &self.outcome {
            RunOutcome::Applied { filenames } => filenames,
            _ => &[],
        }
    }
}

/// `(discovered, outcome, orphaned)` of a run that reached `Done`.
type Finished = (usize, RunOutcome, Vec<String>);

/// Run state. Lock-holding states own the guard.
enum RunState<'a> {
    Idle,
    LockHeld {
        guard: ClusterLockGuard<'a>,
    },
    BookkeepingReady {
        guard: ClusterLockGuard<'a>,
    },
    BootstrapPath {
        guard: ClusterLockGuard<'a>,
        discovered: Vec<MigrationFile>,
        orphaned: Vec<String>,
    },
    ApplyPath {
        guard: ClusterLockGuard<'a>,
        discovered: Vec<MigrationFile>,
        applied: HashSet<String>,
        orphaned: Vec<String>,
    },
    Done {
        discovered: usize,
        outcome: RunOutcome,
        orphaned: Vec<String>,
    },
}

impl RunState<'_> {
    fn phase(&self) -> Phase {
        match self {
            RunState::Idle => Phase::Idle,
            RunState::LockHeld { .. } => Phase::LockHeld,
            RunState::BookkeepingReady { .. } => Phase::BookkeepingReady,
            RunState::BootstrapPath { .. } => Phase::BootstrapPath,
            RunState::ApplyPath { .. } => Phase::ApplyPath,
            RunState::Done { .. } => Phase::Done,
        }
    }
}

/// Drives one migration run over a single database session.
///
/// Every statement of the run, including the advisory lock, goes through the
/// same executor: the lock belongs to that session.
pub struct Coordinator<'a> {
    executor: &'a dyn Executor,
    config: &'a MigrationConfig,
}

impl<'a> Coordinator<'a> {
    pub fn new(executor: &'a dyn Executor, config: &'a MigrationConfig) -> Self {
        Self { executor, config }
    }

    /// Bring the database up to date with `source`
    ///
    /// Blocks until the cluster lock is available (or the configured timeout
    /// passes). Stops at the first failing migration; everything before it stays
    /// committed and everything from it onward stays pending.
    ///
    /// # Errors
    ///
    /// Returns the `MigrationError` that moved the run to `Failed`. The lock is
    /// released before returning.
    pub fn run(&self, source: &dyn MigrationSource) -> Result<RunReport, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::run_span().entered();

        let start = Instant::now();
        let (phases, result) = self.drive(source);
        match result {
            Ok((discovered, outcome, orphaned)) => {
                log::info!(
                    "Migration run finished in {}ms: {}",
                    start.elapsed().as_millis(),
                    outcome
                );
                Ok(RunReport {
                    discovered,
                    outcome,
                    orphaned,
                    phases,
                })
            }
            Err(e) => {
                log::debug!(
                    "Migration run failed after {}ms, phases {:?}",
                    start.elapsed().as_millis(),
                    phases
                );
                Err(e)
            }
        }
    }

    /// Walk the state machine to `Done` or `Failed`.
    ///
    /// The visited phases are returned on both paths; the last one is `Done` or
    /// `Failed`.
    fn drive(
        &self,
        source: &dyn MigrationSource,
    ) -> (Vec<Phase>, Result<Finished, MigrationError>) {
        let mut phases = vec![Phase::Idle];
        let mut state = RunState::Idle;

        loop {
            let from = state.phase();
            state = match self.step(state, source) {
                Ok(next) => next,
                Err(e) => {
                    log::debug!("Migration run: {from:?} -> Failed");
                    phases.push(Phase::Failed);
                    return (phases, Err(e));
                }
            };
            let to = state.phase();
            log::debug!("Migration run: {from:?} -> {to:?}");
            phases.push(to);

            if let RunState::Done {
                discovered,
                outcome,
                orphaned,
            } = state
            {
                return (phases, Ok((discovered, outcome, orphaned)));
            }
        }
    }

    fn step(
        &self,
        state: RunState<'a>,
        source: &dyn MigrationSource,
    ) -> Result<RunState<'a>, MigrationError> {
        match state {
            RunState::Idle => {
                let guard = ClusterLock::new(self.config.lock_key)
                    .with_timeout(self.config.lock_timeout_seconds.map(Duration::from_secs))
                    .acquire(self.executor)?;
                Ok(RunState::LockHeld { guard })
            }

            RunState::LockHeld { guard } => {
                initialize_state_table(self.executor, self.config)?;
                Ok(RunState::BookkeepingReady { guard })
            }

            RunState::BookkeepingReady { guard } => {
                let discovered = discover_migrations(source)?;
                if discovered.is_empty() {
                    log::info!("No migration files found in {}", source.location());
                    guard.release();
                    return Ok(RunState::Done {
                        discovered: 0,
                        outcome: RunOutcome::NoMigrations,
                        orphaned: Vec::new(),
                    });
                }

                let applied = load_applied(self.executor, self.config)?;
                let orphaned = orphaned_records(&discovered, &applied);
                for filename in &orphaned {
                    log::warn!(
                        "Migration {filename} is recorded as applied but has no matching file"
                    );
                }

                // Only consult the sentinel on a fresh bookkeeping table
                if applied.is_empty() && detect_existing_schema(self.executor, self.config)? {
                    log::info!(
                        "Bookkeeping table is empty but sentinel table {} exists; \
                         seeding instead of applying",
                        self.config.sentinel().unwrap_or_default()
                    );
                    Ok(RunState::BootstrapPath {
                        guard,
                        discovered,
                        orphaned,
                    })
                } else {
                    Ok(RunState::ApplyPath {
                        guard,
                        discovered,
                        applied,
                        orphaned,
                    })
                }
            }

            RunState::BootstrapPath {
                guard,
                discovered,
                orphaned,
            } => {
                let seeded = seed_migrations(self.executor, self.config, &discovered)?;
                guard.release();
                Ok(RunState::Done {
                    discovered: discovered.len(),
                    outcome: RunOutcome::Bootstrapped { seeded },
                    orphaned,
                })
            }

            RunState::ApplyPath {
                guard,
                discovered,
                applied,
                orphaned,
            } => {
                let pending = pending_migrations(&discovered, &applied);
                if pending.is_empty() {
                    log::debug!("No pending migrations to apply");
                } else {
                    log::info!("Applying {} pending migration(s)", pending.len());
                }

                let mut filenames = Vec::with_capacity(pending.len());
                for file in pending {
                    apply_migration(self.executor, source, self.config, file)?;
                    filenames.push(file.filename.clone());
                }
                guard.release();

                let outcome = if filenames.is_empty() {
                    RunOutcome::UpToDate
                } else {
                    RunOutcome::Applied { filenames }
                };
                Ok(RunState::Done {
                    discovered: discovered.len(),
                    outcome,
                    orphaned,
                })
            }

            done @ RunState::Done { .. } => Ok(done),
        }
    }
}

/// Run migrations from `source` with the default [`MigrationConfig`].
///
/// # Errors
///
/// See [`Coordinator::run`].
pub fn run_migrations(
    executor: &dyn Executor,
    source: &dyn MigrationSource,
) -> Result<RunReport, MigrationError> {
    run_migrations_with_config(executor, source, &MigrationConfig::default())
}

/// Run migrations from `source` with an explicit configuration.
///
/// # Errors
///
/// See [`Coordinator::run`].
pub fn run_migrations_with_config(
    executor: &dyn Executor,
    source: &dyn MigrationSource,
    config: &MigrationConfig,
) -> Result<RunReport, MigrationError> {
    Coordinator::new(executor, config).run(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::error::ExecutionFailure;
    use crate::migration::source::{DirectorySource, MemorySource};
    use crate::migration::state_table::record_migration;
    use crate::test_helpers::FakeDatabase;
    use std::sync::{Arc, Barrier};

    const KEY: i64 = 1_001_001_001;

    fn three_migrations() -> MemorySource {
        MemorySource::new()
            .with_file("002_posts.sql", "CREATE TABLE posts (id BIGINT PRIMARY KEY);")
            .with_file(
                "001_tickers.sql",
                "CREATE TABLE tickers (symbol TEXT PRIMARY KEY); \
                 CREATE TABLE prices (symbol TEXT);",
            )
            .with_file("003_users.sql", "CREATE TABLE users (id BIGINT PRIMARY KEY);")
            .with_file("README.md", "not a migration")
    }

    #[test]
    fn test_fresh_database_applies_in_order() {
        let db = FakeDatabase::new();
        let session = db.session();

        let report = run_migrations(&session, &three_migrations()).unwrap();

        assert_eq!(report.discovered, 3);
        assert_eq!(report.applied(), ["001_tickers.sql", "002_posts.sql", "003_users.sql"]);
        assert_eq!(
            report.phases,
            vec![
                Phase::Idle,
                Phase::LockHeld,
                Phase::BookkeepingReady,
                Phase::ApplyPath,
                Phase::Done
            ]
        );
        assert_eq!(
            db.records("schema_migrations"),
            vec!["001_tickers.sql", "002_posts.sql", "003_users.sql"]
        );
        assert!(db.has_table("tickers"));
        assert!(db.has_table("users"));
        assert_eq!(db.lock_holder(KEY), None);
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let db = FakeDatabase::new();
        let session = db.session();
        let source = three_migrations();

        run_migrations(&session, &source).unwrap();
        let scripts_after_first = db.script_log().len();

        let report = run_migrations(&session, &source).unwrap();
        assert_eq!(report.outcome, RunOutcome::UpToDate);
        assert_eq!(db.script_log().len(), scripts_after_first);
        assert_eq!(db.records("schema_migrations").len(), 3);
    }

    #[test]
    fn test_new_file_is_applied_on_next_run() {
        let db = FakeDatabase::new();
        let session = db.session();
        run_migrations(&session, &three_migrations()).unwrap();

        let source =
            three_migrations().with_file("004_audit.sql", "CREATE TABLE audit (id BIGINT);");
        let report = run_migrations(&session, &source).unwrap();
        assert_eq!(report.applied(), ["004_audit.sql"]);
    }

    #[test]
    fn test_empty_source_still_creates_bookkeeping_table() {
        let db = FakeDatabase::new();
        let session = db.session();

        let source = MemorySource::new().with_file("notes.txt", "");
        let report = run_migrations(&session, &source).unwrap();

        assert_eq!(report.outcome, RunOutcome::NoMigrations);
        assert_eq!(report.discovered, 0);
        assert!(db.has_table("schema_migrations"));
        assert_eq!(report.phases.last(), Some(&Phase::Done));
        assert_eq!(db.lock_holder(KEY), None);
    }

    #[test]
    fn test_bootstrap_seeds_without_executing_sql() {
        let db = FakeDatabase::new().with_table("tickers");
        let session = db.session();

        let report = run_migrations(&session, &three_migrations()).unwrap();

        assert_eq!(report.outcome, RunOutcome::Bootstrapped { seeded: 3 });
        assert!(report.phases.contains(&Phase::BootstrapPath));
        assert!(!report.phases.contains(&Phase::ApplyPath));
        assert!(db.script_log().is_empty());
        assert!(!db.has_table("posts"));
        assert_eq!(db.records("schema_migrations").len(), 3);

        // Later runs take the normal path
        let report = run_migrations(&session, &three_migrations()).unwrap();
        assert_eq!(report.outcome, RunOutcome::UpToDate);
    }

    #[test]
    fn test_sentinel_ignored_once_records_exist() {
        let db = FakeDatabase::new().with_table("tickers");
        let session = db.session();
        let config = MigrationConfig::default();
        initialize_state_table(&session, &config).unwrap();
        record_migration(&session, &config, "001_tickers.sql", false).unwrap();

        let report = run_migrations(&session, &three_migrations()).unwrap();

        assert_eq!(report.applied(), ["002_posts.sql", "003_users.sql"]);
        assert_eq!(db.script_count("CREATE TABLE posts"), 1);
        assert_eq!(db.script_count("CREATE TABLE tickers"), 0);
        // The detector never ran
        assert!(!db
            .statement_log()
            .iter()
            .any(|s| s.contains("information_schema.tables")));
    }

    #[test]
    fn test_bootstrap_disabled_without_sentinel() {
        let db = FakeDatabase::new().with_table("tickers");
        let session = db.session();
        let config = MigrationConfig {
            sentinel_table: None,
            ..MigrationConfig::default()
        };

        let source =
            MemorySource::new().with_file("001_users.sql", "CREATE TABLE users (id BIGINT);");
        let report = run_migrations_with_config(&session, &source, &config).unwrap();
        assert_eq!(report.applied(), ["001_users.sql"]);
    }

    #[test]
    fn test_failure_stops_the_run_and_keeps_earlier_work() {
        let db = FakeDatabase::new();
        let session = db.session();
        let source = MemorySource::new()
            .with_file("001_a.sql", "CREATE TABLE a (id BIGINT);")
            .with_file(
                "002_b.sql",
                "CREATE TABLE b (id BIGINT); CREATE TABLE exploding (id BIGINT);",
            )
            .with_file("003_c.sql", "CREATE TABLE c (id BIGINT);");
        db.fail_when("CREATE TABLE exploding");

        let err = run_migrations(&session, &source).unwrap_err();

        assert_eq!(err.filename(), Some("002_b.sql"));
        assert!(matches!(
            err,
            MigrationError::Execution {
                cause: ExecutionFailure::Sql(_),
                ..
            }
        ));
        assert_eq!(db.records("schema_migrations"), vec!["001_a.sql"]);
        assert!(db.has_table("a"));
        assert!(!db.has_table("b"));
        assert_eq!(db.script_count("CREATE TABLE c"), 0);
        assert_eq!(db.lock_holder(KEY), None);

        // A later run resumes at the failed file
        db.clear_failures();
        let report = run_migrations(&session, &source).unwrap();
        assert_eq!(report.applied(), ["002_b.sql", "003_c.sql"]);
    }

    #[test]
    fn test_failed_run_records_failed_phase() {
        let db = FakeDatabase::new();
        let session = db.session();
        let config = MigrationConfig::default();
        db.fail_when("CREATE TABLE posts");

        let (phases, result) = Coordinator::new(&session, &config).drive(&three_migrations());

        assert!(result.is_err());
        assert_eq!(
            phases,
            vec![
                Phase::Idle,
                Phase::LockHeld,
                Phase::BookkeepingReady,
                Phase::ApplyPath,
                Phase::Failed
            ]
        );
    }

    #[test]
    fn test_unlock_failure_after_success_is_not_an_error() {
        let db = FakeDatabase::new();
        let session = db.session();
        db.fail_when("pg_advisory_unlock");

        let report = run_migrations(&session, &three_migrations()).unwrap();

        assert_eq!(report.applied().len(), 3);
        assert_eq!(report.phases.last(), Some(&Phase::Done));
        // Still held by the session until it disconnects
        assert_eq!(db.lock_holder(KEY), Some(session.id()));
        drop(session);
        assert_eq!(db.lock_holder(KEY), None);
    }

    #[test]
    fn test_persistence_failure_releases_lock() {
        let db = FakeDatabase::new();
        let session = db.session();
        db.fail_when("CREATE TABLE IF NOT EXISTS");

        let err = run_migrations(&session, &three_migrations()).unwrap_err();

        assert!(matches!(err, MigrationError::Persistence { .. }));
        assert_eq!(db.lock_holder(KEY), None);
        assert!(db.script_log().is_empty());
    }

    #[test]
    fn test_discovery_failure_releases_lock() {
        let db = FakeDatabase::new();
        let session = db.session();
        let missing = tempfile::tempdir().unwrap().path().join("does-not-exist");

        let err = run_migrations(&session, &DirectorySource::new(missing)).unwrap_err();

        assert!(matches!(err, MigrationError::Discovery { .. }));
        assert_eq!(db.lock_holder(KEY), None);
    }

    #[test]
    fn test_orphaned_records_are_reported_not_fatal() {
        let db = FakeDatabase::new();
        let session = db.session();
        let config = MigrationConfig::default();
        initialize_state_table(&session, &config).unwrap();
        record_migration(&session, &config, "000_removed.sql", false).unwrap();

        let report = run_migrations(&session, &three_migrations()).unwrap();
        assert_eq!(report.orphaned, vec!["000_removed.sql"]);
        assert_eq!(report.applied().len(), 3);
    }

    #[test]
    fn test_lock_timeout_while_another_run_holds_it() {
        let db = FakeDatabase::new();
        let holder = db.session();
        let _held = ClusterLock::new(KEY).acquire(&holder).unwrap();

        let config = MigrationConfig {
            lock_timeout_seconds: Some(0),
            ..MigrationConfig::default()
        };
        let waiter = db.session();
        let err = run_migrations_with_config(&waiter, &three_migrations(), &config).unwrap_err();

        assert!(matches!(err, MigrationError::LockAcquisition { .. }));
        assert!(!db.has_table("schema_migrations"));
    }

    #[test]
    fn test_concurrent_runs_execute_each_migration_once() {
        let db = FakeDatabase::new();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let db = db.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let session = db.session();
                    barrier.wait();
                    run_migrations(&session, &three_migrations()).unwrap()
                })
            })
            .collect();
        let reports: Vec<RunReport> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for fragment in ["CREATE TABLE tickers", "CREATE TABLE posts", "CREATE TABLE users"] {
            assert_eq!(db.script_count(fragment), 1, "{fragment} ran more than once");
        }
        let applied: usize = reports.iter().map(|r| r.applied().len()).sum();
        assert_eq!(applied, 3);
        assert!(reports.iter().any(|r| r.outcome == RunOutcome::UpToDate));
        assert_eq!(db.records("schema_migrations").len(), 3);
        assert_eq!(db.lock_holder(KEY), None);
    }
}
