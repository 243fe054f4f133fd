//! Cluster lock built on PostgreSQL session-level advisory locks
//!
//! All coordinator instances agree on one numeric key. The lock belongs to the
//! database session that took it, so a crashed or disconnected holder releases
//! it automatically and no stale-lock cleanup exists.

use crate::executor::{DbError, Executor};
use crate::migration::MigrationError;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::telemetry::tracing_helpers;

/// Delay between `pg_try_advisory_lock` attempts when a timeout is configured.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Database-scoped mutual exclusion keyed by a fixed number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterLock {
    key: i64,
    timeout: Option<Duration>,
}

impl ClusterLock {
    /// Lock that blocks until available.
    pub fn new(key: i64) -> Self {
        Self { key, timeout: None }
    }

    /// Give up after `timeout` instead of waiting forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// Acquire the lock on the executor's session
    ///
    /// Blocks until the lock is held. With a timeout, polls instead and fails once
    /// the deadline passes.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockAcquisition` if the lock query fails or the
    /// timeout expires.
    pub fn acquire<'a>(
        &self,
        executor: &'a dyn Executor,
    ) -> Result<ClusterLockGuard<'a>, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::acquire_lock_span(self.key).entered();

        let start = Instant::now();
        match self.timeout {
            None => {
                executor
                    .execute("SELECT pg_advisory_lock($1)", &[&self.key])
                    .map_err(|e| self.acquisition_error(e.to_string()))?;
            }
            Some(timeout) => self.poll(executor, timeout)?,
        }

        log::info!(
            "Acquired migration lock {} after {}ms",
            self.key,
            start.elapsed().as_millis()
        );
        Ok(ClusterLockGuard {
            executor,
            key: self.key,
            released: false,
        })
    }

    fn poll(&self, executor: &dyn Executor, timeout: Duration) -> Result<(), MigrationError> {
        let start = Instant::now();
        loop {
            let acquired = try_lock(executor, self.key)
                .map_err(|e| self.acquisition_error(e.to_string()))?;
            if acquired {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(self.acquisition_error(format!(
                    "timed out after {timeout:?} waiting for another migration run"
                )));
            }
            log::debug!("Migration lock {} busy, retrying", self.key);
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn acquisition_error(&self, reason: String) -> MigrationError {
        MigrationError::LockAcquisition { key: self.key, reason }
    }
}

fn bool_result(rows: Vec<crate::executor::TextRow>) -> Result<bool, DbError> {
    match rows.first().and_then(|row| row.first()).and_then(|v| v.as_deref()) {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        other => Err(DbError::ParseError(format!("unexpected advisory lock result: {other:?}"))),
    }
}

fn try_lock(executor: &dyn Executor, key: i64) -> Result<bool, DbError> {
    bool_result(executor.query_text("SELECT pg_try_advisory_lock($1)::text", &[&key])?)
}

fn unlock(executor: &dyn Executor, key: i64) -> Result<bool, DbError> {
    bool_result(executor.query_text("SELECT pg_advisory_unlock($1)::text", &[&key])?)
}

/// Held cluster lock. Released on drop or by [`release`](Self::release).
pub struct ClusterLockGuard<'a> {
    executor: &'a dyn Executor,
    key: i64,
    released: bool,
}

impl<'a> ClusterLockGuard<'a> {
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Session the lock lives on
    pub fn executor(&self) -> &'a dyn Executor {
        self.executor
    }

    /// Release the lock now.
    ///
    /// Returns whether the session actually held it. Failures are logged and
    /// reported as `false`; they never fail a run.
    pub fn release(mut self) -> bool {
        self.release_inner()
    }

    fn release_inner(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        match unlock(self.executor, self.key) {
            Ok(true) => {
                log::debug!("Released migration lock {}", self.key);
                true
            }
            Ok(false) => {
                log::warn!("Migration lock {} was not held by this session at release", self.key);
                false
            }
            Err(e) => {
                // The lock still goes away when the session ends
                log::warn!("Failed to release migration lock {}: {e}", self.key);
                false
            }
        }
    }
}

impl Drop for ClusterLockGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
