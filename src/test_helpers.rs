//! In-memory stand-in for a PostgreSQL database.
//!
//! [`FakeDatabase`] understands exactly the statements the coordinator issues:
//! session-scoped advisory locks, `BEGIN`/`COMMIT`/`ROLLBACK`, `CREATE TABLE`,
//! bookkeeping inserts and selects, and `information_schema` existence checks.
//! Each [`FakeSession`] behaves like one connection: its staged transaction is
//! invisible to other sessions, and dropping it releases its advisory locks the
//! way a disconnect does on a real server.
//!
//! Enabled under `cfg(test)` and with the `test-helpers` feature.

use crate::executor::{DbError, Executor, TextRow};
use bytes::BytesMut;
use chrono::{Duration, NaiveDate};
use may_postgres::types::{ToSql, Type};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

static CREATE_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r#"(?i)^CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?"#,
        r#"((?:"[^"]+"|[\w]+)(?:\.(?:"[^"]+"|[\w]+))?)"#,
    ))
    .unwrap()
});

static INSERT_INTO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^INSERT\s+INTO\s+((?:"[^"]+"|[\w]+)(?:\.(?:"[^"]+"|[\w]+))?)"#).unwrap()
});

static SELECT_FROM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bFROM\s+((?:"[^"]+"|[\w]+)(?:\.(?:"[^"]+"|[\w]+))?)"#).unwrap()
});

/// Strip schema qualification and identifier quoting: `"public"."t"` -> `t`.
fn bare_table_name(qualified: &str) -> String {
    let last = qualified.rsplit('.').next().unwrap_or(qualified);
    if last.starts_with('"') && last.ends_with('"') && last.len() >= 2 {
        last[1..last.len() - 1].replace("\"\"", "\"")
    } else {
        last.to_ascii_lowercase()
    }
}

fn text_param(params: &[&dyn ToSql], idx: usize) -> Result<String, DbError> {
    let param = params
        .get(idx)
        .ok_or_else(|| DbError::QueryError(format!("missing parameter ${}", idx + 1)))?;
    let mut buf = BytesMut::new();
    param
        .to_sql_checked(&Type::TEXT, &mut buf)
        .map_err(|e| DbError::ParseError(format!("parameter ${} is not text: {e}", idx + 1)))?;
    String::from_utf8(buf.to_vec())
        .map_err(|e| DbError::ParseError(format!("parameter ${} is not utf-8: {e}", idx + 1)))
}

fn int8_param(params: &[&dyn ToSql], idx: usize) -> Result<i64, DbError> {
    let param = params
        .get(idx)
        .ok_or_else(|| DbError::QueryError(format!("missing parameter ${}", idx + 1)))?;
    let mut buf = BytesMut::new();
    param
        .to_sql_checked(&Type::INT8, &mut buf)
        .map_err(|e| DbError::ParseError(format!("parameter ${} is not bigint: {e}", idx + 1)))?;
    let bytes: [u8; 8] = buf[..]
        .try_into()
        .map_err(|_| DbError::ParseError(format!("parameter ${} has bad width", idx + 1)))?;
    Ok(i64::from_be_bytes(bytes))
}

fn bool_row(value: bool) -> Vec<TextRow> {
    vec![vec![Some(value.to_string())]]
}

#[derive(Default)]
struct State {
    tables: BTreeSet<String>,
    /// Committed bookkeeping rows, keyed by table, in insertion order.
    records: HashMap<String, Vec<String>>,
    /// Advisory lock key -> (holding session, re-entry count).
    advisory: HashMap<i64, (u64, u32)>,
    statement_log: Vec<String>,
    script_log: Vec<String>,
    failures: Vec<String>,
}

impl State {
    fn check_failure(&self, statement: &str, params: &[String]) -> Result<(), DbError> {
        for fragment in &self.failures {
            if statement.contains(fragment.as_str())
                || params.iter().any(|p| p.contains(fragment.as_str()))
            {
                return Err(DbError::QueryError(format!("injected failure on '{fragment}'")));
            }
        }
        Ok(())
    }
}

struct Shared {
    state: Mutex<State>,
    lock_released: Condvar,
    next_session: AtomicU64,
}

/// Shared in-memory database. Cheap to clone; clones observe the same state.
#[derive(Clone)]
pub struct FakeDatabase {
    shared: Arc<Shared>,
}

impl Default for FakeDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                lock_released: Condvar::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Pre-create a table, as if provisioned outside the coordinator.
    pub fn with_table(self, name: &str) -> Self {
        self.state().tables.insert(name.to_string());
        self
    }

    /// Make every statement, script statement, or parameter containing `fragment` fail.
    pub fn fail_when(&self, fragment: &str) {
        self.state().failures.push(fragment.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Open a new session (one "connection").
    pub fn session(&self) -> FakeSession {
        FakeSession {
            id: self.shared.next_session.fetch_add(1, Ordering::SeqCst),
            shared: Arc::clone(&self.shared),
            tx: Mutex::new(None),
        }
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state().tables.contains(name)
    }

    /// Committed bookkeeping filenames of `table`, in insertion order.
    pub fn records(&self, table: &str) -> Vec<String> {
        self.state().records.get(table).cloned().unwrap_or_default()
    }

    /// Every statement seen by any session, trimmed.
    pub fn statement_log(&self) -> Vec<String> {
        self.state().statement_log.clone()
    }

    /// Every script passed to `batch_execute`, including failed attempts.
    pub fn script_log(&self) -> Vec<String> {
        self.state().script_log.clone()
    }

    /// How many times a script containing `fragment` was executed.
    pub fn script_count(&self, fragment: &str) -> usize {
        self.state()
            .script_log
            .iter()
            .filter(|s| s.contains(fragment))
            .count()
    }

    pub fn lock_holder(&self, key: i64) -> Option<u64> {
        self.state().advisory.get(&key).map(|(session, _)| *session)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock_state(&self.shared)
    }
}

fn lock_state(shared: &Shared) -> MutexGuard<'_, State> {
    shared.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Staged {
    tables: Vec<String>,
    records: Vec<(String, String)>,
}

/// One connection to a [`FakeDatabase`].
pub struct FakeSession {
    id: u64,
    shared: Arc<Shared>,
    tx: Mutex<Option<Staged>>,
}

impl FakeSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn staged(&self) -> MutexGuard<'_, Option<Staged>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn table_visible(&self, state: &State, name: &str) -> bool {
        state.tables.contains(name)
            || self
                .staged()
                .as_ref()
                .is_some_and(|tx| tx.tables.iter().any(|t| t == name))
    }

    fn visible_records(&self, state: &State, table: &str) -> Vec<String> {
        let mut rows = state.records.get(table).cloned().unwrap_or_default();
        if let Some(tx) = self.staged().as_ref() {
            rows.extend(tx.records.iter().filter(|(t, _)| t == table).map(|(_, f)| f.clone()));
        }
        rows
    }

    fn create_table(
        &self,
        state: &mut State,
        name: String,
        if_not_exists: bool,
    ) -> Result<(), DbError> {
        if self.table_visible(state, &name) {
            if if_not_exists {
                return Ok(());
            }
            return Err(DbError::QueryError(format!("relation \"{name}\" already exists")));
        }
        match self.staged().as_mut() {
            Some(tx) => tx.tables.push(name),
            None => {
                state.tables.insert(name);
            }
        }
        Ok(())
    }

    fn insert(
        &self,
        state: &mut State,
        table: String,
        filename: String,
        tolerate_conflict: bool,
    ) -> Result<u64, DbError> {
        if !self.table_visible(state, &table) {
            return Err(DbError::QueryError(format!("relation \"{table}\" does not exist")));
        }
        if self.visible_records(state, &table).contains(&filename) {
            if tolerate_conflict {
                return Ok(0);
            }
            return Err(DbError::QueryError(format!(
                "duplicate key value violates unique constraint \"{table}_pkey\""
            )));
        }
        match self.staged().as_mut() {
            Some(tx) => tx.records.push((table, filename)),
            None => state.records.entry(table).or_default().push(filename),
        }
        Ok(1)
    }

    fn commit(&self, state: &mut State) {
        if let Some(tx) = self.staged().take() {
            state.tables.extend(tx.tables);
            for (table, filename) in tx.records {
                state.records.entry(table).or_default().push(filename);
            }
        }
    }

    fn advisory_lock(&self, key: i64) {
        let mut state = lock_state(&self.shared);
        while !Self::try_advisory_lock(&mut state, self.id, key) {
            state = self
                .shared
                .lock_released
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn try_advisory_lock(state: &mut State, session: u64, key: i64) -> bool {
        let entry = state.advisory.entry(key).or_insert((session, 0));
        if entry.0 != session {
            return false;
        }
        entry.1 += 1;
        true
    }

    fn advisory_unlock(&self, state: &mut State, key: i64) -> bool {
        let Some(entry) = state.advisory.get_mut(&key) else {
            return false;
        };
        if entry.0 != self.id {
            return false;
        }
        entry.1 -= 1;
        if entry.1 == 0 {
            state.advisory.remove(&key);
            self.shared.lock_released.notify_all();
        }
        true
    }

    /// Apply one statement of a script or a plain `execute` call.
    fn run_statement(&self, state: &mut State, statement: &str) -> Result<(), DbError> {
        state.check_failure(statement, &[])?;
        if let Some(caps) = CREATE_TABLE.captures(statement) {
            let if_not_exists = statement.to_ascii_uppercase().contains("IF NOT EXISTS");
            self.create_table(state, bare_table_name(&caps[1]), if_not_exists)?;
        }
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        // Disconnect: discard the open transaction and free advisory locks.
        self.staged().take();
        let mut state = lock_state(&self.shared);
        let before = state.advisory.len();
        state.advisory.retain(|_, (holder, _)| *holder != self.id);
        if state.advisory.len() != before {
            self.shared.lock_released.notify_all();
        }
    }
}

impl Executor for FakeSession {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        let statement = query.trim();
        let upper = statement.to_ascii_uppercase();

        if upper.starts_with("SELECT PG_ADVISORY_LOCK(") {
            let key = int8_param(params, 0)?;
            {
                let mut state = lock_state(&self.shared);
                state.statement_log.push(statement.to_string());
                state.check_failure(statement, &[])?;
            }
            self.advisory_lock(key);
            return Ok(1);
        }

        let mut state = lock_state(&self.shared);
        state.statement_log.push(statement.to_string());

        match upper.as_str() {
            "BEGIN" => {
                state.check_failure(statement, &[])?;
                let mut tx = self.staged();
                if tx.is_some() {
                    return Err(DbError::QueryError(
                        "there is already a transaction in progress".into(),
                    ));
                }
                *tx = Some(Staged::default());
                return Ok(0);
            }
            "COMMIT" => {
                if let Err(e) = state.check_failure(statement, &[]) {
                    self.staged().take();
                    return Err(e);
                }
                self.commit(&mut state);
                return Ok(0);
            }
            "ROLLBACK" => {
                self.staged().take();
                return Ok(0);
            }
            _ => {}
        }

        if let Some(caps) = INSERT_INTO.captures(statement) {
            let filename = text_param(params, 0)?;
            state.check_failure(statement, std::slice::from_ref(&filename))?;
            let tolerate_conflict = upper.contains("ON CONFLICT");
            return self.insert(&mut state, bare_table_name(&caps[1]), filename, tolerate_conflict);
        }

        self.run_statement(&mut state, statement)?;
        Ok(0)
    }

    fn batch_execute(&self, script: &str) -> Result<(), DbError> {
        let mut state = lock_state(&self.shared);
        state.script_log.push(script.to_string());
        for statement in script.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            state.statement_log.push(statement.to_string());
            self.run_statement(&mut state, statement)?;
        }
        Ok(())
    }

    fn query_text(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<TextRow>, DbError> {
        let statement = query.trim();
        let upper = statement.to_ascii_uppercase();
        let mut state = lock_state(&self.shared);
        state.statement_log.push(statement.to_string());
        state.check_failure(statement, &[])?;

        if upper.contains("PG_TRY_ADVISORY_LOCK(") {
            let key = int8_param(params, 0)?;
            return Ok(bool_row(Self::try_advisory_lock(&mut state, self.id, key)));
        }
        if upper.contains("PG_ADVISORY_UNLOCK(") {
            let key = int8_param(params, 0)?;
            return Ok(bool_row(self.advisory_unlock(&mut state, key)));
        }
        if upper.contains("INFORMATION_SCHEMA.TABLES") {
            let table = text_param(params, 1)?;
            return Ok(bool_row(self.table_visible(&state, &table)));
        }
        if let Some(caps) = SELECT_FROM.captures(statement) {
            let table = bare_table_name(&caps[1]);
            if !self.table_visible(&state, &table) {
                return Err(DbError::QueryError(format!("relation \"{table}\" does not exist")));
            }
            let with_timestamp = upper.contains("TO_CHAR(");
            let base = NaiveDate::from_ymd_opt(2024, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .ok_or_else(|| DbError::Other("bad base timestamp".into()))?;
            let mut rows = self.visible_records(&state, &table);
            if upper.contains("ORDER BY") {
                rows.sort();
            }
            return Ok(rows
                .into_iter()
                .enumerate()
                .map(|(idx, filename)| {
                    let mut row = vec![Some(filename)];
                    if with_timestamp {
                        let at = base + Duration::seconds(idx as i64);
                        row.push(Some(at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()));
                    }
                    row
                })
                .collect());
        }
        Ok(Vec::new())
    }
}
