//! Bookkeeping table management
//!
//! One row per applied (or seeded) migration:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS "public"."schema_migrations" (
//!     "filename"   varchar(255) NOT NULL PRIMARY KEY,
//!     "applied_at" timestamp with time zone NOT NULL DEFAULT CURRENT_TIMESTAMP
//! )
//! ```
//!
//! Rows are only ever inserted.

use crate::config::MigrationConfig;
use crate::executor::{DbError, Executor};
use crate::migration::record::MigrationRecord;
use crate::migration::MigrationError;
use sea_query::{Alias, ColumnDef, Expr, PostgresQueryBuilder, Table, TableCreateStatement};
use std::collections::HashSet;

/// Quote an SQL identifier: `my"table` -> `"my""table"`.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Schema-qualified, quoted bookkeeping table name.
pub fn qualified_table(config: &MigrationConfig) -> String {
    format!(
        "{}.{}",
        quote_ident(&config.schema),
        quote_ident(&config.bookkeeping_table)
    )
}

/// `CREATE TABLE IF NOT EXISTS` statement for the bookkeeping table
pub fn create_state_table(config: &MigrationConfig) -> TableCreateStatement {
    Table::create()
        .table((Alias::new(config.schema.as_str()), Alias::new(config.bookkeeping_table.as_str())))
        .if_not_exists()
        .col(
            ColumnDef::new(Alias::new("filename"))
                .string_len(255)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(Alias::new("applied_at"))
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_owned()
}

/// Create the bookkeeping table if it does not exist
///
/// # Errors
///
/// Returns `MigrationError::Persistence` if the DDL fails.
pub fn initialize_state_table(
    executor: &dyn Executor,
    config: &MigrationConfig,
) -> Result<(), MigrationError> {
    let sql = create_state_table(config).to_string(PostgresQueryBuilder);
    executor
        .execute(&sql, &[])
        .map_err(|e| {
            MigrationError::persistence("create bookkeeping table", &config.bookkeeping_table, e)
        })?;
    Ok(())
}

/// Whether a table exists in `schema`
///
/// # Errors
///
/// Returns `DbError` if the catalog query fails.
pub fn table_exists(executor: &dyn Executor, schema: &str, table: &str) -> Result<bool, DbError> {
    let sql = r#"
        SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = $1 AND table_name = $2
        )::text
    "#;
    let rows = executor.query_text(sql, &[&schema, &table])?;
    match rows.first().and_then(|row| row.first()).and_then(|v| v.as_deref()) {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        other => Err(DbError::ParseError(format!(
            "unexpected EXISTS result: {other:?}"
        ))),
    }
}

/// Load the filenames of every applied migration
///
/// # Errors
///
/// Returns `MigrationError::Persistence` on read failure.
pub fn load_applied(
    executor: &dyn Executor,
    config: &MigrationConfig,
) -> Result<HashSet<String>, MigrationError> {
    let sql = format!("SELECT filename FROM {}", qualified_table(config));
    let rows = executor
        .query_text(&sql, &[])
        .map_err(|e| {
            MigrationError::persistence("load applied migrations", &config.bookkeeping_table, e)
        })?;

    rows.into_iter()
        .map(|row| {
            row.into_iter().next().flatten().ok_or_else(|| {
                MigrationError::persistence(
                    "load applied migrations",
                    &config.bookkeeping_table,
                    DbError::ParseError("NULL filename".to_string()),
                )
            })
        })
        .collect()
}

/// Load applied records with their timestamps, ordered by filename
///
/// # Errors
///
/// Returns `MigrationError::Persistence` on read or timestamp parse failure.
pub fn load_records(
    executor: &dyn Executor,
    config: &MigrationConfig,
) -> Result<Vec<MigrationRecord>, MigrationError> {
    let sql = format!(
        r#"SELECT filename, to_char(applied_at AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS.US')
           FROM {} ORDER BY filename"#,
        qualified_table(config)
    );
    let rows = executor
        .query_text(&sql, &[])
        .map_err(|e| {
            MigrationError::persistence("load migration records", &config.bookkeeping_table, e)
        })?;

    rows.iter()
        .map(|row| {
            MigrationRecord::from_text_row(row).map_err(|e| {
                MigrationError::persistence("load migration records", &config.bookkeeping_table, e)
            })
        })
        .collect()
}

/// `INSERT` for one record; `tolerate_conflict` adds `ON CONFLICT DO NOTHING`.
pub(crate) fn insert_sql(config: &MigrationConfig, tolerate_conflict: bool) -> String {
    let mut sql = format!("INSERT INTO {} (filename) VALUES ($1)", qualified_table(config));
    if tolerate_conflict {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }
    sql
}

/// Insert one record. Runs on whatever executor it is given, normally a transaction.
///
/// # Errors
///
/// Returns `DbError` if the insert fails, including a duplicate filename when
/// `tolerate_conflict` is false.
pub fn record_migration(
    executor: &dyn Executor,
    config: &MigrationConfig,
    filename: &str,
    tolerate_conflict: bool,
) -> Result<u64, DbError> {
    executor.execute(&insert_sql(config, tolerate_conflict), &[&filename])
}
