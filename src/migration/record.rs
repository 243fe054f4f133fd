//! `MigrationRecord` - Represents rows of the bookkeeping table

use crate::executor::{DbError, TextRow};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

/// Formats `applied_at` may come back in, depending on how it was rendered.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// One applied (or seeded) migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub filename: String,
    /// When the row was inserted (UTC)
    pub applied_at: DateTime<Utc>,
}

impl MigrationRecord {
    /// Build a record from a `(filename, applied_at)` text row.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ParseError` if a column is missing/NULL or the timestamp
    /// is in none of the known formats.
    pub fn from_text_row(row: &TextRow) -> Result<Self, DbError> {
        let filename = row
            .first()
            .cloned()
            .flatten()
            .ok_or_else(|| DbError::ParseError("missing filename column".to_string()))?;
        let raw = row
            .get(1)
            .and_then(|v| v.as_deref())
            .ok_or_else(|| DbError::ParseError(format!("missing applied_at for {filename}")))?;

        Ok(Self {
            applied_at: parse_timestamp(raw)?,
            filename,
        })
    }
}

/// Parse a UTC timestamp rendered without zone information.
///
/// # Errors
///
/// Returns `DbError::ParseError` for unrecognized formats.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DbError> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw.trim(), fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            DbError::ParseError(format!(
                "Failed to parse timestamp '{raw}': unrecognized format"
            ))
        })
}
