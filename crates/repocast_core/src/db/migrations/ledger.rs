//! Persisted migration log (`schema_migrations`).
//!
//! One row per applied version. Rows are inserted by apply and deleted by
//! rollback, always inside the same transaction as the migration body.

use super::{MigrationError, MigrationResult};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

pub const LOG_TABLE: &str = "schema_migrations";

const CREATE_LOG_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL,
    description TEXT NOT NULL,
    checksum TEXT NOT NULL
);";

const RECORD_SELECT_SQL: &str = "SELECT version, applied_at, description, checksum
FROM schema_migrations";

/// One applied migration as recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub applied_at: DateTime<Utc>,
    pub description: String,
    /// Hex SHA-256 of `version:description` at apply time.
    pub checksum: String,
}

pub(crate) fn create_log_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_LOG_TABLE_SQL)
}

pub(crate) fn log_table_exists(conn: &Connection) -> rusqlite::Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1);",
        [LOG_TABLE],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

pub(crate) fn applied_versions(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations;")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(versions)
}

pub(crate) fn is_logged(conn: &Connection, version: &str) -> rusqlite::Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1);",
        [version],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

pub(crate) fn insert_record(
    conn: &Connection,
    version: &str,
    description: &str,
    checksum: &str,
    applied_at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description, checksum)
         VALUES (?1, ?2, ?3, ?4);",
        params![version, format_timestamp(applied_at), description, checksum],
    )?;
    Ok(())
}

pub(crate) fn delete_record(conn: &Connection, version: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM schema_migrations WHERE version = ?1;", [version])
}

/// Most recently applied record; insertion order breaks timestamp ties.
pub(crate) fn latest_record(conn: &Connection) -> MigrationResult<Option<MigrationRecord>> {
    let raw = conn
        .query_row(
            &format!("{RECORD_SELECT_SQL} ORDER BY applied_at DESC, rowid DESC LIMIT 1;"),
            [],
            read_raw_record,
        )
        .optional()
        .map_err(MigrationError::storage("read latest migration record"))?;
    raw.map(RawRecord::into_record).transpose()
}

pub(crate) fn list_records(conn: &Connection) -> MigrationResult<Vec<MigrationRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "{RECORD_SELECT_SQL} ORDER BY applied_at ASC, rowid ASC;"
        ))
        .map_err(MigrationError::storage("list migration records"))?;
    let raw_records = stmt
        .query_map([], read_raw_record)
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(MigrationError::storage("list migration records"))?;

    raw_records.into_iter().map(RawRecord::into_record).collect()
}

/// Fingerprint stored alongside each applied version.
pub fn checksum(version: &str, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.as_bytes());
    hasher.update(b":");
    hasher.update(description.as_bytes());
    format!("{:x}", hasher.finalize())
}

// Fixed-width microsecond precision keeps text order equal to time order.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

struct RawRecord {
    version: String,
    applied_at: String,
    description: String,
    checksum: String,
}

impl RawRecord {
    fn into_record(self) -> MigrationResult<MigrationRecord> {
        let applied_at = DateTime::parse_from_rfc3339(&self.applied_at)
            .map_err(|err| {
                MigrationError::InvalidData(format!(
                    "invalid applied_at `{}` for version `{}`: {err}",
                    self.applied_at, self.version
                ))
            })?
            .with_timezone(&Utc);

        Ok(MigrationRecord {
            version: self.version,
            applied_at,
            description: self.description,
            checksum: self.checksum,
        })
    }
}

fn read_raw_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        version: row.get("version")?,
        applied_at: row.get("applied_at")?,
        description: row.get("description")?,
        checksum: row.get("checksum")?,
    })
}
