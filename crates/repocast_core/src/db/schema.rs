//! Declarative configuration-graph schema.
//!
//! Every statement is `IF NOT EXISTS`, so creating the schema on an
//! existing store is a no-op. Evolutions after the first release go through
//! `db::migrations`, not through edits here.

use super::DbResult;
use rusqlite::Connection;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

CREATE TABLE IF NOT EXISTS groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    config_id INTEGER NOT NULL REFERENCES configs(id) ON DELETE CASCADE,
    external_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    priority INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    UNIQUE (config_id, external_id)
);

CREATE TABLE IF NOT EXISTS group_dependencies (
    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    depends_on_external_id TEXT NOT NULL,
    PRIMARY KEY (group_id, depends_on_external_id)
);

CREATE TABLE IF NOT EXISTS group_targets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    repo TEXT NOT NULL,
    branch TEXT,
    UNIQUE (group_id, repo)
);

CREATE TABLE IF NOT EXISTS file_mappings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    source_path TEXT NOT NULL,
    dest_path TEXT NOT NULL,
    is_directory INTEGER NOT NULL DEFAULT 0 CHECK (is_directory IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_groups_config ON groups(config_id);
CREATE INDEX IF NOT EXISTS idx_group_targets_group ON group_targets(group_id);
CREATE INDEX IF NOT EXISTS idx_file_mappings_group ON file_mappings(group_id);
"#;

/// Creates all declarative tables and indexes.
pub fn create_schema(conn: &Connection) -> DbResult<()> {
    conn.execute_batch(CREATE_TABLES)?;
    Ok(())
}

/// Returns whether a table with `table_name` exists.
pub fn table_exists(conn: &Connection, table_name: &str) -> DbResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1
        );",
        [table_name],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

/// Returns whether an index named `index_name` exists.
pub fn index_exists(conn: &Connection, index_name: &str) -> DbResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1
        );",
        [index_name],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}
