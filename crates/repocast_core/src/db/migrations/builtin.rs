//! Built-in migrations shipped with this binary.
//!
//! Bodies guard their DDL with existence checks: a failure after a
//! committed schema change but before the log write re-runs `up` from
//! scratch on the next apply.

use super::{Migration, MigrationManager};
use crate::db::DbError;
use rusqlite::Transaction;

pub(super) fn register_builtin_migrations(manager: &MigrationManager) {
    manager.register(
        Migration::new(
            "2024_06_001",
            "index group dependencies by target external id",
            index_dependency_targets,
        )
        .with_down(drop_dependency_target_index),
    );
    manager.register(Migration::new(
        "2024_06_002",
        "trim whitespace around stored external ids",
        trim_external_ids,
    ));
}

fn index_dependency_targets(tx: &Transaction<'_>) -> Result<(), DbError> {
    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_group_dependencies_target
         ON group_dependencies(depends_on_external_id);",
    )?;
    Ok(())
}

fn drop_dependency_target_index(tx: &Transaction<'_>) -> Result<(), DbError> {
    tx.execute_batch("DROP INDEX IF EXISTS idx_group_dependencies_target;")?;
    Ok(())
}

// Space, tab, LF, VT, FF and CR: every padding character the id format rejects.
const PADDING: &str = "' ' || char(9) || char(10) || char(11) || char(12) || char(13)";

// One-way: the original padding is not recoverable.
fn trim_external_ids(tx: &Transaction<'_>) -> Result<(), DbError> {
    let collisions: i64 = tx.query_row(
        &format!(
            "SELECT COUNT(*) FROM (
                SELECT config_id, trim(external_id, {PADDING}) AS trimmed
                FROM groups
                GROUP BY config_id, trimmed
                HAVING COUNT(*) > 1
            );"
        ),
        [],
        |row| row.get(0),
    )?;
    if collisions > 0 {
        return Err(DbError::Aborted(format!(
            "{collisions} group external id(s) collide after trimming whitespace"
        )));
    }

    tx.execute_batch(&format!(
        "UPDATE groups SET external_id = trim(external_id, {PADDING})
         WHERE external_id <> trim(external_id, {PADDING});
         INSERT OR IGNORE INTO group_dependencies (group_id, depends_on_external_id)
         SELECT group_id, trim(depends_on_external_id, {PADDING})
         FROM group_dependencies
         WHERE depends_on_external_id <> trim(depends_on_external_id, {PADDING});
         DELETE FROM group_dependencies
         WHERE depends_on_external_id <> trim(depends_on_external_id, {PADDING});"
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{register_builtin_migrations, trim_external_ids};
    use crate::db::migrations::MigrationManager;
    use crate::db::schema::create_schema;
    use crate::db::DbError;
    use rusqlite::Connection;

    fn schema_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        conn.execute("INSERT INTO configs (id, name) VALUES (1, 'main');", [])
            .unwrap();
        conn
    }

    #[test]
    fn builtin_versions_are_registered_in_order() {
        let manager = MigrationManager::new();
        register_builtin_migrations(&manager);
        assert_eq!(
            manager.registered_versions(),
            vec!["2024_06_001".to_string(), "2024_06_002".to_string()]
        );
    }

    #[test]
    fn trim_external_ids_normalizes_groups_and_edges() {
        let mut conn = schema_conn();
        conn.execute_batch(
            "INSERT INTO groups (id, config_id, external_id, name) VALUES (1, 1, ' base ', 'Base');
             INSERT INTO groups (id, config_id, external_id, name) VALUES (2, 1, 'app', 'App');
             INSERT INTO groups (id, config_id, external_id, name)
                 VALUES (3, 1, 'tool' || char(9), 'Tool');
             INSERT INTO groups (id, config_id, external_id, name)
                 VALUES (4, 1, char(13) || char(10) || 'docs', 'Docs');
             INSERT INTO group_dependencies (group_id, depends_on_external_id) VALUES (2, ' base');
             INSERT INTO group_dependencies (group_id, depends_on_external_id)
                 VALUES (2, 'tool' || char(10));",
        )
        .unwrap();

        let tx = conn.transaction().unwrap();
        trim_external_ids(&tx).unwrap();
        tx.commit().unwrap();

        let mut stmt = conn
            .prepare("SELECT external_id FROM groups ORDER BY id;")
            .unwrap();
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(ids, vec!["base", "app", "tool", "docs"]);
        let mut stmt = conn
            .prepare(
                "SELECT depends_on_external_id FROM group_dependencies
                 WHERE group_id = 2 ORDER BY depends_on_external_id;",
            )
            .unwrap();
        let targets: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(targets, vec!["base", "tool"]);
    }

    #[test]
    fn trim_external_ids_aborts_on_collision() {
        let mut conn = schema_conn();
        conn.execute_batch(
            "INSERT INTO groups (config_id, external_id, name) VALUES (1, 'base', 'Base');
             INSERT INTO groups (config_id, external_id, name) VALUES (1, 'base ', 'Base 2');",
        )
        .unwrap();

        let tx = conn.transaction().unwrap();
        let err = trim_external_ids(&tx).unwrap_err();
        assert!(matches!(err, DbError::Aborted(_)));
    }

    #[test]
    fn trim_external_ids_treats_tab_padding_as_collision() {
        let mut conn = schema_conn();
        conn.execute_batch(
            "INSERT INTO groups (config_id, external_id, name) VALUES (1, 'base', 'Base');
             INSERT INTO groups (config_id, external_id, name)
                 VALUES (1, 'base' || char(9), 'Base 2');",
        )
        .unwrap();

        let tx = conn.transaction().unwrap();
        let err = trim_external_ids(&tx).unwrap_err();
        assert!(matches!(err, DbError::Aborted(_)));
    }
}
