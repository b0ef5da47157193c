use repocast_core::db::migrations::LOG_TABLE;
use repocast_core::db::schema::{index_exists, table_exists};
use repocast_core::db::{open_db, open_db_in_memory, DbError};
use repocast_core::{Migration, MigrationError, MigrationManager, MigrationRecord};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_creates_schema_and_applies_builtins() {
    let manager = MigrationManager::with_builtin_migrations();
    let conn = open_db_in_memory(&manager).unwrap();

    for table in [
        "configs",
        "groups",
        "group_dependencies",
        "group_targets",
        "file_mappings",
        LOG_TABLE,
    ] {
        assert!(table_exists(&conn, table).unwrap(), "table {table} does not exist");
    }
    assert!(index_exists(&conn, "idx_group_dependencies_target").unwrap());
    assert!(manager.pending(&conn).unwrap().is_empty());
    assert_eq!(
        applied_versions(&manager, &conn),
        manager.registered_versions()
    );
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("repocast.db");

    let first_manager = MigrationManager::with_builtin_migrations();
    let conn_first = open_db(&path, &first_manager).unwrap();
    let first = first_manager.applied(&conn_first).unwrap();
    drop(conn_first);

    let second_manager = MigrationManager::with_builtin_migrations();
    let mut conn_second = open_db(&path, &second_manager).unwrap();
    let second = second_manager.applied(&conn_second).unwrap();

    assert_eq!(first, second);
    assert!(second_manager.apply(&mut conn_second).unwrap().is_empty());
}

#[test]
fn latest_builtin_is_one_way_and_stays_applied() {
    let manager = MigrationManager::with_builtin_migrations();
    let mut conn = open_db_in_memory(&manager).unwrap();

    let err = manager.rollback(&mut conn).unwrap_err();
    assert!(matches!(err, MigrationError::NoRollbackFunction(_)));
    assert!(index_exists(&conn, "idx_group_dependencies_target").unwrap());
}

#[test]
fn one_manager_bootstraps_several_stores() {
    let manager = MigrationManager::with_builtin_migrations();

    let first = open_db_in_memory(&manager).unwrap();
    let second = open_db_in_memory(&manager).unwrap();

    for conn in [&first, &second] {
        assert!(table_exists(conn, LOG_TABLE).unwrap());
        assert!(manager.pending(conn).unwrap().is_empty());
        assert_eq!(
            applied_versions(&manager, conn),
            manager.registered_versions()
        );
    }
}

#[test]
fn rollback_on_a_fresh_store_reports_nothing_to_roll_back() {
    let manager = MigrationManager::with_builtin_migrations();
    let _first = open_db_in_memory(&manager).unwrap();

    let mut untouched = Connection::open_in_memory().unwrap();
    let err = manager.rollback(&mut untouched).unwrap_err();

    assert!(matches!(err, MigrationError::NothingToRollBack));
    assert!(table_exists(&untouched, LOG_TABLE).unwrap());
}

#[test]
fn failing_migration_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.db");
    let manager = MigrationManager::with_builtin_migrations();
    manager.register(Migration::new("2099_01_001", "always fails", |_tx| {
        Err(DbError::Aborted("refusing".into()))
    }));

    let err = open_db(&path, &manager).unwrap_err();

    match err {
        DbError::Migration(inner) => assert_eq!(inner.version(), Some("2099_01_001")),
        other => panic!("unexpected error: {other}"),
    }

    let conn = Connection::open(&path).unwrap();
    let logged: i64 = conn
        .query_row("SELECT COUNT(*) FROM schema_migrations;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(logged, 2);
}

#[test]
fn padded_external_ids_are_trimmed_on_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.db");
    {
        let conn = Connection::open(&path).unwrap();
        repocast_core::db::schema::create_schema(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO configs (id, name) VALUES (1, 'legacy');
             INSERT INTO groups (id, config_id, external_id, name) VALUES (1, 1, 'base' || char(9), 'Base');
             INSERT INTO groups (id, config_id, external_id, name) VALUES (2, 1, 'app', 'App');
             INSERT INTO group_dependencies (group_id, depends_on_external_id) VALUES (2, ' base');",
        )
        .unwrap();
    }

    let manager = MigrationManager::with_builtin_migrations();
    let conn = open_db(&path, &manager).unwrap();

    repocast_core::validate_group_dependencies(&conn, 1).unwrap();
    let order: Vec<String> = repocast_core::resolve_processing_order(&conn, 1)
        .unwrap()
        .into_iter()
        .map(|group| group.external_id)
        .collect();
    assert_eq!(order, vec!["base", "app"]);
}

#[test]
fn applied_records_serialize_with_utc_timestamps() {
    let manager = MigrationManager::with_builtin_migrations();
    let conn = open_db_in_memory(&manager).unwrap();
    let records = manager.applied(&conn).unwrap();

    let json = serde_json::to_value(&records).unwrap();

    assert_eq!(json[0]["version"], "2024_06_001");
    assert_eq!(json[0]["checksum"], records[0].checksum.as_str());
    let applied_at = json[0]["applied_at"].as_str().unwrap();
    assert!(applied_at.ends_with('Z'), "unexpected timestamp {applied_at}");

    let decoded: Vec<MigrationRecord> = serde_json::from_value(json).unwrap();
    assert_eq!(decoded, records);
}

fn applied_versions(manager: &MigrationManager, conn: &Connection) -> Vec<String> {
    manager
        .applied(conn)
        .unwrap()
        .into_iter()
        .map(|record| record.version)
        .collect()
}
