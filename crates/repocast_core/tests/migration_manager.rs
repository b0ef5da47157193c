use repocast_core::db::migrations::LOG_TABLE;
use repocast_core::db::schema::{index_exists, table_exists};
use repocast_core::{DbError, Migration, MigrationDirection, MigrationError, MigrationManager};
use rusqlite::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

fn create_table_migration() -> Migration {
    Migration::new("001", "create_table", |tx| {
        tx.execute_batch("CREATE TABLE IF NOT EXISTS widgets (id INTEGER PRIMARY KEY, name TEXT);")?;
        Ok(())
    })
    .with_down(|tx| {
        tx.execute_batch("DROP TABLE IF EXISTS widgets;")?;
        Ok(())
    })
}

fn add_index_migration() -> Migration {
    Migration::new("002", "add_index", |tx| {
        tx.execute_batch("CREATE INDEX IF NOT EXISTS idx_widgets_name ON widgets(name);")?;
        Ok(())
    })
    .with_down(|tx| {
        tx.execute_batch("DROP INDEX IF EXISTS idx_widgets_name;")?;
        Ok(())
    })
}

fn counting_migration(version: &str, counter: Arc<AtomicUsize>) -> Migration {
    Migration::new(version, format!("count {version}"), move |_tx| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

fn log_versions(conn: &Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT version FROM schema_migrations ORDER BY applied_at ASC, rowid ASC;")
        .unwrap();
    stmt.query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<Vec<String>>>()
        .unwrap()
}

#[test]
fn apply_then_rollback_removes_only_latest() {
    let mut conn = Connection::open_in_memory().unwrap();
    let manager = MigrationManager::new();
    manager.register(create_table_migration());
    manager.register(add_index_migration());

    let applied = manager.apply(&mut conn).unwrap();
    assert_eq!(applied, vec!["001", "002"]);
    assert_eq!(log_versions(&conn), vec!["001", "002"]);
    assert!(index_exists(&conn, "idx_widgets_name").unwrap());

    let records = manager.applied(&conn).unwrap();
    assert!(records[0].applied_at <= records[1].applied_at);
    assert_eq!(records[0].description, "create_table");

    let rolled_back = manager.rollback(&mut conn).unwrap();
    assert_eq!(rolled_back.version, "002");
    assert_eq!(log_versions(&conn), vec!["001"]);
    assert!(!index_exists(&conn, "idx_widgets_name").unwrap());
    assert!(table_exists(&conn, "widgets").unwrap());
}

#[test]
fn apply_follows_registration_order_not_version_order() {
    let mut conn = Connection::open_in_memory().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let manager = MigrationManager::new();
    manager.register(counting_migration("b_late", counter.clone()));
    manager.register(counting_migration("a_early", counter.clone()));

    let applied = manager.apply(&mut conn).unwrap();

    assert_eq!(applied, vec!["b_late", "a_early"]);
    assert_eq!(log_versions(&conn), vec!["b_late", "a_early"]);
    let rolled_back = manager.rollback(&mut conn).unwrap_err();
    assert!(matches!(rolled_back, MigrationError::NoRollbackFunction(ref version) if version == "a_early"));
}

#[test]
fn apply_twice_executes_each_migration_once() {
    let mut conn = Connection::open_in_memory().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let manager = MigrationManager::new();
    manager.register(counting_migration("001", counter.clone()));
    manager.register(counting_migration("002", counter.clone()));

    assert_eq!(manager.apply(&mut conn).unwrap().len(), 2);
    let before = log_versions(&conn);

    let second = manager.apply(&mut conn).unwrap();

    assert!(second.is_empty());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(log_versions(&conn), before);
}

#[test]
fn failing_up_rolls_back_its_changes_and_stops() {
    let mut conn = Connection::open_in_memory().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let manager = MigrationManager::new();
    manager.register(create_table_migration());
    manager.register(Migration::new("002", "half done", |tx| {
        tx.execute_batch("CREATE TABLE partial (id INTEGER PRIMARY KEY);")?;
        tx.execute("INSERT INTO widgets (name) VALUES ('orphan');", [])?;
        Err(DbError::Aborted("simulated failure".into()))
    }));
    manager.register(counting_migration("003", counter.clone()));

    let err = manager.apply(&mut conn).unwrap_err();

    match &err {
        MigrationError::ExecutionFailed {
            version, direction, ..
        } => {
            assert_eq!(version, "002");
            assert_eq!(*direction, MigrationDirection::Up);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.version(), Some("002"));
    assert!(err.to_string().contains("002"));
    assert!(!table_exists(&conn, "partial").unwrap());
    let widgets: i64 = conn
        .query_row("SELECT COUNT(*) FROM widgets;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(widgets, 0);
    assert_eq!(log_versions(&conn), vec!["001"]);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(manager.pending(&conn).unwrap(), vec!["002", "003"]);
}

#[test]
fn rollback_without_applied_migrations_reports_nothing_to_roll_back() {
    let mut conn = Connection::open_in_memory().unwrap();
    let manager = MigrationManager::new();
    manager.register(create_table_migration());

    let err = manager.rollback(&mut conn).unwrap_err();

    assert!(matches!(err, MigrationError::NothingToRollBack));
    assert_eq!(err.to_string(), "nothing to roll back");
    assert!(table_exists(&conn, LOG_TABLE).unwrap());
}

#[test]
fn rollback_of_one_way_migration_keeps_log_row() {
    let mut conn = Connection::open_in_memory().unwrap();
    let manager = MigrationManager::new();
    manager.register(create_table_migration());
    manager.register(Migration::new("002", "seed widgets", |tx| {
        tx.execute("INSERT INTO widgets (name) VALUES ('seed');", [])?;
        Ok(())
    }));
    manager.apply(&mut conn).unwrap();

    let err = manager.rollback(&mut conn).unwrap_err();

    assert!(matches!(err, MigrationError::NoRollbackFunction(ref version) if version == "002"));
    assert!(err.to_string().contains("no rollback function"));
    assert_eq!(log_versions(&conn), vec!["001", "002"]);
}

#[test]
fn rollback_of_unregistered_version_reports_not_found() {
    let mut conn = Connection::open_in_memory().unwrap();
    let writer = MigrationManager::new();
    writer.register(create_table_migration());
    writer.apply(&mut conn).unwrap();

    let reader = MigrationManager::new();
    let err = reader.rollback(&mut conn).unwrap_err();

    assert!(matches!(err, MigrationError::NotFound(ref version) if version == "001"));
    assert_eq!(log_versions(&conn), vec!["001"]);
}

#[test]
fn failing_down_keeps_migration_applied() {
    let mut conn = Connection::open_in_memory().unwrap();
    let manager = MigrationManager::new();
    manager.register(
        Migration::new("001", "stubborn", |tx| {
            tx.execute_batch("CREATE TABLE stubborn (id INTEGER);")?;
            Ok(())
        })
        .with_down(|tx| {
            tx.execute_batch("DROP TABLE stubborn;")?;
            Err(DbError::Aborted("cannot undo".into()))
        }),
    );
    manager.apply(&mut conn).unwrap();

    let err = manager.rollback(&mut conn).unwrap_err();

    assert!(matches!(
        err,
        MigrationError::ExecutionFailed {
            direction: MigrationDirection::Down,
            ..
        }
    ));
    assert!(table_exists(&conn, "stubborn").unwrap());
    assert_eq!(log_versions(&conn), vec!["001"]);
}

#[test]
fn checksum_drift_reports_changed_descriptions_only() {
    let mut conn = Connection::open_in_memory().unwrap();
    let original = MigrationManager::new();
    original.register(create_table_migration());
    original.register(add_index_migration());
    original.apply(&mut conn).unwrap();
    assert!(original.checksum_drift(&conn).unwrap().is_empty());

    let edited = MigrationManager::new();
    edited.register(create_table_migration());
    edited.register(
        Migration::new("002", "add name index", |_tx| Ok(())).with_down(|_tx| Ok(())),
    );

    let drift = edited.checksum_drift(&conn).unwrap();
    assert_eq!(drift.len(), 1);
    assert_eq!(drift[0].version, "002");
    assert_ne!(drift[0].recorded, drift[0].expected);

    // Drift is diagnostic only.
    assert!(edited.apply(&mut conn).unwrap().is_empty());
}

#[test]
fn concurrent_apply_never_duplicates_or_interleaves() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concurrent.db");
    let manager = Arc::new(MigrationManager::new());
    let running = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let executions = Arc::new(AtomicUsize::new(0));

    for version in ["001", "002", "003", "004"] {
        let running = running.clone();
        let overlaps = overlaps.clone();
        let executions = executions.clone();
        manager.register(Migration::new(version, "slow", move |_tx| {
            if running.fetch_add(1, Ordering::SeqCst) > 0 {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            executions.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }));
    }

    std::thread::scope(|scope| {
        for _ in 0..6 {
            let manager = manager.clone();
            let path = path.clone();
            scope.spawn(move || {
                let mut conn = Connection::open(&path).unwrap();
                conn.busy_timeout(Duration::from_secs(5)).unwrap();
                manager.apply(&mut conn).unwrap();
            });
        }
    });

    let conn = Connection::open(&path).unwrap();
    let duplicates: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM (
                SELECT version FROM schema_migrations GROUP BY version HAVING COUNT(*) > 1
            );",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(duplicates, 0);
    assert_eq!(log_versions(&conn), vec!["001", "002", "003", "004"]);
    assert_eq!(executions.load(Ordering::SeqCst), 4);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn register_does_not_wait_for_running_apply() {
    let manager = Arc::new(MigrationManager::new());
    let gate = Arc::new(Barrier::new(2));
    let body_gate = gate.clone();
    manager.register(Migration::new("001", "gated", move |_tx| {
        body_gate.wait();
        body_gate.wait();
        Ok(())
    }));

    std::thread::scope(|scope| {
        let worker = {
            let manager = manager.clone();
            scope.spawn(move || {
                let mut conn = Connection::open_in_memory().unwrap();
                manager.apply(&mut conn).unwrap()
            })
        };

        gate.wait();
        manager.register(Migration::new("002", "late", |_tx| Ok(())));
        gate.wait();

        let applied = worker.join().unwrap();
        assert_eq!(applied, vec!["001"]);
    });

    assert_eq!(manager.registered_versions(), vec!["001", "002"]);
}

#[test]
fn one_time_log_table_setup_survives_racing_first_callers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.db");
    let manager = Arc::new(MigrationManager::new());
    manager.register(create_table_migration());

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let manager = manager.clone();
            let path = path.clone();
            scope.spawn(move || {
                let conn = Connection::open(&path).unwrap();
                conn.busy_timeout(Duration::from_secs(5)).unwrap();
                manager.pending(&conn).unwrap()
            });
        }
    });

    let conn = Connection::open(&path).unwrap();
    assert!(table_exists(&conn, LOG_TABLE).unwrap());
}
