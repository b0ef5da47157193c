//! Migration registry and executor.
//!
//! # Responsibility
//! - Hold versioned schema/data migrations in registration order.
//! - Apply pending migrations exactly once, one transaction per migration.
//! - Roll back the most recently applied migration.
//!
//! # Invariants
//! - Migrations apply in registration order, never sorted by version text.
//! - A migration body and its log write/delete commit together or not at all.
//! - `apply` and `rollback` on one manager never run concurrently.
//! - Rollback only ever targets the latest log record.
//!
//! The log table is created once on first use; a store the manager has not
//! touched before gets its table on demand.

mod builtin;
mod ledger;

pub use self::ledger::{checksum, MigrationRecord, LOG_TABLE};

use crate::db::DbError;
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

pub type MigrationResult<T> = Result<T, MigrationError>;

/// Body of one migration direction. Runs inside the migration transaction.
pub type MigrationFn = dyn Fn(&Transaction<'_>) -> Result<(), DbError> + Send + Sync;

/// Which body of a migration was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    Up,
    Down,
}

impl Display for MigrationDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug)]
pub enum MigrationError {
    /// The `up` or `down` body failed; its transaction was rolled back.
    ExecutionFailed {
        version: String,
        direction: MigrationDirection,
        source: DbError,
    },
    NothingToRollBack,
    /// The latest log record names a version this binary does not register.
    NotFound(String),
    /// The latest migration is one-way.
    NoRollbackFunction(String),
    /// The latest log record changed between the check and the transaction.
    StateChanged {
        expected: String,
        actual: Option<String>,
    },
    Storage {
        context: &'static str,
        source: rusqlite::Error,
    },
    /// A persisted log row cannot be decoded.
    InvalidData(String),
}

impl MigrationError {
    pub(crate) fn storage(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Storage { context, source }
    }

    /// Version the error is about, when there is one.
    pub fn version(&self) -> Option<&str> {
        match self {
            Self::ExecutionFailed { version, .. } => Some(version),
            Self::NotFound(version) => Some(version),
            Self::NoRollbackFunction(version) => Some(version),
            Self::StateChanged { expected, .. } => Some(expected),
            Self::NothingToRollBack | Self::Storage { .. } | Self::InvalidData(_) => None,
        }
    }
}

impl Display for MigrationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExecutionFailed {
                version,
                direction,
                source,
            } => write!(f, "migration `{version}` failed ({direction}): {source}"),
            Self::NothingToRollBack => write!(f, "nothing to roll back"),
            Self::NotFound(version) => write!(f, "unknown migration `{version}`"),
            Self::NoRollbackFunction(version) => {
                write!(f, "migration `{version}` has no rollback function")
            }
            Self::StateChanged { expected, actual } => match actual {
                Some(actual) => write!(
                    f,
                    "migration state changed: expected latest `{expected}`, found `{actual}`"
                ),
                None => write!(
                    f,
                    "migration state changed: expected latest `{expected}`, found no applied migrations"
                ),
            },
            Self::Storage { context, source } => write!(f, "failed to {context}: {source}"),
            Self::InvalidData(message) => write!(f, "invalid migration log data: {message}"),
        }
    }
}

impl Error for MigrationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ExecutionFailed { source, .. } => Some(source),
            Self::Storage { source, .. } => Some(source),
            Self::NothingToRollBack
            | Self::NotFound(_)
            | Self::NoRollbackFunction(_)
            | Self::StateChanged { .. }
            | Self::InvalidData(_) => None,
        }
    }
}

/// One versioned schema/data change.
pub struct Migration {
    version: String,
    description: String,
    up: Box<MigrationFn>,
    down: Option<Box<MigrationFn>>,
}

impl Migration {
    /// Creates a one-way migration.
    pub fn new<F>(version: impl Into<String>, description: impl Into<String>, up: F) -> Self
    where
        F: Fn(&Transaction<'_>) -> Result<(), DbError> + Send + Sync + 'static,
    {
        Self {
            version: version.into(),
            description: description.into(),
            up: Box::new(up),
            down: None,
        }
    }

    /// Attaches a rollback body.
    pub fn with_down<F>(mut self, down: F) -> Self
    where
        F: Fn(&Transaction<'_>) -> Result<(), DbError> + Send + Sync + 'static,
    {
        self.down = Some(Box::new(down));
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }

    pub fn checksum(&self) -> String {
        checksum(&self.version, &self.description)
    }
}

impl Debug for Migration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("reversible", &self.is_reversible())
            .finish()
    }
}

/// A logged version whose stored checksum no longer matches the registered
/// migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumDrift {
    pub version: String,
    pub recorded: String,
    pub expected: String,
}

/// Long-lived registry and executor for migrations.
///
/// Construct once at process start and pass by reference.
pub struct MigrationManager {
    registry: Mutex<Vec<Arc<Migration>>>,
    operation_lock: Mutex<()>,
    log_table_ready: OnceCell<()>,
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MigrationManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationManager")
            .field("registered", &self.registry.lock().len())
            .field("log_table_ready", &self.log_table_ready.get().is_some())
            .finish()
    }
}

impl MigrationManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Vec::new()),
            operation_lock: Mutex::new(()),
            log_table_ready: OnceCell::new(),
        }
    }

    /// Creates a manager with the built-in migrations registered.
    pub fn with_builtin_migrations() -> Self {
        let manager = Self::new();
        builtin::register_builtin_migrations(&manager);
        manager
    }

    /// Appends one migration to the registry.
    ///
    /// Never touches the database and never waits for a running `apply`.
    pub fn register(&self, migration: Migration) {
        let mut registry = self.registry.lock();
        if registry
            .iter()
            .any(|existing| existing.version == migration.version)
        {
            warn!(
                "event=migration_register module=db status=warn version={} reason=duplicate_version",
                migration.version
            );
        }
        registry.push(Arc::new(migration));
    }

    /// Registered versions in registration order.
    pub fn registered_versions(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|migration| migration.version.clone())
            .collect()
    }

    /// Applies every pending migration in registration order.
    ///
    /// Returns the versions applied by this call; an already migrated store
    /// yields an empty list. Stops at the first failure, leaving earlier
    /// migrations committed and later ones pending.
    pub fn apply(&self, conn: &mut Connection) -> MigrationResult<Vec<String>> {
        let _operation = self.operation_lock.lock();
        let started_at = Instant::now();
        self.ensure_log_table(conn)?;

        let migrations = self.snapshot();
        let logged = ledger::applied_versions(conn)
            .map_err(MigrationError::storage("read applied migrations"))?;
        info!(
            "event=migration_apply module=db status=start registered={} logged={}",
            migrations.len(),
            logged.len()
        );

        let mut applied = Vec::new();
        for migration in &migrations {
            if logged.contains(&migration.version) {
                debug!(
                    "event=migration_step module=db status=skip version={}",
                    migration.version
                );
                continue;
            }

            match apply_one(conn, migration) {
                Ok(true) => applied.push(migration.version.clone()),
                Ok(false) => {}
                Err(err) => {
                    error!(
                        "event=migration_apply module=db status=error version={} applied={} duration_ms={} error={}",
                        migration.version,
                        applied.len(),
                        started_at.elapsed().as_millis(),
                        err
                    );
                    return Err(err);
                }
            }
        }

        info!(
            "event=migration_apply module=db status=ok applied={} duration_ms={}",
            applied.len(),
            started_at.elapsed().as_millis()
        );
        Ok(applied)
    }

    /// Reverts the most recently applied migration and removes its log row.
    pub fn rollback(&self, conn: &mut Connection) -> MigrationResult<MigrationRecord> {
        let _operation = self.operation_lock.lock();
        let started_at = Instant::now();
        self.ensure_log_table(conn)?;

        let latest = ledger::latest_record(conn)?.ok_or(MigrationError::NothingToRollBack)?;
        let migration = self
            .find(&latest.version)
            .ok_or_else(|| MigrationError::NotFound(latest.version.clone()))?;
        let down = migration
            .down
            .as_ref()
            .ok_or_else(|| MigrationError::NoRollbackFunction(latest.version.clone()))?;

        info!(
            "event=migration_rollback module=db status=start version={}",
            latest.version
        );

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(MigrationError::storage("begin rollback transaction"))?;

        if let Err(err) = ensure_latest(&tx, &latest.version) {
            error!(
                "event=migration_rollback module=db status=error version={} duration_ms={} error={}",
                latest.version,
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err);
        }

        if let Err(source) = down(&tx) {
            error!(
                "event=migration_rollback module=db status=error version={} duration_ms={} error={}",
                latest.version,
                started_at.elapsed().as_millis(),
                source
            );
            return Err(MigrationError::ExecutionFailed {
                version: latest.version,
                direction: MigrationDirection::Down,
                source,
            });
        }

        ledger::delete_record(&tx, &latest.version)
            .map_err(MigrationError::storage("delete migration record"))?;
        tx.commit()
            .map_err(MigrationError::storage("commit rollback transaction"))?;

        info!(
            "event=migration_rollback module=db status=ok version={} duration_ms={}",
            latest.version,
            started_at.elapsed().as_millis()
        );
        Ok(latest)
    }

    /// Applied records, oldest first.
    pub fn applied(&self, conn: &Connection) -> MigrationResult<Vec<MigrationRecord>> {
        self.ensure_log_table(conn)?;
        ledger::list_records(conn)
    }

    /// Registered versions that have no log row, in registration order.
    pub fn pending(&self, conn: &Connection) -> MigrationResult<Vec<String>> {
        self.ensure_log_table(conn)?;
        let logged: HashSet<String> = ledger::applied_versions(conn)
            .map_err(MigrationError::storage("read applied migrations"))?;
        Ok(self
            .snapshot()
            .iter()
            .filter(|migration| !logged.contains(&migration.version))
            .map(|migration| migration.version.clone())
            .collect())
    }

    /// Lists logged versions whose stored checksum differs from the
    /// registered migration. Diagnostic only; apply and rollback ignore it.
    pub fn checksum_drift(&self, conn: &Connection) -> MigrationResult<Vec<ChecksumDrift>> {
        let records = self.applied(conn)?;
        let drift = records
            .into_iter()
            .filter_map(|record| {
                let expected = self.find(&record.version)?.checksum();
                (expected != record.checksum).then(|| ChecksumDrift {
                    version: record.version,
                    recorded: record.checksum,
                    expected,
                })
            })
            .collect();
        Ok(drift)
    }

    /// Creates the log table on first use. Later calls only probe for it, and
    /// create it when the manager is pointed at a store it has not seen.
    fn ensure_log_table(&self, conn: &Connection) -> MigrationResult<()> {
        let mut created_now = false;
        self.log_table_ready.get_or_try_init(|| {
            created_now = true;
            ledger::create_log_table(conn)
                .map_err(MigrationError::storage("create migration log table"))
        })?;
        if created_now {
            return Ok(());
        }

        if !ledger::log_table_exists(conn)
            .map_err(MigrationError::storage("check migration log table"))?
        {
            debug!("event=migration_log_table module=db status=create reason=unseen_store");
            ledger::create_log_table(conn)
                .map_err(MigrationError::storage("create migration log table"))?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<Migration>> {
        self.registry.lock().clone()
    }

    fn find(&self, version: &str) -> Option<Arc<Migration>> {
        self.registry
            .lock()
            .iter()
            .find(|migration| migration.version == version)
            .cloned()
    }
}

/// Runs one migration in its own transaction. Returns `false` when another
/// writer logged the version first.
fn apply_one(conn: &mut Connection, migration: &Migration) -> MigrationResult<bool> {
    let started_at = Instant::now();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(MigrationError::storage("begin migration transaction"))?;

    if ledger::is_logged(&tx, &migration.version)
        .map_err(MigrationError::storage("re-check migration record"))?
    {
        tx.commit()
            .map_err(MigrationError::storage("commit migration transaction"))?;
        debug!(
            "event=migration_step module=db status=skip version={} reason=logged_concurrently",
            migration.version
        );
        return Ok(false);
    }

    (migration.up)(&tx).map_err(|source| MigrationError::ExecutionFailed {
        version: migration.version.clone(),
        direction: MigrationDirection::Up,
        source,
    })?;

    ledger::insert_record(
        &tx,
        &migration.version,
        &migration.description,
        &migration.checksum(),
        chrono::Utc::now(),
    )
    .map_err(MigrationError::storage("insert migration record"))?;
    tx.commit()
        .map_err(MigrationError::storage("commit migration transaction"))?;

    info!(
        "event=migration_step module=db status=ok version={} duration_ms={}",
        migration.version,
        started_at.elapsed().as_millis()
    );
    Ok(true)
}

/// Fails with `StateChanged` unless `expected` is still the latest record.
fn ensure_latest(conn: &Connection, expected: &str) -> MigrationResult<()> {
    match ledger::latest_record(conn)? {
        Some(record) if record.version == expected => Ok(()),
        current => Err(MigrationError::StateChanged {
            expected: expected.to_string(),
            actual: current.map(|record| record.version),
        }),
    }
}

/// Bootstrap entry point: applies every pending migration held by `manager`.
///
/// Callers must treat an error as fatal and refuse to serve against the
/// partially migrated store.
pub fn run_migrations(
    manager: &MigrationManager,
    conn: &mut Connection,
) -> MigrationResult<Vec<String>> {
    manager.apply(conn)
}
