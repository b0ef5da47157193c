//! SQLite storage bootstrap, declarative schema and migration entry points.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the repocast core.
//! - Create the declarative configuration-graph schema.
//! - Run registered migrations before handing out a connection.
//!
//! # Invariants
//! - Applied migrations are tracked row-per-version in `schema_migrations`.
//! - Core code must not read/write configuration data before migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;
pub mod schema;

pub use migrations::{run_migrations, MigrationError, MigrationManager};
pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    /// Bootstrap stopped because migrations did not fully apply.
    Migration(Box<MigrationError>),
    /// A migration body refused to continue.
    Aborted(String),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Migration(err) => write!(f, "{err}"),
            Self::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Migration(err) => Some(err.as_ref()),
            Self::Aborted(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<std::io::Error> for DbError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MigrationError> for DbError {
    fn from(value: MigrationError) -> Self {
        Self::Migration(Box::new(value))
    }
}
