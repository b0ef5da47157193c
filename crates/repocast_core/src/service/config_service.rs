//! Configuration graph editing service.
//!
//! # Responsibility
//! - Apply group graph edits and validate the resulting graph before
//!   accepting them.
//!
//! # Invariants
//! - Each edit runs in one transaction; a rejected edit leaves the store
//!   unchanged.
//! - Validation runs against the edited state inside that transaction.

use crate::db::DbError;
use crate::graph::{resolve_processing_order, validate_group_dependencies, GraphError};
use crate::model::group::{ConfigId, Group, NewGroup};
use crate::repo::config_repo::{ConfigRepository, RepoError, SqliteConfigRepository};
use log::warn;
use rusqlite::{Connection, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type ConfigServiceResult<T> = Result<T, ConfigServiceError>;

#[derive(Debug)]
pub enum ConfigServiceError {
    Repo(RepoError),
    /// The edit would leave the graph invalid; reported back to the user.
    Graph(GraphError),
    Db(DbError),
}

impl Display for ConfigServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo(err) => write!(f, "{err}"),
            Self::Graph(err) => write!(f, "configuration rejected: {err}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ConfigServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::Graph(err) => Some(err),
            Self::Db(err) => Some(err),
        }
    }
}

impl From<RepoError> for ConfigServiceError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<GraphError> for ConfigServiceError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

impl From<rusqlite::Error> for ConfigServiceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Validating editor for one store.
pub struct ConfigService<'conn> {
    conn: &'conn mut Connection,
}

impl<'conn> ConfigService<'conn> {
    pub fn new(conn: &'conn mut Connection) -> Self {
        Self { conn }
    }

    /// Creates a group together with its dependencies.
    pub fn create_group_with_dependencies(
        &mut self,
        config_id: ConfigId,
        group: &NewGroup,
        depends_on: &[&str],
    ) -> ConfigServiceResult<Group> {
        self.edit(config_id, "create_group", |repo| {
            let mut created = repo.create_group(config_id, group)?;
            for dependency in depends_on {
                repo.add_dependency(config_id, &created.external_id, dependency)?;
            }
            let mut dependencies: Vec<String> =
                depends_on.iter().map(|id| id.to_string()).collect();
            dependencies.sort();
            dependencies.dedup();
            created.depends_on = dependencies;
            Ok(created)
        })
    }

    /// Makes `external_id` depend on `depends_on`.
    pub fn add_dependency(
        &mut self,
        config_id: ConfigId,
        external_id: &str,
        depends_on: &str,
    ) -> ConfigServiceResult<()> {
        self.edit(config_id, "add_dependency", |repo| {
            repo.add_dependency(config_id, external_id, depends_on)
        })
    }

    /// Removes one dependency edge. Removal cannot introduce a cycle or a
    /// dangling reference, but is validated like any other edit.
    pub fn remove_dependency(
        &mut self,
        config_id: ConfigId,
        external_id: &str,
        depends_on: &str,
    ) -> ConfigServiceResult<()> {
        self.edit(config_id, "remove_dependency", |repo| {
            repo.remove_dependency(config_id, external_id, depends_on)
        })
    }

    /// Deletes a group; rejected while other groups still depend on it.
    pub fn remove_group(&mut self, config_id: ConfigId, external_id: &str) -> ConfigServiceResult<()> {
        self.edit(config_id, "remove_group", |repo| {
            repo.delete_group(config_id, external_id)
        })
    }

    /// Groups of `config_id` in sync processing order.
    pub fn processing_order(&self, config_id: ConfigId) -> ConfigServiceResult<Vec<Group>> {
        Ok(resolve_processing_order(&*self.conn, config_id)?)
    }

    fn edit<T>(
        &mut self,
        config_id: ConfigId,
        operation: &str,
        apply: impl FnOnce(&SqliteConfigRepository<'_>) -> Result<T, RepoError>,
    ) -> ConfigServiceResult<T> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let value = apply(&SqliteConfigRepository::new(&tx))?;
        if let Err(err) = validate_group_dependencies(&tx, config_id) {
            warn!(
                "event=config_edit module=service status=rejected operation={} config_id={} error={}",
                operation, config_id, err
            );
            return Err(err.into());
        }

        tx.commit()?;
        Ok(value)
    }
}
