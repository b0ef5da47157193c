//! Core storage and integrity logic for repocast.
//! This crate owns the configuration graph invariants: acyclic group
//! dependencies and an exactly-once migrated schema.

pub mod db;
pub mod graph;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use db::migrations::{
    ChecksumDrift, Migration, MigrationDirection, MigrationError, MigrationManager,
    MigrationRecord, MigrationResult,
};
pub use db::{open_db, open_db_in_memory, run_migrations, DbError, DbResult};
pub use graph::{
    resolve_processing_order, validate_group_dependencies, DependencyGraph, GraphError,
    GraphResult,
};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::group::{
    Config, ConfigId, FileMapping, Group, GroupId, GroupTarget, GroupValidationError, NewGroup,
};
pub use repo::config_repo::{ConfigRepository, RepoError, RepoResult, SqliteConfigRepository};
pub use service::config_service::{ConfigService, ConfigServiceError, ConfigServiceResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
