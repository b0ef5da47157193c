//! Configuration graph repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide CRUD over configs, groups, dependency edges, targets and file
//!   mappings.
//! - Keep SQL details inside the core persistence boundary.
//!
//! # Invariants
//! - Write paths validate identifiers before SQL mutations.
//! - Dependency edges are stored by target external id and are not checked
//!   for existence here; graph validation owns that rule.
//! - Group listings are ordered by `external_id ASC` with sorted
//!   `depends_on`.

use crate::db::DbError;
use crate::model::group::{
    validate_external_id, validate_repo_slug, Config, ConfigId, FileMapping, Group, GroupId,
    GroupTarget, GroupValidationError, NewGroup,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

const GROUP_SELECT_SQL: &str = "SELECT
    id,
    config_id,
    external_id,
    name,
    description,
    priority
FROM groups";

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for configuration graph persistence.
#[derive(Debug)]
pub enum RepoError {
    Validation(GroupValidationError),
    Db(DbError),
    NotFound(String),
    /// A uniqueness constraint rejected the write.
    Conflict(String),
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::Conflict(what) => write!(f, "already exists: {what}"),
            Self::InvalidData(message) => write!(f, "invalid persisted config data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::NotFound(_) => None,
            Self::Conflict(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<GroupValidationError> for RepoError {
    fn from(value: GroupValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Repository interface for the configuration graph.
pub trait ConfigRepository {
    fn create_config(&self, name: &str) -> RepoResult<Config>;
    fn find_config(&self, name: &str) -> RepoResult<Option<Config>>;
    fn create_group(&self, config_id: ConfigId, group: &NewGroup) -> RepoResult<Group>;
    fn get_group(&self, config_id: ConfigId, external_id: &str) -> RepoResult<Option<Group>>;
    fn list_groups(&self, config_id: ConfigId) -> RepoResult<Vec<Group>>;
    fn delete_group(&self, config_id: ConfigId, external_id: &str) -> RepoResult<()>;
    /// Records that `external_id` depends on `depends_on`. Idempotent.
    fn add_dependency(
        &self,
        config_id: ConfigId,
        external_id: &str,
        depends_on: &str,
    ) -> RepoResult<()>;
    fn remove_dependency(
        &self,
        config_id: ConfigId,
        external_id: &str,
        depends_on: &str,
    ) -> RepoResult<()>;
    fn add_target(
        &self,
        group_id: GroupId,
        repo: &str,
        branch: Option<&str>,
    ) -> RepoResult<GroupTarget>;
    fn list_targets(&self, group_id: GroupId) -> RepoResult<Vec<GroupTarget>>;
    fn add_file_mapping(
        &self,
        group_id: GroupId,
        source_path: &str,
        dest_path: &str,
        is_directory: bool,
    ) -> RepoResult<FileMapping>;
    fn list_file_mappings(&self, group_id: GroupId) -> RepoResult<Vec<FileMapping>>;
}

/// SQLite-backed configuration graph repository.
pub struct SqliteConfigRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteConfigRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn require_group_id(&self, config_id: ConfigId, external_id: &str) -> RepoResult<GroupId> {
        self.conn
            .query_row(
                "SELECT id FROM groups WHERE config_id = ?1 AND external_id = ?2;",
                params![config_id, external_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepoError::NotFound(format!("group `{external_id}`")))
    }
}

impl ConfigRepository for SqliteConfigRepository<'_> {
    fn create_config(&self, name: &str) -> RepoResult<Config> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RepoError::InvalidData("config name cannot be empty".into()));
        }

        self.conn
            .execute("INSERT INTO configs (name) VALUES (?1);", [name])
            .map_err(|err| conflict_or_db(err, format!("config `{name}`")))?;

        Ok(Config {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    fn find_config(&self, name: &str) -> RepoResult<Option<Config>> {
        let config = self
            .conn
            .query_row(
                "SELECT id, name FROM configs WHERE name = ?1;",
                [name.trim()],
                |row| {
                    Ok(Config {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(config)
    }

    fn create_group(&self, config_id: ConfigId, group: &NewGroup) -> RepoResult<Group> {
        group.validate()?;

        self.conn
            .execute(
                "INSERT INTO groups (config_id, external_id, name, description, priority)
                 VALUES (?1, ?2, ?3, ?4, ?5);",
                params![
                    config_id,
                    group.external_id.as_str(),
                    group.name.trim(),
                    group.description.as_deref(),
                    group.priority,
                ],
            )
            .map_err(|err| conflict_or_db(err, format!("group `{}`", group.external_id)))?;

        Ok(Group {
            id: self.conn.last_insert_rowid(),
            config_id,
            external_id: group.external_id.clone(),
            name: group.name.trim().to_string(),
            description: group.description.clone(),
            priority: group.priority,
            depends_on: Vec::new(),
        })
    }

    fn get_group(&self, config_id: ConfigId, external_id: &str) -> RepoResult<Option<Group>> {
        let mut stmt = self.conn.prepare(&format!(
            "{GROUP_SELECT_SQL} WHERE config_id = ?1 AND external_id = ?2;"
        ))?;
        let mut rows = stmt.query(params![config_id, external_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let mut group = parse_group_row(row)?;

        let mut deps_stmt = self.conn.prepare(
            "SELECT depends_on_external_id FROM group_dependencies
             WHERE group_id = ?1
             ORDER BY depends_on_external_id ASC;",
        )?;
        group.depends_on = deps_stmt
            .query_map([group.id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(group))
    }

    fn list_groups(&self, config_id: ConfigId) -> RepoResult<Vec<Group>> {
        let mut stmt = self.conn.prepare(&format!(
            "{GROUP_SELECT_SQL} WHERE config_id = ?1 ORDER BY external_id ASC;"
        ))?;
        let mut rows = stmt.query([config_id])?;
        let mut groups = Vec::new();
        while let Some(row) = rows.next()? {
            groups.push(parse_group_row(row)?);
        }

        let position: HashMap<GroupId, usize> = groups
            .iter()
            .enumerate()
            .map(|(index, group)| (group.id, index))
            .collect();

        let mut edge_stmt = self.conn.prepare(
            "SELECT d.group_id, d.depends_on_external_id
             FROM group_dependencies d
             JOIN groups g ON g.id = d.group_id
             WHERE g.config_id = ?1
             ORDER BY d.group_id ASC, d.depends_on_external_id ASC;",
        )?;
        let mut edges = edge_stmt.query([config_id])?;
        while let Some(row) = edges.next()? {
            let group_id: GroupId = row.get(0)?;
            let depends_on: String = row.get(1)?;
            let index = position.get(&group_id).copied().ok_or_else(|| {
                RepoError::InvalidData(format!(
                    "dependency row references group {group_id} outside config {config_id}"
                ))
            })?;
            groups[index].depends_on.push(depends_on);
        }

        Ok(groups)
    }

    fn delete_group(&self, config_id: ConfigId, external_id: &str) -> RepoResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM groups WHERE config_id = ?1 AND external_id = ?2;",
            params![config_id, external_id],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(format!("group `{external_id}`")));
        }
        Ok(())
    }

    fn add_dependency(
        &self,
        config_id: ConfigId,
        external_id: &str,
        depends_on: &str,
    ) -> RepoResult<()> {
        validate_external_id(depends_on)?;
        let group_id = self.require_group_id(config_id, external_id)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO group_dependencies (group_id, depends_on_external_id)
             VALUES (?1, ?2);",
            params![group_id, depends_on],
        )?;
        Ok(())
    }

    fn remove_dependency(
        &self,
        config_id: ConfigId,
        external_id: &str,
        depends_on: &str,
    ) -> RepoResult<()> {
        let group_id = self.require_group_id(config_id, external_id)?;
        let changed = self.conn.execute(
            "DELETE FROM group_dependencies
             WHERE group_id = ?1 AND depends_on_external_id = ?2;",
            params![group_id, depends_on],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(format!(
                "dependency `{external_id}` -> `{depends_on}`"
            )));
        }
        Ok(())
    }

    fn add_target(
        &self,
        group_id: GroupId,
        repo: &str,
        branch: Option<&str>,
    ) -> RepoResult<GroupTarget> {
        validate_repo_slug(repo)?;
        let branch = branch.map(str::trim).filter(|branch| !branch.is_empty());

        self.conn
            .execute(
                "INSERT INTO group_targets (group_id, repo, branch) VALUES (?1, ?2, ?3);",
                params![group_id, repo, branch],
            )
            .map_err(|err| conflict_or_db(err, format!("target `{repo}`")))?;

        Ok(GroupTarget {
            id: self.conn.last_insert_rowid(),
            group_id,
            repo: repo.to_string(),
            branch: branch.map(str::to_string),
        })
    }

    fn list_targets(&self, group_id: GroupId) -> RepoResult<Vec<GroupTarget>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, group_id, repo, branch FROM group_targets
             WHERE group_id = ?1
             ORDER BY repo ASC;",
        )?;
        let targets = stmt
            .query_map([group_id], |row| {
                Ok(GroupTarget {
                    id: row.get(0)?,
                    group_id: row.get(1)?,
                    repo: row.get(2)?,
                    branch: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(targets)
    }

    fn add_file_mapping(
        &self,
        group_id: GroupId,
        source_path: &str,
        dest_path: &str,
        is_directory: bool,
    ) -> RepoResult<FileMapping> {
        let source_path = source_path.trim();
        let dest_path = dest_path.trim();
        if source_path.is_empty() || dest_path.is_empty() {
            return Err(GroupValidationError::EmptyPath.into());
        }

        self.conn.execute(
            "INSERT INTO file_mappings (group_id, source_path, dest_path, is_directory)
             VALUES (?1, ?2, ?3, ?4);",
            params![group_id, source_path, dest_path, bool_to_int(is_directory)],
        )?;

        Ok(FileMapping {
            id: self.conn.last_insert_rowid(),
            group_id,
            source_path: source_path.to_string(),
            dest_path: dest_path.to_string(),
            is_directory,
        })
    }

    fn list_file_mappings(&self, group_id: GroupId) -> RepoResult<Vec<FileMapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, group_id, source_path, dest_path, is_directory FROM file_mappings
             WHERE group_id = ?1
             ORDER BY id ASC;",
        )?;
        let mut rows = stmt.query([group_id])?;
        let mut mappings = Vec::new();
        while let Some(row) = rows.next()? {
            let is_directory = match row.get::<_, i64>("is_directory")? {
                0 => false,
                1 => true,
                other => {
                    return Err(RepoError::InvalidData(format!(
                        "invalid is_directory value `{other}` in file_mappings.is_directory"
                    )));
                }
            };
            mappings.push(FileMapping {
                id: row.get("id")?,
                group_id: row.get("group_id")?,
                source_path: row.get("source_path")?,
                dest_path: row.get("dest_path")?,
                is_directory,
            });
        }
        Ok(mappings)
    }
}

fn parse_group_row(row: &Row<'_>) -> RepoResult<Group> {
    let external_id: String = row.get("external_id")?;
    if validate_external_id(&external_id).is_err() {
        return Err(RepoError::InvalidData(format!(
            "invalid external id `{external_id}` in groups.external_id"
        )));
    }

    Ok(Group {
        id: row.get("id")?,
        config_id: row.get("config_id")?,
        external_id,
        name: row.get("name")?,
        description: row.get("description")?,
        priority: row.get("priority")?,
        depends_on: Vec::new(),
    })
}

fn conflict_or_db(err: rusqlite::Error, what: String) -> RepoError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) if is_unique_violation(&err) => {
            RepoError::Conflict(what)
        }
        _ => err.into(),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
