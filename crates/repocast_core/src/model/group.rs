//! Configuration graph domain model.
//!
//! # Responsibility
//! - Define configurations, groups and the per-group sync payload (targets,
//!   file mappings).
//! - Validate user-supplied identifiers before persistence.
//!
//! # Invariants
//! - `external_id` is unique within one configuration and never reused for
//!   another group in that configuration.
//! - `depends_on` holds external ids of the same configuration.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Internal numeric key of a configuration row.
pub type ConfigId = i64;
/// Internal numeric key of a group row.
pub type GroupId = i64;

static EXTERNAL_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid external id regex")
});
static REPO_SLUG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").expect("valid repo slug regex")
});

/// Named scope for groups and their external ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub id: ConfigId,
    pub name: String,
}

/// A named set of target repositories sharing file mappings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub config_id: ConfigId,
    /// Stable user-assigned identifier, unique within `config_id`.
    pub external_id: String,
    pub name: String,
    pub description: Option<String>,
    pub priority: i64,
    /// External ids this group must be processed after. Sorted.
    pub depends_on: Vec<String>,
}

/// Input for creating a group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewGroup {
    pub external_id: String,
    pub name: String,
    pub description: Option<String>,
    pub priority: i64,
}

impl NewGroup {
    pub fn new(external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Validates identifier and name before persistence.
    pub fn validate(&self) -> Result<(), GroupValidationError> {
        validate_external_id(&self.external_id)?;
        if self.name.trim().is_empty() {
            return Err(GroupValidationError::EmptyName);
        }
        Ok(())
    }
}

/// One repository receiving the group's files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTarget {
    pub id: i64,
    pub group_id: GroupId,
    /// `owner/name` slug.
    pub repo: String,
    /// `None` means the repository's default branch.
    pub branch: Option<String>,
}

/// One source path copied into every target of the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMapping {
    pub id: i64,
    pub group_id: GroupId,
    pub source_path: String,
    pub dest_path: String,
    pub is_directory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupValidationError {
    InvalidExternalId(String),
    EmptyName,
    InvalidRepo(String),
    EmptyPath,
}

impl Display for GroupValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidExternalId(value) => write!(f, "invalid group external id `{value}`"),
            Self::EmptyName => write!(f, "group name cannot be empty"),
            Self::InvalidRepo(value) => {
                write!(f, "invalid target repository `{value}`; expected owner/name")
            }
            Self::EmptyPath => write!(f, "file mapping paths cannot be empty"),
        }
    }
}

impl Error for GroupValidationError {}

/// Checks `value` is a usable external id.
pub fn validate_external_id(value: &str) -> Result<(), GroupValidationError> {
    if EXTERNAL_ID_RE.is_match(value) {
        Ok(())
    } else {
        Err(GroupValidationError::InvalidExternalId(value.to_string()))
    }
}

/// Checks `value` is an `owner/name` repository slug.
pub fn validate_repo_slug(value: &str) -> Result<(), GroupValidationError> {
    if REPO_SLUG_RE.is_match(value) {
        Ok(())
    } else {
        Err(GroupValidationError::InvalidRepo(value.to_string()))
    }
}
