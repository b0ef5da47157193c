//! Group dependency graph integrity.
//!
//! # Responsibility
//! - Reject configurations whose groups form a cycle or reference unknown
//!   groups.
//! - Compute the order in which groups are processed during a sync.
//!
//! # Invariants
//! - Graphs are rebuilt from storage on every call; nothing is cached, so
//!   concurrent callers share no mutable state.

pub mod dependency_graph;
pub mod validator;

pub use dependency_graph::{DependencyGraph, GraphError, GraphResult};
pub use validator::{resolve_processing_order, validate_group_dependencies};
