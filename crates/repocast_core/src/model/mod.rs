//! Configuration graph domain model.
//!
//! # Responsibility
//! - Define canonical data structures for configurations and their groups.
//!
//! # Invariants
//! - Groups are addressed across the graph by `external_id`, never by
//!   internal numeric key.

pub mod group;
