//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define data access contracts for the configuration graph.
//! - Isolate SQLite query details from service orchestration.
//!
//! # Invariants
//! - Repository writes validate identifiers before persistence.
//! - Repository APIs return semantic errors (`NotFound`, `Conflict`) in
//!   addition to DB transport errors.

pub mod config_repo;
