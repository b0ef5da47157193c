//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls and graph validation into use-case level
//!   APIs.
//! - Keep CLI callers decoupled from storage details.

pub mod config_service;
