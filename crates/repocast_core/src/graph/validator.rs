//! Scoped dependency validation against persisted groups.

use super::dependency_graph::{DependencyGraph, GraphResult};
use crate::model::group::{ConfigId, Group};
use crate::repo::config_repo::{ConfigRepository, SqliteConfigRepository};
use log::{info, warn};
use rusqlite::Connection;
use std::time::Instant;

/// Checks that every dependency of every group in `config_id` resolves to a
/// group of the same configuration and that no cycle exists.
///
/// Called by configuration-editing flows before a change is accepted.
pub fn validate_group_dependencies(conn: &Connection, config_id: ConfigId) -> GraphResult<()> {
    let started_at = Instant::now();
    let result = load_scoped_graph(conn, config_id).and_then(|graph| graph.detect_cycles());
    log_outcome("validate", config_id, started_at, &result);
    result
}

/// Loads `config_id` and returns its groups in processing order.
pub fn resolve_processing_order(conn: &Connection, config_id: ConfigId) -> GraphResult<Vec<Group>> {
    let started_at = Instant::now();
    let result = load_scoped_graph(conn, config_id).and_then(|graph| graph.topological_sort());
    log_outcome("order", config_id, started_at, &result);
    result
}

fn load_scoped_graph(conn: &Connection, config_id: ConfigId) -> GraphResult<DependencyGraph> {
    let groups = SqliteConfigRepository::new(conn).list_groups(config_id)?;
    Ok(DependencyGraph::new(groups))
}

fn log_outcome<T>(
    operation: &str,
    config_id: ConfigId,
    started_at: Instant,
    result: &GraphResult<T>,
) {
    match result {
        Ok(_) => info!(
            "event=graph_validate module=graph status=ok operation={} config_id={} duration_ms={}",
            operation,
            config_id,
            started_at.elapsed().as_millis()
        ),
        Err(err) => warn!(
            "event=graph_validate module=graph status=rejected operation={} config_id={} duration_ms={} error={}",
            operation,
            config_id,
            started_at.elapsed().as_millis(),
            err
        ),
    }
}
