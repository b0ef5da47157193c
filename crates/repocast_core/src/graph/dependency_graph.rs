//! In-memory group dependency graph.
//!
//! # Responsibility
//! - Detect dependency cycles and report one concrete cycle path.
//! - Produce a deterministic processing order (dependencies first).
//!
//! # Invariants
//! - Graphs are built from a snapshot and never cached or mutated.
//! - Ties in processing order are broken by ascending `external_id`.
//! - Later duplicates of an `external_id` replace earlier ones.

use crate::model::group::Group;
use crate::repo::config_repo::RepoError;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug)]
pub enum GraphError {
    /// At least one cycle exists. `path` starts and ends with the same group
    /// and reads as "depends on" (`a -> b -> a`); empty when no concrete
    /// cycle could be reconstructed.
    CircularDependency { path: Vec<String> },
    /// `group` depends on an external id that does not exist in scope.
    MissingDependency { group: String, depends_on: String },
    /// Loading the scoped snapshot failed.
    Repo(RepoError),
}

impl Display for GraphError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircularDependency { path } if path.is_empty() => {
                write!(f, "circular dependency detected")
            }
            Self::CircularDependency { path } => {
                write!(f, "circular dependency detected: {}", path.join(" -> "))
            }
            Self::MissingDependency { group, depends_on } => write!(
                f,
                "group `{group}` depends on `{depends_on}`, which does not exist"
            ),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for GraphError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::CircularDependency { .. } | Self::MissingDependency { .. } => None,
        }
    }
}

impl From<RepoError> for GraphError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Directed graph over groups; edges point from a dependency to its
/// dependents.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    groups: BTreeMap<String, Group>,
    dependents: BTreeMap<String, Vec<String>>,
    in_degree: BTreeMap<String, usize>,
}

impl DependencyGraph {
    pub fn new(groups: impl IntoIterator<Item = Group>) -> Self {
        let mut by_id = BTreeMap::new();
        for group in groups {
            by_id.insert(group.external_id.clone(), group);
        }

        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut in_degree = BTreeMap::new();
        for (external_id, group) in &by_id {
            let dependencies: BTreeSet<&String> = group.depends_on.iter().collect();
            in_degree.insert(external_id.clone(), dependencies.len());
            for dependency in dependencies {
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(external_id.clone());
            }
        }

        Self {
            groups: by_id,
            dependents,
            in_degree,
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn contains(&self, external_id: &str) -> bool {
        self.groups.contains_key(external_id)
    }

    /// Fails with `CircularDependency` when any group transitively depends
    /// on itself.
    pub fn detect_cycles(&self) -> GraphResult<()> {
        self.check_references()?;

        if self.count_kahn_processed() == self.groups.len() {
            return Ok(());
        }

        Err(GraphError::CircularDependency {
            path: self.find_cycle().unwrap_or_default(),
        })
    }

    /// Returns every group exactly once, each after all of its dependencies.
    ///
    /// Among groups that are ready at the same time the smallest
    /// `external_id` goes first, so identical input gives identical output.
    pub fn topological_sort(&self) -> GraphResult<Vec<Group>> {
        self.detect_cycles()?;

        let mut in_degree: HashMap<&str, usize> = self
            .in_degree
            .iter()
            .map(|(external_id, degree)| (external_id.as_str(), *degree))
            .collect();
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(external_id, _)| *external_id)
            .collect();

        let mut ordered = Vec::with_capacity(self.groups.len());
        while let Some(external_id) = ready.pop_first() {
            if let Some(group) = self.groups.get(external_id) {
                ordered.push(group.clone());
            }
            for dependent in self.dependents_of(external_id) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        Ok(ordered)
    }

    // Walks groups and edges in id order, so the reported reference is stable.
    fn check_references(&self) -> GraphResult<()> {
        for (external_id, group) in &self.groups {
            let dependencies: BTreeSet<&String> = group.depends_on.iter().collect();
            if let Some(missing) = dependencies
                .into_iter()
                .find(|dependency| !self.groups.contains_key(dependency.as_str()))
            {
                return Err(GraphError::MissingDependency {
                    group: external_id.clone(),
                    depends_on: missing.clone(),
                });
            }
        }
        Ok(())
    }

    fn dependents_of(&self, external_id: &str) -> &[String] {
        self.dependents
            .get(external_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn count_kahn_processed(&self) -> usize {
        let mut in_degree: HashMap<&str, usize> = self
            .in_degree
            .iter()
            .map(|(external_id, degree)| (external_id.as_str(), *degree))
            .collect();
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(external_id, _)| *external_id)
            .collect();

        let mut processed = 0;
        while let Some(external_id) = queue.pop_front() {
            processed += 1;
            for dependent in self.dependents_of(external_id) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }
        processed
    }

    /// Depth-first search with an explicit stack; returns the first cycle
    /// closed by a back edge.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut active: HashSet<&str> = HashSet::new();
        let mut parent: HashMap<&str, &str> = HashMap::new();

        for start in self.groups.keys() {
            let start = start.as_str();
            if !visited.insert(start) {
                continue;
            }
            active.insert(start);
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                let Some(neighbor) = self.dependents_of(node).get(next) else {
                    active.remove(node);
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                let neighbor = neighbor.as_str();
                if active.contains(neighbor) {
                    return reconstruct_cycle(node, neighbor, &parent);
                }
                if visited.insert(neighbor) {
                    parent.insert(neighbor, node);
                    active.insert(neighbor);
                    stack.push((neighbor, 0));
                }
            }
        }

        None
    }
}

/// Walks parent pointers from `current` back to `repeated`.
///
/// Parent edges run dependency -> dependent, so the walk reads as a
/// "depends on" chain once `repeated` is put in front.
fn reconstruct_cycle<'a>(
    current: &'a str,
    repeated: &str,
    parent: &HashMap<&'a str, &'a str>,
) -> Option<Vec<String>> {
    let mut path = vec![repeated.to_string(), current.to_string()];
    let mut cursor = current;
    while cursor != repeated {
        cursor = *parent.get(cursor)?;
        path.push(cursor.to_string());
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::{reconstruct_cycle, DependencyGraph, GraphError};
    use crate::model::group::Group;
    use std::collections::HashMap;

    fn group(external_id: &str, depends_on: &[&str]) -> Group {
        Group {
            id: 0,
            config_id: 1,
            external_id: external_id.to_string(),
            name: external_id.to_string(),
            description: None,
            priority: 0,
            depends_on: depends_on.iter().map(|id| id.to_string()).collect(),
        }
    }

    #[test]
    fn reconstruct_cycle_follows_parent_chain() {
        let parent = HashMap::from([("b", "a"), ("c", "b")]);
        let path = reconstruct_cycle("c", "a", &parent).unwrap();
        assert_eq!(path, vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn reconstruct_cycle_gives_up_on_broken_chain() {
        let parent = HashMap::from([("c", "b")]);
        assert!(reconstruct_cycle("c", "a", &parent).is_none());
    }

    #[test]
    fn duplicate_external_ids_keep_last_entry() {
        let graph = DependencyGraph::new(vec![
            group("a", &["b"]),
            group("b", &[]),
            group("a", &[]),
        ]);
        assert_eq!(graph.len(), 2);
        let order: Vec<_> = graph
            .topological_sort()
            .unwrap()
            .into_iter()
            .map(|group| group.external_id)
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn repeated_dependency_entries_count_once() {
        let graph = DependencyGraph::new(vec![group("a", &[]), group("b", &["a", "a"])]);
        let order: Vec<_> = graph
            .topological_sort()
            .unwrap()
            .into_iter()
            .map(|group| group.external_id)
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn unknown_dependency_is_not_reported_as_cycle() {
        let graph = DependencyGraph::new(vec![group("a", &["ghost"])]);
        let err = graph.detect_cycles().unwrap_err();
        assert!(matches!(
            err,
            GraphError::MissingDependency { ref group, ref depends_on }
                if group == "a" && depends_on == "ghost"
        ));
    }

    #[test]
    fn first_missing_reference_is_reported_in_id_order() {
        let graph = DependencyGraph::new(vec![
            group("web", &["zeta", "alpha"]),
            group("api", &["omega", "delta"]),
        ]);
        let err = graph.detect_cycles().unwrap_err();
        assert!(matches!(
            err,
            GraphError::MissingDependency { ref group, ref depends_on }
                if group == "api" && depends_on == "delta"
        ));
    }

    #[test]
    fn cycle_display_lists_path() {
        let err = GraphError::CircularDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular dependency detected: a -> b -> a");
        let bare = GraphError::CircularDependency { path: Vec::new() };
        assert_eq!(bare.to_string(), "circular dependency detected");
    }
}
