//! Dependency resolution.
//!
//! # Algorithm
//! ```text
//! in_degree[n] = |dependencies(n)|
//! loop:
//!     level = { n | in_degree[n] == 0, n unresolved }
//!     level empty && unresolved remain → DependencyCycleError(unresolved)
//!     for d in dependents(level): in_degree[d] -= 1
//! ```
//!
//! # Design Decisions
//! - Levels are sorted by name so output is deterministic
//! - Dependencies absent from the graph are ignored here; the registry
//!   rejects them before resolution runs

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

/// The graph contains a cycle; `services` is every node that could not be ordered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle among services: {}", .services.join(", "))]
pub struct DependencyCycleError {
    pub services: Vec<String>,
}

/// Startup levels. Every member of level `i` depends only on members of levels `< i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Levels(pub Vec<Vec<String>>);

impl Levels {
    pub fn iter(&self) -> impl Iterator<Item = &Vec<String>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only the given services, dropping levels that become empty.
    pub fn restrict(&self, keep: &BTreeSet<String>) -> Levels {
        Levels(
            self.0
                .iter()
                .map(|level| level.iter().filter(|n| keep.contains(*n)).cloned().collect::<Vec<_>>())
                .filter(|level| !level.is_empty())
                .collect(),
        )
    }

    /// Shutdown order: dependents before their dependencies.
    pub fn reversed(&self) -> Levels {
        Levels(self.0.iter().rev().cloned().collect())
    }

    /// Level index of a service, if present.
    pub fn level_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|level| level.iter().any(|n| n == name))
    }
}

/// Compute startup levels with Kahn's algorithm.
pub fn resolve_levels(graph: &BTreeMap<String, BTreeSet<String>>) -> Result<Levels, DependencyCycleError> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (name, deps) in graph {
        let known = deps.iter().filter(|d| graph.contains_key(*d));
        let mut count = 0;
        for dep in known {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
            count += 1;
        }
        in_degree.insert(name.as_str(), count);
    }

    let mut levels = Vec::new();
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();

    while !ready.is_empty() {
        let mut next = Vec::new();
        for name in &ready {
            in_degree.remove(name);
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        ready.sort_unstable();
        levels.push(ready.iter().map(|n| n.to_string()).collect());
        ready = next;
    }

    if !in_degree.is_empty() {
        return Err(DependencyCycleError {
            services: in_degree.keys().map(|n| n.to_string()).collect(),
        });
    }

    Ok(Levels(levels))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        edges
            .iter()
            .map(|(n, deps)| (n.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_levels_follow_dependencies() {
        let g = graph(&[
            ("db", &[]),
            ("cache", &[]),
            ("api", &["db", "cache"]),
            ("gateway", &["api"]),
            ("worker", &["db"]),
        ]);
        let levels = resolve_levels(&g).unwrap();
        assert_eq!(
            levels.0,
            vec![
                vec!["cache".to_string(), "db".to_string()],
                vec!["api".to_string(), "worker".to_string()],
                vec!["gateway".to_string()],
            ]
        );

        for (name, deps) in &g {
            let own = levels.level_of(name).unwrap();
            for dep in deps {
                assert!(levels.level_of(dep).unwrap() < own, "{} must come after {}", name, dep);
            }
        }
    }

    #[test]
    fn test_cycle_names_unresolved_services() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("root", &[]), ("leaf", &["a"])]);
        let err = resolve_levels(&g).unwrap_err();
        assert_eq!(err.services, vec!["a", "b", "c", "leaf"]);
    }

    #[test]
    fn test_restrict_and_reverse() {
        let g = graph(&[("db", &[]), ("cache", &[]), ("api", &["db"])]);
        let levels = resolve_levels(&g).unwrap();
        let keep: BTreeSet<String> = ["db", "api"].iter().map(|s| s.to_string()).collect();
        let restricted = levels.restrict(&keep);
        assert_eq!(restricted.0, vec![vec!["db".to_string()], vec!["api".to_string()]]);
        assert_eq!(restricted.reversed().0, vec![vec!["api".to_string()], vec!["db".to_string()]]);
    }

    #[test]
    fn test_empty_graph() {
        let levels = resolve_levels(&BTreeMap::new()).unwrap();
        assert!(levels.is_empty());
    }
}
