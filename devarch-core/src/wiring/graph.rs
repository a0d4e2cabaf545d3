//! Wiring graph for a stack.
//!
//! Nodes are instance names. An edge points from a consumer to the provider
//! it imports from, so a provider must start before every consumer that
//! points at it.

use crate::error::{DevarchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How a wiring edge came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireMode {
    Explicit,
    Auto,
}

impl std::fmt::Display for WireMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireMode::Explicit => write!(f, "explicit"),
            WireMode::Auto => write!(f, "auto"),
        }
    }
}

/// User-declared binding of a consumer import to a provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExplicitWire {
    pub consumer: String,
    pub import_name: String,
    pub provider: String,
    /// Export on the provider; inferred from the import's contract when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_name: Option<String>,
}

/// Consumer -> provider binding satisfying one contract.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WiringEdge {
    pub consumer: String,
    pub import_name: String,
    pub provider: String,
    pub export_name: String,
    pub contract: String,
    pub mode: WireMode,
    /// Environment the consumer needs to reach the provider
    pub bindings: BTreeMap<String, String>,
}

/// Validated, acyclic wiring of one stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringGraph {
    /// Instance names, sorted
    pub nodes: Vec<String>,
    /// Edges, sorted by consumer then import
    pub edges: Vec<WiringEdge>,
    /// Providers before consumers, ties broken by name
    pub startup_order: Vec<String>,
}

impl WiringGraph {
    pub fn edges_from<'a>(&'a self, consumer: &'a str) -> impl Iterator<Item = &'a WiringEdge> + 'a {
        self.edges.iter().filter(move |e| e.consumer == consumer)
    }

    pub fn has_edge(&self, consumer: &str, provider: &str) -> bool {
        self.edges.iter().any(|e| e.consumer == consumer && e.provider == provider)
    }

    /// All environment bindings for one consumer.
    pub fn bindings_for(&self, consumer: &str) -> BTreeMap<String, String> {
        self.edges_from(consumer).flat_map(|e| e.bindings.clone()).collect()
    }
}

/// Adjacency (consumer -> providers) over a fixed node set.
pub(crate) fn adjacency<'a>(
    nodes: &'a BTreeSet<String>,
    edges: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> BTreeMap<&'a str, BTreeSet<&'a str>> {
    let mut adj: BTreeMap<&str, BTreeSet<&str>> =
        nodes.iter().map(|n| (n.as_str(), BTreeSet::new())).collect();
    for (consumer, provider) in edges {
        adj.entry(consumer).or_default().insert(provider);
    }
    adj
}

/// Find a cycle with a depth-first search that tracks the recursion stack.
///
/// Returns the full cycle path with the first node repeated at the end,
/// e.g. `[a, b, a]`; a self-loop is `[a, a]`.
pub fn find_cycle(adj: &BTreeMap<&str, BTreeSet<&str>>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let mut marks: BTreeMap<&str, Mark> = adj.keys().map(|k| (*k, Mark::Unvisited)).collect();

    for &root in adj.keys() {
        if marks.get(root) != Some(&Mark::Unvisited) {
            continue;
        }

        // Iterative DFS: each frame is a node and the providers still to visit.
        let mut path: Vec<&str> = vec![root];
        let mut pending: Vec<Vec<&str>> = vec![successors(adj, root)];
        marks.insert(root, Mark::OnStack);

        while let Some(frame) = pending.last_mut() {
            let Some(next) = frame.pop() else {
                pending.pop();
                if let Some(done) = path.pop() {
                    marks.insert(done, Mark::Done);
                }
                continue;
            };

            match marks.get(next).copied().unwrap_or(Mark::Done) {
                Mark::OnStack => {
                    let start = path.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks.insert(next, Mark::OnStack);
                    path.push(next);
                    pending.push(successors(adj, next));
                }
                Mark::Done => {}
            }
        }
    }

    None
}

fn successors<'a>(adj: &BTreeMap<&'a str, BTreeSet<&'a str>>, node: &str) -> Vec<&'a str> {
    // Reversed so that popping visits providers in name order.
    adj.get(node).map(|s| s.iter().rev().copied().collect()).unwrap_or_default()
}

/// Startup order with Kahn's algorithm: providers first, ties by name.
pub fn topological_order(adj: &BTreeMap<&str, BTreeSet<&str>>) -> Result<Vec<String>> {
    // in-degree here is the number of providers a node still waits for
    let mut waiting: BTreeMap<&str, usize> = adj.iter().map(|(n, p)| (*n, p.len())).collect();

    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (consumer, providers) in adj {
        for provider in providers {
            dependents.entry(*provider).or_default().push(*consumer);
        }
    }

    let mut ready: BTreeSet<&str> =
        waiting.iter().filter(|(_, count)| **count == 0).map(|(n, _)| *n).collect();
    let mut order = Vec::with_capacity(adj.len());

    while let Some(node) = ready.pop_first() {
        order.push(node.to_string());
        for consumer in dependents.get(node).into_iter().flatten() {
            if let Some(count) = waiting.get_mut(consumer) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*consumer);
                }
            }
        }
    }

    if order.len() != adj.len() {
        return Err(find_cycle(adj)
            .map(|cycle| DevarchError::CycleDetected { cycle })
            .unwrap_or_else(|| DevarchError::Internal("topological sort stalled".to_string())));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_cycle_in_dag() {
        let n = nodes(&["a", "b", "c"]);
        let adj = adjacency(&n, [("a", "b"), ("b", "c"), ("a", "c")]);
        assert_eq!(find_cycle(&adj), None);
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let n = nodes(&["a", "b", "c", "d"]);
        let adj = adjacency(&n, [("a", "b"), ("b", "c"), ("c", "a"), ("d", "a")]);
        assert_eq!(find_cycle(&adj).unwrap(), vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_self_loop() {
        let n = nodes(&["a"]);
        let adj = adjacency(&n, [("a", "a")]);
        assert_eq!(find_cycle(&adj).unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn test_cycle_not_through_root() {
        let n = nodes(&["a", "b", "c"]);
        let adj = adjacency(&n, [("a", "b"), ("b", "c"), ("c", "b")]);
        assert_eq!(find_cycle(&adj).unwrap(), vec!["b", "c", "b"]);
    }

    #[test]
    fn test_topological_order_providers_first() {
        let n = nodes(&["web-a", "db-a", "cache"]);
        let adj = adjacency(&n, [("web-a", "db-a"), ("web-a", "cache")]);
        assert_eq!(topological_order(&adj).unwrap(), vec!["cache", "db-a", "web-a"]);
    }

    #[test]
    fn test_topological_order_ties_by_name() {
        let n = nodes(&["z", "y", "x"]);
        let adj = adjacency(&n, std::iter::empty());
        assert_eq!(topological_order(&adj).unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_topological_order_rejects_cycle() {
        let n = nodes(&["a", "b"]);
        let adj = adjacency(&n, [("a", "b"), ("b", "a")]);
        let err = topological_order(&adj).unwrap_err();
        assert!(matches!(err, DevarchError::CycleDetected { cycle } if cycle == vec!["a", "b", "a"]));
    }
}
