//! Delegation bookkeeping between agent calls.
//!
//! Nodes are call identifiers (signatures). An edge `parent -> child` means the
//! parent call delegated work to the child call. Edges are validated before
//! they are committed, so a rejected edge never appears in the adjacency map.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::signature::sha256_hex;

#[derive(Debug, Clone, Default)]
pub struct DelegationGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
    subtree_signatures: BTreeSet<String>,
}

impl DelegationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `parent -> child` unless it would close a cycle.
    ///
    /// Returns `false` (and leaves the graph untouched) when the edge is a
    /// self-loop or the child already reaches the parent.
    pub fn add_edge(&mut self, parent: &str, child: &str) -> bool {
        if self.contains_edge(parent, child) {
            return true;
        }
        if parent == child || self.has_path(child, parent) {
            return false;
        }
        self.edges
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
        debug_assert!(!self.has_cycle_from(parent));
        true
    }

    pub fn contains_edge(&self, parent: &str, child: &str) -> bool {
        self.edges
            .get(parent)
            .is_some_and(|children| children.contains(child))
    }

    pub fn children(&self, parent: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(parent)
            .into_iter()
            .flat_map(|children| children.iter().map(String::as_str))
    }

    /// True when `to` is reachable from `from` over one or more edges.
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        let mut visited = BTreeSet::new();
        let mut pending = vec![from];
        while let Some(node) = pending.pop() {
            for child in self.children(node) {
                if child == to {
                    return true;
                }
                if visited.insert(child) {
                    pending.push(child);
                }
            }
        }
        false
    }

    /// Depth-first cycle check from `start`.
    ///
    /// `visited` holds fully explored nodes; `stack` holds nodes on the current
    /// path. Reaching a node that is on the stack is a cycle.
    pub fn has_cycle_from(&self, start: &str) -> bool {
        let mut visited = BTreeSet::new();
        let mut stack = BTreeSet::new();
        self.visit(start, &mut visited, &mut stack)
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        visited: &mut BTreeSet<&'a str>,
        stack: &mut BTreeSet<&'a str>,
    ) -> bool {
        if stack.contains(node) {
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        stack.insert(node);
        for child in self.children(node) {
            if self.visit(child, visited, stack) {
                return true;
            }
        }
        stack.remove(node);
        visited.insert(node);
        false
    }

    /// Remember that `call_signature` produced `artifact_hash`.
    ///
    /// Returns `true` when the same pair was recorded before, meaning the
    /// subtree is a duplicate and its earlier result can be reused.
    pub fn record_artifacts(&mut self, call_signature: &str, artifact_hash: &str) -> bool {
        let subtree = sha256_hex(format!("{call_signature}:{artifact_hash}"));
        !self.subtree_signatures.insert(subtree)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_edge_closing_a_cycle_and_keeps_graph_acyclic() {
        let mut graph = DelegationGraph::new();
        assert!(graph.add_edge("a", "b"));
        assert!(graph.add_edge("b", "c"));
        assert!(!graph.add_edge("c", "a"));

        assert!(!graph.contains_edge("c", "a"));
        assert!(!graph.has_path("a", "a"));
        assert!(!graph.has_path("c", "a"));
        assert!(!graph.has_cycle_from("a"));
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn rejects_self_loop() {
        let mut graph = DelegationGraph::new();
        assert!(!graph.add_edge("a", "a"));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DelegationGraph::new();
        assert!(graph.add_edge("root", "left"));
        assert!(graph.add_edge("root", "right"));
        assert!(graph.add_edge("left", "leaf"));
        assert!(graph.add_edge("right", "leaf"));
        assert!(graph.add_edge("root", "leaf"));
        assert!(!graph.has_cycle_from("root"));
        assert_eq!(graph.children("root").collect::<Vec<_>>(), vec!["leaf", "left", "right"]);
    }

    #[test]
    fn re_adding_existing_edge_is_idempotent() {
        let mut graph = DelegationGraph::new();
        assert!(graph.add_edge("a", "b"));
        assert!(graph.add_edge("a", "b"));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn record_artifacts_flags_duplicate_subtrees() {
        let mut graph = DelegationGraph::new();
        assert!(!graph.record_artifacts("sig", "hash"));
        assert!(graph.record_artifacts("sig", "hash"));
        assert!(!graph.record_artifacts("sig", "other"));
    }
}
