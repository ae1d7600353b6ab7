//! Directed dependency graph for gridlock analysis.
//!
//! Nodes are tracked steps; an edge `A → B` means "A wants a qutex that is
//! held somewhere in B's ancestor chain". A cycle in this relation is a
//! gridlock: every participant waits on a qutex that only another
//! participant's progress could release.
//!
//! The graph is transient: built on demand from the acquisition history,
//! inspected, and dropped.

use std::collections::{BTreeMap, BTreeSet};

use crate::continuation::StepId;

/// A wants-lock-held-by graph over tracked steps.
///
/// Adjacency is kept in ordered maps so cycle reports come out in a
/// deterministic order regardless of insertion interleaving.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    adjacency: BTreeMap<StepId, BTreeSet<StepId>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with no edges. Adding an existing node is a no-op.
    pub fn add_node(&mut self, node: StepId) {
        self.adjacency.entry(node).or_default();
    }

    /// Adds a directed edge from `source` (the wanting step) to `target`
    /// (the holding step), creating both nodes as needed.
    pub fn add_edge(&mut self, source: StepId, target: StepId) {
        self.adjacency.entry(target).or_default();
        self.adjacency.entry(source).or_default().insert(target);
    }

    /// Number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    /// Returns true if the graph contains at least one cycle.
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        !self.find_cycles().is_empty()
    }

    /// Finds every cycle reachable by depth-first search.
    ///
    /// Each cycle is returned as the sequence of nodes along it, starting at
    /// the node the back edge returns to; the closing edge from the last
    /// node back to the first is implicit.
    #[must_use]
    pub fn find_cycles(&self) -> Vec<Vec<StepId>> {
        let mut visited = BTreeSet::new();
        let mut in_stack = BTreeSet::new();
        let mut path = Vec::new();
        let mut cycles = Vec::new();

        for &node in self.adjacency.keys() {
            if !visited.contains(&node) {
                self.dfs(node, &mut visited, &mut in_stack, &mut path, &mut cycles);
            }
        }
        cycles
    }

    fn dfs(
        &self,
        node: StepId,
        visited: &mut BTreeSet<StepId>,
        in_stack: &mut BTreeSet<StepId>,
        path: &mut Vec<StepId>,
        cycles: &mut Vec<Vec<StepId>>,
    ) {
        visited.insert(node);
        in_stack.insert(node);
        path.push(node);

        if let Some(adjacent) = self.adjacency.get(&node) {
            for &next in adjacent {
                if in_stack.contains(&next) {
                    // Back edge: the cycle is the path suffix starting at
                    // the node we came back to.
                    if let Some(start) = path.iter().position(|&n| n == next) {
                        cycles.push(path[start..].to_vec());
                    }
                } else if !visited.contains(&next) {
                    self.dfs(next, visited, in_stack, path, cycles);
                }
            }
        }

        in_stack.remove(&node);
        path.pop();
    }
}
