//! Target graph builder using petgraph.
//!
//! Edges point from a dependency to its dependent, so a topological walk
//! yields dependencies first.

use crate::{Error, Result, TargetNode};
use petgraph::Direction;
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::IntoNodeReferences;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

/// Dependency graph over a set of targets.
pub struct TargetGraph<T: TargetNode> {
    graph: DiGraph<T, ()>,
    id_to_node: HashMap<String, NodeIndex>,
}

impl<T: TargetNode> TargetGraph<T> {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            id_to_node: HashMap::new(),
        }
    }

    /// Build a graph from a dependency-closed set of targets.
    ///
    /// # Errors
    ///
    /// Returns an error if a target depends on an id that is not in the set,
    /// or if the dependencies form a cycle.
    pub fn from_closure(targets: impl IntoIterator<Item = T>) -> Result<Self> {
        let mut graph = Self::new();
        for target in targets {
            graph.add_target(target);
        }
        graph.add_dependency_edges()?;
        graph.ensure_acyclic()?;
        Ok(graph)
    }

    /// Build a graph from an arbitrary subset of targets.
    ///
    /// Dependencies on targets outside the subset are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the dependencies inside the subset form a cycle.
    pub fn from_subset(targets: impl IntoIterator<Item = T>) -> Result<Self> {
        let mut graph = Self::new();
        for target in targets {
            graph.add_target(target);
        }
        graph.add_internal_edges();
        graph.ensure_acyclic()?;
        Ok(graph)
    }

    /// Add a single target to the graph.
    ///
    /// If a target with the same id already exists, returns the existing node
    /// index and keeps the first definition.
    pub fn add_target(&mut self, target: T) -> NodeIndex {
        if let Some(&node) = self.id_to_node.get(target.id()) {
            return node;
        }

        let id = target.id().to_string();
        let node_index = self.graph.add_node(target);
        debug!(target = %id, "Added target node");
        self.id_to_node.insert(id, node_index);
        node_index
    }

    /// Add dependency edges after all targets have been added.
    ///
    /// # Errors
    ///
    /// Returns an error listing every dependency that names an unknown target.
    pub fn add_dependency_edges(&mut self) -> Result<()> {
        let mut missing_deps = Vec::new();
        let mut edges_to_add = Vec::new();

        for (node_index, target) in self.graph.node_references() {
            for dep_id in target.dependency_ids() {
                if let Some(&dep_index) = self.id_to_node.get(dep_id) {
                    edges_to_add.push((dep_index, node_index));
                } else {
                    missing_deps.push((target.id().to_string(), dep_id.to_string()));
                }
            }
        }

        if !missing_deps.is_empty() {
            return Err(Error::MissingDependencies {
                missing: missing_deps,
            });
        }

        for (from, to) in edges_to_add {
            self.graph.update_edge(from, to, ());
        }
        Ok(())
    }

    /// Add edges only between targets present in the graph.
    ///
    /// Returns the number of dependencies that were skipped because they point
    /// outside the graph.
    pub fn add_internal_edges(&mut self) -> usize {
        let mut skipped = 0;
        let mut edges_to_add = Vec::new();

        for (node_index, target) in self.graph.node_references() {
            for dep_id in target.dependency_ids() {
                if let Some(&dep_index) = self.id_to_node.get(dep_id) {
                    edges_to_add.push((dep_index, node_index));
                } else {
                    skipped += 1;
                }
            }
        }

        for (from, to) in edges_to_add {
            self.graph.update_edge(from, to, ());
        }
        if skipped > 0 {
            debug!(skipped, "Ignored dependencies on targets outside the graph");
        }
        skipped
    }

    /// Check if the graph has cycles.
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    fn ensure_acyclic(&self) -> Result<()> {
        if !self.has_cycles() {
            return Ok(());
        }
        let cycle = tarjan_scc(&self.graph)
            .into_iter()
            .find(|component| {
                component.len() > 1 || self.graph.contains_edge(component[0], component[0])
            })
            .unwrap_or_default();
        let mut targets: Vec<String> = cycle
            .into_iter()
            .map(|idx| self.graph[idx].id().to_string())
            .collect();
        targets.sort();
        Err(Error::CycleDetected { targets })
    }

    /// Return the targets ordered so that every dependency precedes its
    /// dependents. Targets that are otherwise unordered are sorted by id, so
    /// the result is deterministic for a given set of targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph contains cycles.
    pub fn topological_sort(&self) -> Result<Vec<&T>> {
        self.ensure_acyclic()?;

        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let degree = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count();
                (idx, degree)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(&str, NodeIndex)>> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&idx, _)| Reverse((self.graph[idx].id(), idx)))
            .collect();

        let mut sorted = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((_, idx))) = ready.pop() {
            sorted.push(&self.graph[idx]);
            for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.graph[dependent].id(), dependent)));
                    }
                }
            }
        }
        Ok(sorted)
    }

    /// Direct dependencies of a target, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the target is not part of the graph.
    pub fn dependencies(&self, id: &str) -> Result<Vec<&T>> {
        let &idx = self
            .id_to_node
            .get(id)
            .ok_or_else(|| Error::UnknownTarget { id: id.to_string() })?;
        let mut deps: Vec<&T> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|dep| &self.graph[dep])
            .collect();
        deps.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(deps)
    }

    /// Look up a target by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&T> {
        self.id_to_node
            .get(id)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    /// Check if a target exists in the graph.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.id_to_node.contains_key(id)
    }

    /// Get the number of targets in the graph.
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Iterate over all targets in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.graph.node_references().map(|(_, target)| target)
    }
}

impl<T: TargetNode> Default for TargetGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}
