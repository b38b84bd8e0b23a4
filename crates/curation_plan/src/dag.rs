//! Dependency graph over cleaning rules.
//!
//! Nodes are rule descriptors in catalog order. An edge `from -> to` means
//! `from` must finish before `to` starts. Declared edges come from
//! `depends_on`; overlap edges are added by the resolver between rules that
//! touch a common table.

use crate::descriptor::RuleDescriptor;
use curation_core::{CoreError, CoreResult, RuleId};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// Why an edge exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// `to` lists `from` in its `depends_on`
    Declared,
    /// The rules share an affected table; catalog order decides direction
    TableOverlap,
}

/// An edge between rules
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Rule that runs first
    pub from: RuleId,
    /// Rule that runs after `from`
    pub to: RuleId,
    /// Origin of the edge
    pub kind: EdgeKind,
}

impl Edge {
    /// Create a declared edge
    #[must_use]
    pub fn declared(from: RuleId, to: RuleId) -> Self {
        Self {
            from,
            to,
            kind: EdgeKind::Declared,
        }
    }

    /// Create a table-overlap edge
    #[must_use]
    pub fn overlap(from: RuleId, to: RuleId) -> Self {
        Self {
            from,
            to,
            kind: EdgeKind::TableOverlap,
        }
    }
}

/// Directed graph of rules
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleGraph {
    /// All rules, in catalog order
    nodes: IndexMap<RuleId, RuleDescriptor>,
    /// All edges
    edges: Vec<Edge>,
    /// rule -> rules that must run before it
    predecessors: IndexMap<RuleId, IndexSet<RuleId>>,
    /// rule -> rules that must run after it
    successors: IndexMap<RuleId, IndexSet<RuleId>>,
}

impl RuleGraph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule
    ///
    /// # Errors
    ///
    /// Returns error if the rule is already present
    pub fn add_node(&mut self, descriptor: RuleDescriptor) -> CoreResult<()> {
        let id = descriptor.id.clone();
        if self.nodes.contains_key(&id) {
            return Err(CoreError::AlreadyExists {
                kind: "Rule".to_string(),
                id: id.to_string(),
            });
        }
        self.predecessors.insert(id.clone(), IndexSet::new());
        self.successors.insert(id.clone(), IndexSet::new());
        self.nodes.insert(id, descriptor);
        Ok(())
    }

    /// Add an edge between two rules already in the graph
    ///
    /// Adding an edge that is already present is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if either endpoint is missing
    pub fn add_edge(&mut self, edge: Edge) -> CoreResult<()> {
        for id in [&edge.from, &edge.to] {
            if !self.nodes.contains_key(id) {
                return Err(CoreError::NotFound {
                    kind: "Rule".to_string(),
                    id: id.to_string(),
                });
            }
        }
        let new = self
            .predecessors
            .get_mut(&edge.to)
            .map(|preds| preds.insert(edge.from.clone()))
            .unwrap_or(false);
        if new {
            if let Some(succs) = self.successors.get_mut(&edge.from) {
                succs.insert(edge.to.clone());
            }
            self.edges.push(edge);
        }
        Ok(())
    }

    /// Whether `from` must run before `to` through some chain of edges
    #[must_use]
    pub fn reaches(&self, from: &RuleId, to: &RuleId) -> bool {
        let mut visited: IndexSet<&RuleId> = IndexSet::new();
        let mut stack = vec![from];

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(succs) = self.successors.get(current) {
                for next in succs {
                    if next == to {
                        return true;
                    }
                    stack.push(next);
                }
            }
        }

        false
    }

    /// Whether there is no path between two rules in either direction
    #[must_use]
    pub fn independent(&self, a: &RuleId, b: &RuleId) -> bool {
        a != b && !self.reaches(a, b) && !self.reaches(b, a)
    }

    /// Get rule by id
    #[must_use]
    pub fn get_node(&self, id: &RuleId) -> Option<&RuleDescriptor> {
        self.nodes.get(id)
    }

    /// Position of a rule in catalog order
    #[must_use]
    pub fn catalog_position(&self, id: &RuleId) -> Option<usize> {
        self.nodes.get_index_of(id)
    }

    /// Rules that must run directly before `id` (declared and overlap)
    #[must_use]
    pub fn dependencies(&self, id: &RuleId) -> Vec<RuleId> {
        self.predecessors
            .get(id)
            .map(|preds| preds.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rules `id` declares in `depends_on`
    #[must_use]
    pub fn declared_dependencies(&self, id: &RuleId) -> Vec<RuleId> {
        self.edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Declared && &e.to == id)
            .map(|e| e.from.clone())
            .collect()
    }

    /// Rules that must run directly after `id`
    #[must_use]
    pub fn dependents(&self, id: &RuleId) -> Vec<RuleId> {
        self.successors
            .get(id)
            .map(|succs| succs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rules that declare `id` in their `depends_on`
    #[must_use]
    pub fn declared_dependents(&self, id: &RuleId) -> Vec<RuleId> {
        self.edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Declared && &e.from == id)
            .map(|e| e.to.clone())
            .collect()
    }

    /// All rules in catalog order
    pub fn nodes(&self) -> impl Iterator<Item = &RuleDescriptor> {
        self.nodes.values()
    }

    /// All edges
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Get total node count
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get total edge count
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Check if graph is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> RuleId {
        RuleId::new(name).unwrap()
    }

    fn node(name: &str) -> RuleDescriptor {
        RuleDescriptor::new(id(name), "test")
    }

    fn graph(names: &[&str]) -> RuleGraph {
        let mut g = RuleGraph::new();
        for name in names {
            g.add_node(node(name)).unwrap();
        }
        g
    }

    #[test]
    fn test_graph_new() {
        let g = RuleGraph::new();
        assert!(g.is_empty());
        assert_eq!(g.node_count(), 0);
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_add_node_duplicate() {
        let mut g = graph(&["a"]);
        assert!(g.add_node(node("a")).is_err());
    }

    #[test]
    fn test_add_edge_missing_node() {
        let mut g = graph(&["a"]);
        assert!(g.add_edge(Edge::declared(id("a"), id("b"))).is_err());
    }

    #[test]
    fn test_add_edge_idempotent() {
        let mut g = graph(&["a", "b"]);
        g.add_edge(Edge::declared(id("a"), id("b"))).unwrap();
        g.add_edge(Edge::declared(id("a"), id("b"))).unwrap();
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn test_reaches_transitively() {
        let mut g = graph(&["a", "b", "c", "d"]);
        g.add_edge(Edge::declared(id("a"), id("b"))).unwrap();
        g.add_edge(Edge::overlap(id("b"), id("c"))).unwrap();

        assert!(g.reaches(&id("a"), &id("c")));
        assert!(!g.reaches(&id("c"), &id("a")));
        assert!(g.independent(&id("a"), &id("d")));
        assert!(!g.independent(&id("a"), &id("c")));
    }

    #[test]
    fn test_declared_vs_all_dependencies() {
        let mut g = graph(&["a", "b", "c"]);
        g.add_edge(Edge::declared(id("a"), id("c"))).unwrap();
        g.add_edge(Edge::overlap(id("b"), id("c"))).unwrap();

        assert_eq!(g.dependencies(&id("c")), vec![id("a"), id("b")]);
        assert_eq!(g.declared_dependencies(&id("c")), vec![id("a")]);
        assert_eq!(g.declared_dependents(&id("a")), vec![id("c")]);
        assert!(g.declared_dependents(&id("b")).is_empty());
        assert_eq!(g.dependents(&id("b")), vec![id("c")]);
    }

    #[test]
    fn test_catalog_position() {
        let g = graph(&["x", "y"]);
        assert_eq!(g.catalog_position(&id("y")), Some(1));
        assert_eq!(g.catalog_position(&id("z")), None);
    }
}
