//! Execution order resolution.
//!
//! Requested rules pull in everything they transitively depend on. Declared
//! dependencies must be acyclic; a cycle fails the whole resolution before
//! anything runs. Rules sharing an affected table are ordered by catalog
//! position unless a declared chain already orders them. Among rules whose
//! predecessors are all placed, the earliest in the catalog goes first.

use crate::dag::{Edge, RuleGraph};
use crate::descriptor::RuleDescriptor;
use curation_core::RuleId;
use indexmap::{IndexMap, IndexSet};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

/// Configuration error found while resolving
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// A requested or depended-upon rule is not in the catalog
    #[error("unknown rule {rule}{}", .referenced_by.as_ref().map(|r| format!(" (required by {r})")).unwrap_or_default())]
    UnknownRule {
        /// The missing rule
        rule: RuleId,
        /// Rule whose `depends_on` names it, if not requested directly
        referenced_by: Option<RuleId>,
    },

    /// The same rule id appears twice in the catalog
    #[error("duplicate rule {rule} in catalog")]
    DuplicateRule {
        /// The repeated id
        rule: RuleId,
    },

    /// Declared dependencies form a cycle
    #[error("dependency cycle: {}", format_cycle(.path))]
    Cycle {
        /// Rules on the shortest cycle; the first rule is repeated at the end
        path: Vec<RuleId>,
    },
}

fn format_cycle(path: &[RuleId]) -> String {
    path.iter()
        .map(RuleId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A linear order over the resolved rules
///
/// Every rule appears after all of its dependencies. The graph is kept so
/// the scheduler can tell which rules may overlap in time.
#[derive(Debug, Clone)]
pub struct ExecutionOrder {
    /// Rules in execution order
    order: Vec<RuleId>,
    /// Graph over the resolved rules, including overlap edges
    graph: RuleGraph,
}

impl ExecutionOrder {
    /// Rule ids in execution order
    #[must_use]
    pub fn ids(&self) -> &[RuleId] {
        &self.order
    }

    /// Descriptors in execution order
    pub fn iter(&self) -> impl Iterator<Item = &RuleDescriptor> {
        self.order.iter().filter_map(|id| self.graph.get_node(id))
    }

    /// Position of a rule in the order
    #[must_use]
    pub fn position(&self, id: &RuleId) -> Option<usize> {
        self.order.iter().position(|r| r == id)
    }

    /// Descriptor of a resolved rule
    #[must_use]
    pub fn get(&self, id: &RuleId) -> Option<&RuleDescriptor> {
        self.graph.get_node(id)
    }

    /// The graph the order was derived from
    #[must_use]
    pub fn graph(&self) -> &RuleGraph {
        &self.graph
    }

    /// Number of resolved rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing was resolved
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Resolves requested rules into an [`ExecutionOrder`]
pub struct DependencyResolver {
    /// Catalog in registration order
    catalog: IndexMap<RuleId, RuleDescriptor>,
}

impl DependencyResolver {
    /// Create a resolver over a catalog
    ///
    /// # Errors
    ///
    /// Returns error if an id appears twice
    pub fn new(catalog: impl IntoIterator<Item = RuleDescriptor>) -> Result<Self, ResolveError> {
        let mut map = IndexMap::new();
        for descriptor in catalog {
            let id = descriptor.id.clone();
            if map.insert(id.clone(), descriptor).is_some() {
                return Err(ResolveError::DuplicateRule { rule: id });
            }
        }
        Ok(Self { catalog: map })
    }

    /// Resolve every rule in the catalog
    ///
    /// # Errors
    ///
    /// Returns error on unknown references or cycles
    pub fn resolve_all(&self) -> Result<ExecutionOrder, ResolveError> {
        let all: Vec<RuleId> = self.catalog.keys().cloned().collect();
        self.resolve(&all)
    }

    /// Resolve the requested rules and their transitive dependencies
    ///
    /// # Errors
    ///
    /// Returns error on unknown references or cycles
    pub fn resolve(&self, requested: &[RuleId]) -> Result<ExecutionOrder, ResolveError> {
        let selected = self.closure(requested)?;

        let mut graph = RuleGraph::new();
        for id in &selected {
            if let Some(descriptor) = self.catalog.get(id) {
                // Ids in `selected` are unique, so this cannot collide.
                let _ = graph.add_node(descriptor.clone());
            }
        }
        for id in &selected {
            if let Some(descriptor) = self.catalog.get(id) {
                for dep in &descriptor.depends_on {
                    let _ = graph.add_edge(Edge::declared(dep.clone(), id.clone()));
                }
            }
        }

        if let Some(path) = shortest_cycle(&graph, &selected) {
            return Err(ResolveError::Cycle { path });
        }

        self.add_overlap_edges(&mut graph, &selected);
        let order = topological_order(&graph, &selected);
        debug!(rules = order.len(), edges = graph.edge_count(), "resolved execution order");

        Ok(ExecutionOrder { order, graph })
    }

    /// Requested rules plus everything they depend on, in catalog order
    fn closure(&self, requested: &[RuleId]) -> Result<Vec<RuleId>, ResolveError> {
        let mut seen: IndexSet<RuleId> = IndexSet::new();
        let mut queue: VecDeque<(RuleId, Option<RuleId>)> =
            requested.iter().map(|id| (id.clone(), None)).collect();

        while let Some((id, referenced_by)) = queue.pop_front() {
            if seen.contains(&id) {
                continue;
            }
            let descriptor = self
                .catalog
                .get(&id)
                .ok_or_else(|| ResolveError::UnknownRule {
                    rule: id.clone(),
                    referenced_by: referenced_by.clone(),
                })?;
            for dep in &descriptor.depends_on {
                queue.push_back((dep.clone(), Some(id.clone())));
            }
            seen.insert(id);
        }

        Ok(self
            .catalog
            .keys()
            .filter(|id| seen.contains(*id))
            .cloned()
            .collect())
    }

    /// Order rules that share tables but are not ordered by declarations
    ///
    /// Edges only ever point from an earlier catalog position to a later one
    /// and are skipped when a path already exists, so they cannot close a
    /// cycle.
    fn add_overlap_edges(&self, graph: &mut RuleGraph, selected: &[RuleId]) {
        for (i, first) in selected.iter().enumerate() {
            for second in &selected[i + 1..] {
                let (Some(a), Some(b)) = (graph.get_node(first), graph.get_node(second)) else {
                    continue;
                };
                if !a.overlaps(b) {
                    continue;
                }
                if graph.reaches(first, second) || graph.reaches(second, first) {
                    continue;
                }
                let _ = graph.add_edge(Edge::overlap(first.clone(), second.clone()));
            }
        }
    }
}

/// Kahn's algorithm with catalog position as the tie-break
fn topological_order(graph: &RuleGraph, selected: &[RuleId]) -> Vec<RuleId> {
    let mut remaining: IndexMap<&RuleId, usize> = selected
        .iter()
        .map(|id| (id, graph.dependencies(id).len()))
        .collect();
    let mut ready: BTreeSet<usize> = selected
        .iter()
        .enumerate()
        .filter(|(_, id)| remaining.get(id).copied() == Some(0))
        .map(|(pos, _)| pos)
        .collect();
    let mut order = Vec::with_capacity(selected.len());

    while let Some(pos) = ready.pop_first() {
        let id = &selected[pos];
        order.push(id.clone());
        for next in graph.dependents(id) {
            if let Some(count) = remaining.get_mut(&next) {
                *count -= 1;
                if *count == 0 {
                    if let Some(next_pos) = selected.iter().position(|r| r == &next) {
                        ready.insert(next_pos);
                    }
                }
            }
        }
    }

    order
}

/// Shortest cycle among declared edges, if any
///
/// Runs Kahn's algorithm first; only rules it cannot place can sit on a
/// cycle. The path is returned in dependency direction: each rule depends on
/// the next, and the first rule is repeated at the end.
fn shortest_cycle(graph: &RuleGraph, selected: &[RuleId]) -> Option<Vec<RuleId>> {
    let placed: IndexSet<RuleId> = topological_order(graph, selected).into_iter().collect();
    let stuck: Vec<&RuleId> = selected.iter().filter(|id| !placed.contains(*id)).collect();
    if stuck.is_empty() {
        return None;
    }

    let mut best: Option<Vec<RuleId>> = None;
    for &start in &stuck {
        // BFS from `start` along "depends on" edges back to `start`.
        let mut parent: IndexMap<RuleId, RuleId> = IndexMap::new();
        let mut queue = VecDeque::from([start.clone()]);
        let mut found = None;

        'search: while let Some(current) = queue.pop_front() {
            for dep in graph.declared_dependencies(&current) {
                if &dep == start {
                    found = Some(current.clone());
                    break 'search;
                }
                if placed.contains(&dep) || parent.contains_key(&dep) {
                    continue;
                }
                parent.insert(dep.clone(), current.clone());
                queue.push_back(dep);
            }
        }

        if let Some(last) = found {
            let mut path = vec![last.clone()];
            let mut cursor = last;
            while &cursor != start {
                match parent.get(&cursor) {
                    Some(prev) => {
                        path.push(prev.clone());
                        cursor = prev.clone();
                    }
                    None => break,
                }
            }
            path.reverse();
            path.push(start.clone());
            if best.as_ref().is_none_or(|b| path.len() < b.len()) {
                best = Some(path);
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(name: &str) -> RuleId {
        RuleId::new(name).unwrap()
    }

    fn rule(name: &str, table: &str, deps: &[&str]) -> RuleDescriptor {
        let mut d = RuleDescriptor::new(id(name), "test").with_affected_table(table);
        for dep in deps {
            d = d.with_dependency(id(dep));
        }
        d
    }

    fn names(order: &ExecutionOrder) -> Vec<&str> {
        order.ids().iter().map(RuleId::as_str).collect()
    }

    #[test]
    fn test_dependency_before_dependent() {
        let resolver = DependencyResolver::new(vec![
            rule("b", "t2", &["a"]),
            rule("a", "t1", &[]),
            rule("c", "t3", &[]),
        ])
        .unwrap();

        let order = resolver.resolve_all().unwrap();
        assert_eq!(names(&order), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_catalog_order_tie_break() {
        let resolver = DependencyResolver::new(vec![
            rule("z", "t1", &[]),
            rule("y", "t2", &[]),
            rule("x", "t3", &[]),
        ])
        .unwrap();

        let order = resolver.resolve_all().unwrap();
        assert_eq!(names(&order), vec!["z", "y", "x"]);
    }

    #[test]
    fn test_requested_pulls_in_dependencies() {
        let resolver = DependencyResolver::new(vec![
            rule("a", "t1", &[]),
            rule("b", "t2", &["a"]),
            rule("c", "t3", &["b"]),
            rule("d", "t4", &[]),
        ])
        .unwrap();

        let order = resolver.resolve(&[id("c")]).unwrap();
        assert_eq!(names(&order), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unknown_requested_rule() {
        let resolver = DependencyResolver::new(vec![rule("a", "t1", &[])]).unwrap();
        let err = resolver.resolve(&[id("missing")]).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownRule {
                rule: id("missing"),
                referenced_by: None
            }
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let resolver = DependencyResolver::new(vec![rule("a", "t1", &["ghost"])]).unwrap();
        let err = resolver.resolve_all().unwrap_err();
        assert_eq!(err.to_string(), "unknown rule ghost (required by a)");
    }

    #[test]
    fn test_duplicate_rule() {
        let result = DependencyResolver::new(vec![rule("a", "t1", &[]), rule("a", "t2", &[])]);
        assert!(matches!(result, Err(ResolveError::DuplicateRule { .. })));
    }

    #[test]
    fn test_self_cycle() {
        let resolver = DependencyResolver::new(vec![rule("a", "t1", &["a"])]).unwrap();
        let err = resolver.resolve_all().unwrap_err();
        assert_eq!(err, ResolveError::Cycle { path: vec![id("a"), id("a")] });
    }

    #[test]
    fn test_minimal_cycle_reported() {
        // a -> b -> c -> a is a 3-cycle; d <-> e is a 2-cycle.
        let resolver = DependencyResolver::new(vec![
            rule("a", "t1", &["b"]),
            rule("b", "t2", &["c"]),
            rule("c", "t3", &["a"]),
            rule("d", "t4", &["e"]),
            rule("e", "t5", &["d"]),
        ])
        .unwrap();

        let err = resolver.resolve_all().unwrap_err();
        match err {
            ResolveError::Cycle { path } => assert_eq!(path.len(), 3),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_message() {
        let resolver =
            DependencyResolver::new(vec![rule("a", "t1", &["b"]), rule("b", "t2", &["a"])]).unwrap();
        let err = resolver.resolve_all().unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }

    #[test]
    fn test_overlap_orders_by_catalog() {
        let resolver = DependencyResolver::new(vec![
            rule("first", "observation", &[]),
            rule("other", "person", &[]),
            rule("second", "observation", &[]),
        ])
        .unwrap();

        let order = resolver.resolve_all().unwrap();
        let g = order.graph();
        assert!(g.reaches(&id("first"), &id("second")));
        assert!(g.independent(&id("first"), &id("other")));
        assert!(g.declared_dependencies(&id("second")).is_empty());
    }

    #[test]
    fn test_overlap_respects_declared_direction() {
        // "early" is earlier in the catalog but declares a dependency on
        // "late"; the overlap edge must not invert that.
        let resolver = DependencyResolver::new(vec![
            rule("early", "observation", &["late"]),
            rule("late", "observation", &[]),
        ])
        .unwrap();

        let order = resolver.resolve_all().unwrap();
        assert_eq!(names(&order), vec!["late", "early"]);
    }

    #[test]
    fn test_overlap_never_creates_cycle() {
        // a depends on c; a/b and b/c overlap. Naive catalog-order overlap
        // edges would give c < a < b < c.
        let a = rule("a", "t_ab", &["c"]);
        let b = rule("b", "t_ab", &[]).with_affected_table("t_bc");
        let c = rule("c", "t_bc", &[]);
        let resolver = DependencyResolver::new(vec![a, b, c]).unwrap();

        let order = resolver.resolve_all().unwrap();
        assert_eq!(order.len(), 3);
        assert!(order.position(&id("c")) < order.position(&id("a")));
    }

    #[test]
    fn test_dataset_wide_rule_is_sequenced() {
        let wide = RuleDescriptor::new(id("wide"), "dataset-wide");
        let resolver =
            DependencyResolver::new(vec![rule("a", "t1", &[]), wide, rule("b", "t2", &[])]).unwrap();

        let order = resolver.resolve_all().unwrap();
        let g = order.graph();
        assert!(g.reaches(&id("a"), &id("wide")));
        assert!(g.reaches(&id("wide"), &id("b")));
        assert!(g.independent(&id("a"), &id("b")) || g.reaches(&id("a"), &id("b")));
    }

    #[test]
    fn test_empty_request() {
        let resolver = DependencyResolver::new(vec![rule("a", "t1", &[])]).unwrap();
        let order = resolver.resolve(&[]).unwrap();
        assert!(order.is_empty());
    }

    /// Random acyclic catalogs: each rule may depend only on earlier-indexed
    /// rules, then the catalog is listed in reverse.
    fn acyclic_catalog() -> impl Strategy<Value = Vec<RuleDescriptor>> {
        (1usize..12).prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n).prop_map(
                move |matrix| {
                    let mut rules = Vec::new();
                    for (i, row) in matrix.iter().enumerate() {
                        let mut d = RuleDescriptor::new(id(&format!("r{i}")), "gen")
                            .with_affected_table(format!("t{}", i % 3));
                        for (j, &edge) in row.iter().enumerate().take(i) {
                            if edge {
                                d = d.with_dependency(id(&format!("r{j}")));
                            }
                        }
                        rules.push(d);
                    }
                    rules.reverse();
                    rules
                },
            )
        })
    }

    proptest! {
        #[test]
        fn prop_dependencies_precede_dependents(catalog in acyclic_catalog()) {
            let resolver = DependencyResolver::new(catalog.clone()).unwrap();
            let order = resolver.resolve_all().unwrap();
            prop_assert_eq!(order.len(), catalog.len());
            for d in &catalog {
                let me = order.position(&d.id).unwrap();
                for dep in &d.depends_on {
                    prop_assert!(order.position(dep).unwrap() < me);
                }
            }
        }

        #[test]
        fn prop_resolution_is_deterministic(catalog in acyclic_catalog()) {
            let resolver = DependencyResolver::new(catalog).unwrap();
            let first = resolver.resolve_all().unwrap();
            let second = resolver.resolve_all().unwrap();
            prop_assert_eq!(first.ids(), second.ids());
        }

        #[test]
        fn prop_any_ring_is_detected(len in 1usize..10) {
            let catalog: Vec<RuleDescriptor> = (0..len)
                .map(|i| {
                    let name = format!("r{i}");
                    let next = format!("r{}", (i + 1) % len);
                    rule(&name, "t", &[next.as_str()])
                })
                .collect();
            let resolver = DependencyResolver::new(catalog).unwrap();
            match resolver.resolve_all() {
                Err(ResolveError::Cycle { path }) => prop_assert_eq!(path.len(), len + 1),
                other => prop_assert!(false, "expected cycle, got {:?}", other.map(|o| o.len())),
            }
        }
    }
}
