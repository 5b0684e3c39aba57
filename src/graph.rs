//! Generic directed dependency graph.
//!
//! An edge `u -> v` means "`u` depends on `v`", so `v` has to be finished
//! before `u` may start. Nodes are opaque identifiers; the build uses task
//! names, but anything hashable works.
//!
//! Storage is a [`petgraph::Graph`] plus an index from identifiers to
//! [`NodeIndex`]. Edge indices grow monotonically because edges are never
//! removed, which is what lets [`Graph::resolve`] walk dependencies in the
//! order they were declared.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::GraphError;

#[derive(Clone)]
pub struct Graph<N> {
    inner: DiGraph<N, ()>,
    index: HashMap<N, NodeIndex>,
}

impl<N> Graph<N>
where
    N: Clone + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self {
            inner: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Registers `node`. Adding a node twice is a no-op.
    pub fn add_node(&mut self, node: N) {
        if !self.index.contains_key(&node) {
            let index = self.inner.add_node(node.clone());
            self.index.insert(node, index);
        }
    }

    /// Records that `from` depends on `to`. Both endpoints must already be
    /// present. Repeating an existing edge is a no-op.
    pub fn add_edge(&mut self, from: &N, to: &N) -> Result<(), GraphError<N>> {
        if from == to {
            return Err(GraphError::SelfDependency(from.clone()));
        }

        let a = self.index_of(from)?;
        let b = self.index_of(to)?;

        if self.inner.find_edge(a, b).is_none() {
            self.inner.add_edge(a, b, ());
        }

        Ok(())
    }

    pub fn contains(&self, node: &N) -> bool {
        self.index.contains_key(node)
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.inner.node_indices().map(|index| &self.inner[index])
    }

    /// Direct dependencies of `node`, in the order the edges were added.
    pub fn dependencies(&self, node: &N) -> Result<Vec<&N>, GraphError<N>> {
        let index = self.index_of(node)?;
        Ok(self
            .dependencies_of(index)
            .into_iter()
            .map(|dep| &self.inner[dep])
            .collect())
    }

    /// Nodes which directly depend on `node`.
    pub fn dependents(&self, node: &N) -> Result<Vec<&N>, GraphError<N>> {
        let index = self.index_of(node)?;
        let mut edges: Vec<_> = self
            .inner
            .edges_directed(index, Direction::Incoming)
            .collect();
        edges.sort_by_key(|edge| edge.id());

        Ok(edges
            .into_iter()
            .map(|edge| &self.inner[edge.source()])
            .collect())
    }

    /// Every edge as `(dependent, dependency)` in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = (&N, &N)> {
        self.inner
            .raw_edges()
            .iter()
            .map(|edge| (&self.inner[edge.source()], &self.inner[edge.target()]))
    }

    /// Returns every node reachable from `start`, dependencies first.
    ///
    /// This is a post-order depth-first walk: the dependencies of a node are
    /// visited in edge insertion order, and the node itself is emitted once
    /// all of them have been emitted. Nodes that aren't reachable from `start`
    /// are left out. If a cycle is reachable the call fails and nothing is
    /// returned.
    pub fn resolve(&self, start: &N) -> Result<Vec<N>, GraphError<N>> {
        let start = self.index_of(start)?;

        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut on_path = HashSet::from([start]);
        let mut stack = vec![(start, self.dependencies_of(start).into_iter())];

        while let Some((node, deps)) = stack.last_mut() {
            let node = *node;
            let next = deps.next();

            match next {
                Some(dep) if done.contains(&dep) => {}
                Some(dep) if on_path.contains(&dep) => {
                    let from = stack
                        .iter()
                        .position(|(index, _)| *index == dep)
                        .unwrap_or_default();

                    let mut cycle: Vec<N> = stack[from..]
                        .iter()
                        .map(|(index, _)| self.inner[*index].clone())
                        .collect();
                    cycle.push(self.inner[dep].clone());

                    return Err(GraphError::CycleDetected { cycle });
                }
                Some(dep) => {
                    on_path.insert(dep);
                    stack.push((dep, self.dependencies_of(dep).into_iter()));
                }
                None => {
                    stack.pop();
                    on_path.remove(&node);
                    done.insert(node);
                    order.push(node);
                }
            }
        }

        Ok(order
            .into_iter()
            .map(|index| self.inner[index].clone())
            .collect())
    }

    fn index_of(&self, node: &N) -> Result<NodeIndex, GraphError<N>> {
        self.index
            .get(node)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(node.clone()))
    }

    fn dependencies_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut edges: Vec<_> = self.inner.edges(index).collect();
        edges.sort_by_key(|edge| edge.id());
        edges.into_iter().map(|edge| edge.target()).collect()
    }
}

impl<N> Default for Graph<N>
where
    N: Clone + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Debug> Debug for Graph<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.inner.node_count())
            .field("edges", &self.inner.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&'static str, &'static str)]) -> Graph<&'static str> {
        let mut graph = Graph::new();
        for (from, to) in edges {
            graph.add_node(*from);
            graph.add_node(*to);
        }
        for (from, to) in edges {
            graph.add_edge(from, to).unwrap();
        }
        graph
    }

    #[test]
    fn test_resolve_excludes_unreachable() {
        let graph = graph(&[("foo", "bar"), ("bar", "baz"), ("bob", "alice")]);

        assert_eq!(graph.resolve(&"foo").unwrap(), vec!["baz", "bar", "foo"]);
        assert_eq!(graph.resolve(&"bob").unwrap(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_resolve_single_node() {
        let mut graph = Graph::new();
        graph.add_node("lonely");
        assert_eq!(graph.resolve(&"lonely").unwrap(), vec!["lonely"]);
    }

    #[test]
    fn test_resolve_follows_insertion_order() {
        let graph = graph(&[("app", "zeta"), ("app", "alpha"), ("app", "mid")]);
        assert_eq!(
            graph.resolve(&"app").unwrap(),
            vec!["zeta", "alpha", "mid", "app"]
        );
    }

    #[test]
    fn test_resolve_diamond_emits_once() {
        let graph = graph(&[
            ("top", "left"),
            ("top", "right"),
            ("left", "base"),
            ("right", "base"),
        ]);

        let order = graph.resolve(&"top").unwrap();
        assert_eq!(order, vec!["base", "left", "right", "top"]);
    }

    #[test]
    fn test_resolve_dependencies_before_dependents() {
        let graph = graph(&[
            ("e", "d"),
            ("e", "c"),
            ("d", "b"),
            ("c", "b"),
            ("c", "a"),
            ("b", "a"),
        ]);

        let order = graph.resolve(&"e").unwrap();
        let position = |n: &str| order.iter().position(|x| *x == n).unwrap();

        assert_eq!(order.len(), 5);
        for (from, to) in graph.edges() {
            assert!(position(to) < position(from), "{to} must precede {from}");
        }
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let graph = graph(&[("a", "b"), ("a", "c"), ("c", "b")]);
        assert_eq!(graph.resolve(&"a").unwrap(), graph.resolve(&"a").unwrap());
    }

    #[test]
    fn test_cycle_detected() {
        let graph = graph(&[("a", "b"), ("b", "c"), ("c", "a")]);

        match graph.resolve(&"a") {
            Err(GraphError::CycleDetected { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_below_start() {
        let graph = graph(&[("top", "x"), ("x", "y"), ("y", "x")]);

        assert!(matches!(
            graph.resolve(&"top"),
            Err(GraphError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_cycle_elsewhere_is_ignored() {
        let graph = graph(&[("ok", "fine"), ("x", "y"), ("y", "x")]);
        assert_eq!(graph.resolve(&"ok").unwrap(), vec!["fine", "ok"]);
    }

    #[test]
    fn test_unknown_node() {
        let mut graph = Graph::new();
        graph.add_node("a");

        assert_eq!(
            graph.add_edge(&"a", &"missing"),
            Err(GraphError::UnknownNode("missing"))
        );
        assert_eq!(
            graph.resolve(&"missing"),
            Err(GraphError::UnknownNode("missing"))
        );
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut graph = Graph::new();
        graph.add_node("a");

        assert_eq!(
            graph.add_edge(&"a", &"a"),
            Err(GraphError::SelfDependency("a"))
        );
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut graph = Graph::new();
        graph.add_node("a");
        graph.add_node("a");
        graph.add_node("b");
        graph.add_edge(&"a", &"b").unwrap();
        graph.add_edge(&"a", &"b").unwrap();

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.dependencies(&"a").unwrap(), vec![&"b"]);
        assert_eq!(graph.dependents(&"b").unwrap(), vec![&"a"]);
    }
}
