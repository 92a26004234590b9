//! The generic graph substrate shared by the asset graph and the request
//! graph.
//!
//! Nodes are addressed by a deterministic [`NodeId`] derived from their
//! semantic content, never by insertion order. This is what allows the same
//! logical unit of work to land on the same node across incremental rebuilds.
//!
//! ## Invariants
//!
//! * Every non-root node that was ever connected keeps at least one incoming
//!   edge. Removing the last incoming edge of a node prunes it, together with
//!   any of its descendants that become orphaned as a result.
//! * Operations on ids that are not in the graph are programmer errors and
//!   panic.
//!
//! ## Incremental updates
//!
//! [`Graph::replace_nodes_connected_to`] is the central primitive. It diffs
//! the current children of a node against a new set and only touches the
//! difference, so rebuilding after a small change costs work proportional to
//! the change rather than to the size of the subtree.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::ArcStr;

/// Content-derived node identifier.
pub type NodeId = ArcStr;

/// A graph node: a deterministic id and a payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node<T> {
    pub id: NodeId,
    pub value: T,
}

impl<T> Node<T> {
    pub fn new(id: impl Into<NodeId>, value: T) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// Controls passed to a traversal visitor.
#[derive(Debug, Default)]
pub struct TraversalActions {
    skipped: bool,
    stopped: bool,
}

impl TraversalActions {
    /// Do not descend into the children of the node being visited.
    pub fn skip_children(&mut self) {
        self.skipped = true;
    }

    /// Halt the whole traversal after the current node.
    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

/// The outcome of [`Graph::replace_nodes_connected_to`].
#[derive(Debug)]
pub struct Delta<T> {
    /// Every node that was upserted, with the value it replaced, if any.
    pub added: Vec<(NodeId, Option<T>)>,
    /// Nodes pruned because they lost their last incoming edge.
    pub removed: Vec<Node<T>>,
}

impl<T> Default for Delta<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// Directed graph of [`Node<T>`] with edges labelled by `E`.
#[derive(Clone, Debug)]
pub struct Graph<T, E = ()> {
    inner: StableDiGraph<Node<T>, E>,
    index: HashMap<NodeId, NodeIndex>,
    root: Option<NodeIndex>,
}

impl<T, E> Default for Graph<T, E> {
    fn default() -> Self {
        Self {
            inner: StableDiGraph::default(),
            index: HashMap::new(),
            root: None,
        }
    }
}

impl<T, E> Graph<T, E>
where
    E: PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_root_node(&mut self, node: Node<T>) {
        let id = node.id.clone();
        self.add_node(node);
        self.root = Some(self.index_of(&id));
    }

    pub fn root_node(&self) -> Option<&Node<T>> {
        self.root.map(|index| &self.inner[index])
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node<T>> {
        self.inner.node_weights()
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get_node(&self, id: &str) -> Option<&Node<T>> {
        self.index.get(id).map(|&index| &self.inner[index])
    }

    pub fn get_node_mut(&mut self, id: &str) -> Option<&mut Node<T>> {
        self.index.get(id).map(|&index| &mut self.inner[index])
    }

    /// Inserts a node, or replaces the value of the node with the same id
    /// while keeping its edges. Returns the replaced value.
    pub fn add_node(&mut self, node: Node<T>) -> Option<T> {
        match self.index.get(&node.id) {
            Some(&index) => Some(std::mem::replace(&mut self.inner[index].value, node.value)),
            None => {
                let id = node.id.clone();
                let index = self.inner.add_node(node);
                self.index.insert(id, index);
                None
            }
        }
    }

    /// Removes a node and its edges, then prunes every descendant left
    /// without incoming edges. Returns all removed nodes, the requested one
    /// first.
    pub fn remove_node(&mut self, id: &str) -> Vec<Node<T>> {
        let index = self.index_of(id);
        let children = self.neighbors(index, Direction::Outgoing, None);

        let mut removed = Vec::new();
        if let Some(node) = self.inner.remove_node(index) {
            self.index.remove(&node.id);
            removed.push(node);
        }

        if self.root == Some(index) {
            self.root = None;
        }

        for child in children {
            self.prune_if_orphaned(child, &mut removed);
        }

        removed
    }

    /// Adds an edge unless an identical one already exists. Returns whether
    /// an edge was added.
    pub fn add_edge(&mut self, from: &str, to: &str, kind: E) -> bool {
        let a = self.index_of(from);
        let b = self.index_of(to);
        self.add_edge_between(a, b, kind)
    }

    pub fn has_edge(&self, from: &str, to: &str, kind: &E) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => self.inner.edges_connecting(a, b).any(|e| e.weight() == kind),
            _ => false,
        }
    }

    /// Removes an existing edge and prunes the target if it was its last
    /// incoming edge. Returns the pruned nodes.
    pub fn remove_edge(&mut self, from: &str, to: &str, kind: &E) -> Vec<Node<T>> {
        let a = self.index_of(from);
        let b = self.index_of(to);

        let mut removed = Vec::new();
        if !self.remove_edge_between(a, b, kind) {
            panic!("edge {from} -> {to} does not exist");
        }
        self.prune_if_orphaned(b, &mut removed);
        removed
    }

    /// Parents of a node, over edges of any kind, in edge insertion order.
    pub fn get_nodes_connected_to(&self, id: &str) -> Vec<&Node<T>> {
        self.connected(id, Direction::Incoming, None)
    }

    /// Parents of a node over edges of the given kind.
    pub fn get_nodes_connected_to_by(&self, id: &str, kind: &E) -> Vec<&Node<T>> {
        self.connected(id, Direction::Incoming, Some(kind))
    }

    /// Children of a node, over edges of any kind, in edge insertion order.
    pub fn get_nodes_connected_from(&self, id: &str) -> Vec<&Node<T>> {
        self.connected(id, Direction::Outgoing, None)
    }

    /// Children of a node over edges of the given kind.
    pub fn get_nodes_connected_from_by(&self, id: &str, kind: &E) -> Vec<&Node<T>> {
        self.connected(id, Direction::Outgoing, Some(kind))
    }

    /// Makes the children of `from` over `kind` edges exactly `to`.
    ///
    /// Nodes in `to` are upserted and connected. Children that are no longer
    /// wanted lose their edge and are pruned if that was their last incoming
    /// edge. Children present both before and after keep their edge as is.
    pub fn replace_nodes_connected_to(&mut self, from: &str, to: Vec<Node<T>>, kind: E) -> Delta<T>
    where
        E: Clone,
    {
        let from_index = self.index_of(from);
        let mut stale = self.neighbors(from_index, Direction::Outgoing, Some(&kind));
        let mut delta = Delta::default();

        for node in to {
            let id = node.id.clone();
            let previous = self.add_node(node);
            let to_index = self.index_of(&id);

            stale.retain(|&index| index != to_index);
            self.add_edge_between(from_index, to_index, kind.clone());
            delta.added.push((id, previous));
        }

        for index in stale {
            self.remove_edge_between(from_index, index, &kind);
            self.prune_if_orphaned(index, &mut delta.removed);
        }

        delta
    }

    /// Depth-first preorder traversal from `start` (or the root), visiting
    /// children in edge insertion order. Every node is visited at most once,
    /// so cycles are safe.
    pub fn traverse<'a, F>(&'a self, start: Option<&str>, mut visit: F)
    where
        F: FnMut(&'a Node<T>, Option<&'a Node<T>>, &mut TraversalActions),
    {
        let start = match start {
            Some(id) => self.index_of(id),
            None => match self.root {
                Some(root) => root,
                None => return,
            },
        };

        let mut visited = HashSet::new();
        let mut stack = vec![(start, None::<NodeIndex>)];

        while let Some((index, parent)) = stack.pop() {
            if !visited.insert(index) {
                continue;
            }

            let mut actions = TraversalActions::default();
            visit(&self.inner[index], parent.map(|p| &self.inner[p]), &mut actions);

            if actions.stopped {
                return;
            }

            if actions.skipped {
                continue;
            }

            let children = self.neighbors(index, Direction::Outgoing, None);
            for child in children.into_iter().rev() {
                if !visited.contains(&child) {
                    stack.push((child, Some(index)));
                }
            }
        }
    }

    /// Walks up from `id` and collects the nearest ancestors matching the
    /// predicate. The search does not continue past a match.
    pub fn find_ancestors<P>(&self, id: &str, predicate: P) -> Vec<&Node<T>>
    where
        P: Fn(&Node<T>) -> bool,
    {
        let start = self.index_of(id);
        let mut found = Vec::new();
        let mut visited = HashSet::from([start]);
        let mut stack: Vec<_> = self.neighbors(start, Direction::Incoming, None);
        stack.reverse();

        while let Some(index) = stack.pop() {
            if !visited.insert(index) {
                continue;
            }

            let node = &self.inner[index];
            if predicate(node) {
                found.push(node);
                continue;
            }

            let mut parents = self.neighbors(index, Direction::Incoming, None);
            parents.reverse();
            stack.extend(parents);
        }

        found
    }

    fn index_of(&self, id: &str) -> NodeIndex {
        match self.index.get(id) {
            Some(&index) => index,
            None => panic!("node {id} does not exist in the graph"),
        }
    }

    fn connected(&self, id: &str, direction: Direction, kind: Option<&E>) -> Vec<&Node<T>> {
        let index = self.index_of(id);
        self.neighbors(index, direction, kind)
            .into_iter()
            .map(|index| &self.inner[index])
            .collect()
    }

    /// Neighbors in edge insertion order, without duplicates.
    fn neighbors(&self, index: NodeIndex, direction: Direction, kind: Option<&E>) -> Vec<NodeIndex> {
        let mut seen = HashSet::new();
        let mut neighbors: Vec<_> = self
            .inner
            .edges_directed(index, direction)
            .filter(|edge| kind.is_none_or(|kind| edge.weight() == kind))
            .map(|edge| match direction {
                Direction::Outgoing => edge.target(),
                Direction::Incoming => edge.source(),
            })
            .collect();

        // petgraph yields the most recently added edge first
        neighbors.reverse();
        neighbors.retain(|index| seen.insert(*index));
        neighbors
    }

    fn add_edge_between(&mut self, a: NodeIndex, b: NodeIndex, kind: E) -> bool {
        if self.inner.edges_connecting(a, b).any(|e| *e.weight() == kind) {
            return false;
        }

        self.inner.add_edge(a, b, kind);
        true
    }

    fn remove_edge_between(&mut self, a: NodeIndex, b: NodeIndex, kind: &E) -> bool {
        let edge = self
            .inner
            .edges_connecting(a, b)
            .find(|e| e.weight() == kind)
            .map(|e| e.id());

        match edge {
            Some(edge) => self.inner.remove_edge(edge).is_some(),
            None => false,
        }
    }

    fn prune_if_orphaned(&mut self, start: NodeIndex, removed: &mut Vec<Node<T>>) {
        let mut stack = vec![start];

        while let Some(index) = stack.pop() {
            if Some(index) == self.root || !self.inner.contains_node(index) {
                continue;
            }

            if self
                .inner
                .neighbors_directed(index, Direction::Incoming)
                .next()
                .is_some()
            {
                continue;
            }

            let children: Vec<_> = self
                .inner
                .neighbors_directed(index, Direction::Outgoing)
                .collect();

            if let Some(node) = self.inner.remove_node(index) {
                self.index.remove(&node.id);
                removed.push(node);
            }

            stack.extend(children);
        }
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a, T, E> {
    root: Option<&'a NodeId>,
    nodes: Vec<&'a Node<T>>,
    edges: Vec<(&'a NodeId, &'a NodeId, &'a E)>,
}

#[derive(Deserialize)]
struct Snapshot<T, E> {
    root: Option<NodeId>,
    nodes: Vec<Node<T>>,
    edges: Vec<(NodeId, NodeId, E)>,
}

impl<T, E> Serialize for Graph<T, E>
where
    T: Serialize,
    E: Serialize + PartialEq,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut edges = Vec::with_capacity(self.inner.edge_count());

        // per-node insertion order is what traversal order depends on
        for index in self.inner.node_indices() {
            let mut outgoing: Vec<_> = self
                .inner
                .edges_directed(index, Direction::Outgoing)
                .collect();
            outgoing.reverse();

            for edge in outgoing {
                edges.push((
                    &self.inner[edge.source()].id,
                    &self.inner[edge.target()].id,
                    edge.weight(),
                ));
            }
        }

        SnapshotRef {
            root: self.root.map(|index| &self.inner[index].id),
            nodes: self.inner.node_weights().collect(),
            edges,
        }
        .serialize(serializer)
    }
}

impl<'de, T, E> Deserialize<'de> for Graph<T, E>
where
    T: Deserialize<'de>,
    E: Deserialize<'de> + PartialEq,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let snapshot = Snapshot::<T, E>::deserialize(deserializer)?;
        let mut graph = Graph::new();

        for node in snapshot.nodes {
            graph.add_node(node);
        }

        for (from, to, kind) in snapshot.edges {
            match (graph.index.get(&from), graph.index.get(&to)) {
                (Some(&a), Some(&b)) => {
                    graph.add_edge_between(a, b, kind);
                }
                _ => return Err(D::Error::custom(format!("dangling edge {from} -> {to}"))),
            }
        }

        if let Some(root) = snapshot.root {
            match graph.index.get(&root) {
                Some(&index) => graph.root = Some(index),
                None => return Err(D::Error::custom(format!("missing root {root}"))),
            }
        }

        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node<u32> {
        Node::new(id, 0)
    }

    fn graph_with_root() -> Graph<u32> {
        let mut graph = Graph::new();
        graph.set_root_node(node("root"));
        graph
    }

    fn ids(nodes: Vec<&Node<u32>>) -> Vec<&str> {
        nodes.into_iter().map(|n| n.id.as_ref()).collect()
    }

    fn edge_index(graph: &Graph<u32>, from: &str, to: &str) -> petgraph::stable_graph::EdgeIndex {
        let a = graph.index_of(from);
        let b = graph.index_of(to);
        graph.inner.find_edge(a, b).unwrap()
    }

    #[test]
    fn test_replace_touches_only_the_difference() {
        let mut graph = graph_with_root();
        graph.replace_nodes_connected_to("root", vec![node("a"), node("b"), node("c")], ());
        graph.replace_nodes_connected_to("b", vec![node("b1")], ());

        let edge_b = edge_index(&graph, "root", "b");
        let edge_c = edge_index(&graph, "root", "c");

        let delta = graph.replace_nodes_connected_to("root", vec![node("b"), node("c"), node("d")], ());

        assert_eq!(ids(graph.get_nodes_connected_from("root")), ["b", "c", "d"]);
        assert_eq!(edge_index(&graph, "root", "b"), edge_b);
        assert_eq!(edge_index(&graph, "root", "c"), edge_c);
        assert!(graph.has_node("b1"));
        assert!(!graph.has_node("a"));

        let removed: Vec<_> = delta.removed.iter().map(|n| n.id.as_ref()).collect();
        assert_eq!(removed, ["a"]);

        let added: Vec<_> = delta
            .added
            .iter()
            .map(|(id, previous)| (id.as_ref(), previous.is_some()))
            .collect();
        assert_eq!(added, [("b", true), ("c", true), ("d", false)]);
    }

    #[test]
    fn test_replace_keeps_children_with_other_parents() {
        let mut graph = graph_with_root();
        graph.replace_nodes_connected_to("root", vec![node("a"), node("b")], ());
        graph.replace_nodes_connected_to("b", vec![node("a")], ());

        let delta = graph.replace_nodes_connected_to("root", vec![node("b")], ());

        assert!(delta.removed.is_empty());
        assert!(graph.has_node("a"));
        assert_eq!(ids(graph.get_nodes_connected_to("a")), ["b"]);
    }

    #[test]
    fn test_replace_prunes_orphaned_subtrees() {
        let mut graph = graph_with_root();
        graph.replace_nodes_connected_to("root", vec![node("a")], ());
        graph.replace_nodes_connected_to("a", vec![node("a1"), node("a2")], ());
        graph.replace_nodes_connected_to("a1", vec![node("a11")], ());

        let delta = graph.replace_nodes_connected_to("root", vec![], ());

        assert_eq!(delta.removed.len(), 4);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_replace_is_idempotent() {
        let mut graph = graph_with_root();
        graph.replace_nodes_connected_to("root", vec![node("a"), node("b")], ());
        let edges = graph.edge_count();

        graph.replace_nodes_connected_to("root", vec![node("a"), node("b")], ());

        assert_eq!(graph.edge_count(), edges);
        assert_eq!(ids(graph.get_nodes_connected_from("root")), ["a", "b"]);
    }

    #[test]
    fn test_replace_only_considers_edges_of_kind() {
        let mut graph: Graph<u32, u8> = Graph::new();
        graph.set_root_node(node("root"));
        graph.replace_nodes_connected_to("root", vec![node("a")], 1);
        graph.replace_nodes_connected_to("root", vec![node("b")], 2);

        graph.replace_nodes_connected_to("root", vec![], 1);

        assert!(!graph.has_node("a"));
        assert!(graph.has_node("b"));
    }

    #[test]
    fn test_traverse_handles_cycles() {
        let mut graph = Graph::<u32>::new();
        graph.set_root_node(node("a"));
        graph.add_node(node("b"));
        graph.add_edge("a", "b", ());
        graph.add_edge("b", "a", ());

        let mut visited = vec![];
        graph.traverse(Some("a"), |node, _, _| visited.push(node.id.clone()));

        let visited: Vec<_> = visited.iter().map(|id| id.as_ref()).collect();
        assert_eq!(visited, ["a", "b"]);
    }

    #[test]
    fn test_traverse_preorder_with_parents() {
        let mut graph = graph_with_root();
        graph.replace_nodes_connected_to("root", vec![node("a"), node("b")], ());
        graph.replace_nodes_connected_to("a", vec![node("c")], ());

        let mut visited = vec![];
        graph.traverse(None, |node, parent, _| {
            visited.push((node.id.to_string(), parent.map(|p| p.id.to_string())));
        });

        assert_eq!(
            visited,
            [
                ("root".to_string(), None),
                ("a".to_string(), Some("root".to_string())),
                ("c".to_string(), Some("a".to_string())),
                ("b".to_string(), Some("root".to_string())),
            ]
        );
    }

    #[test]
    fn test_traverse_skip_and_stop() {
        let mut graph = graph_with_root();
        graph.replace_nodes_connected_to("root", vec![node("a"), node("b"), node("c")], ());
        graph.replace_nodes_connected_to("a", vec![node("a1")], ());

        let mut visited = vec![];
        graph.traverse(None, |node, _, actions| {
            visited.push(node.id.to_string());
            if node.id.as_ref() == "a" {
                actions.skip_children();
            }
            if node.id.as_ref() == "b" {
                actions.stop();
            }
        });

        assert_eq!(visited, ["root", "a", "b"]);
    }

    #[test]
    fn test_find_ancestors_stops_at_match() {
        let mut graph = Graph::<u32>::new();
        graph.set_root_node(Node::new("root", 0));
        graph.replace_nodes_connected_to("root", vec![Node::new("dep1", 1), Node::new("dep2", 1)], ());
        graph.replace_nodes_connected_to("dep1", vec![Node::new("mid", 0)], ());
        graph.replace_nodes_connected_to("dep2", vec![Node::new("mid", 0)], ());
        graph.replace_nodes_connected_to("mid", vec![Node::new("leaf", 0)], ());

        let found = graph.find_ancestors("leaf", |n| n.value == 1);

        assert_eq!(ids(found), ["dep1", "dep2"]);
    }

    #[test]
    fn test_remove_node_prunes_descendants() {
        let mut graph = graph_with_root();
        graph.replace_nodes_connected_to("root", vec![node("a"), node("b")], ());
        graph.replace_nodes_connected_to("a", vec![node("shared"), node("own")], ());
        graph.replace_nodes_connected_to("b", vec![node("shared")], ());

        let removed = graph.remove_node("a");

        let removed: Vec<_> = removed.iter().map(|n| n.id.as_ref()).collect();
        assert_eq!(removed, ["a", "own"]);
        assert!(graph.has_node("shared"));
    }

    #[test]
    fn test_add_node_upserts_value() {
        let mut graph = graph_with_root();
        graph.replace_nodes_connected_to("root", vec![node("a")], ());

        let previous = graph.add_node(Node::new("a", 7));

        assert_eq!(previous, Some(0));
        assert_eq!(graph.get_node("a").unwrap().value, 7);
        assert!(graph.has_edge("root", "a", &()));
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn test_unknown_node_is_fatal() {
        let mut graph = graph_with_root();
        graph.remove_node("missing");
    }

    #[test]
    fn test_snapshot_round_trip_keeps_child_order() {
        let mut graph = graph_with_root();
        graph.replace_nodes_connected_to("root", vec![node("z"), node("a"), node("m")], ());
        graph.replace_nodes_connected_to("a", vec![node("z")], ());

        let json = serde_json::to_string(&graph).unwrap();
        let restored: Graph<u32> = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.root_node().unwrap().id.as_ref(), "root");
        assert_eq!(ids(restored.get_nodes_connected_from("root")), ["z", "a", "m"]);
        assert_eq!(ids(restored.get_nodes_connected_to("z")), ["root", "a"]);
    }
}
