//! Workflow graph implementation using petgraph.
//!
//! The graph is derived from a definition's node and connection lists:
//! nodes are `NodeSpec` weights, edges are `Connection` weights. Lookups
//! are by the stable string `NodeId` through an id-to-index map.
//!
//! Connections whose endpoints do not exist, and self-loops, are not
//! representable here; the validator reports them before a graph is built.

use crate::connection::{Connection, Handle};
use crate::error::GraphError;
use crate::node::{NodeId, NodeSpec};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet, VecDeque};

/// A workflow graph over petgraph's directed graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    /// The underlying directed graph.
    graph: DiGraph<NodeSpec, Connection>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<NodeId, NodeIndex>,
}

impl WorkflowGraph {
    /// Builds a graph from node and connection lists.
    ///
    /// Connections referencing unknown nodes and self-loops are silently
    /// dropped; run the validator first if those must be surfaced.
    #[must_use]
    pub fn build(nodes: &[NodeSpec], connections: &[Connection]) -> Self {
        let mut graph = DiGraph::new();
        let mut node_index_map = HashMap::new();

        for node in nodes {
            if node_index_map.contains_key(&node.id) {
                continue;
            }
            let index = graph.add_node(node.clone());
            node_index_map.insert(node.id.clone(), index);
        }

        for connection in connections {
            if connection.is_self_loop() {
                continue;
            }
            let (Some(&source), Some(&target)) = (
                node_index_map.get(&connection.source_node_id),
                node_index_map.get(&connection.target_node_id),
            ) else {
                continue;
            };
            graph.add_edge(source, target, connection.clone());
        }

        Self {
            graph,
            node_index_map,
        }
    }

    /// Returns a reference to a node by its ID.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&NodeSpec> {
        let index = self.node_index_map.get(node_id)?;
        self.graph.node_weight(*index)
    }

    /// Returns all nodes in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.graph.node_weights()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns the outbound connections of a node, optionally filtered by
    /// source handle.
    #[must_use]
    pub fn outbound(&self, node_id: &NodeId, handle: Option<&Handle>) -> Vec<&Connection> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| edge.weight())
            .filter(|conn| handle.is_none_or(|h| &conn.source_handle == h))
            .collect()
    }

    /// Returns the inbound connections of a node.
    #[must_use]
    pub fn inbound(&self, node_id: &NodeId) -> Vec<&Connection> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| edge.weight())
            .collect()
    }

    /// Returns nodes that have no incoming edges (entry points).
    pub fn entry_nodes(&self) -> Vec<&NodeSpec> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, Direction::Incoming).count() == 0)
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Returns nodes that have no outgoing edges (terminal nodes).
    pub fn leaf_nodes(&self) -> Vec<&NodeSpec> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, Direction::Outgoing).count() == 0)
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Computes a topological order via Kahn's algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] when the visited count falls
    /// short of the node count.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph.edges_directed(idx, Direction::Incoming).count(),
                )
            })
            .collect();

        // Seed with zero in-degree nodes, smallest id first for determinism.
        let mut ready: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&idx, _)| idx)
            .collect();
        self.sort_by_node_id(&mut ready);

        let mut order = Vec::with_capacity(self.graph.node_count());
        let mut queue: VecDeque<NodeIndex> = ready.into();

        while let Some(idx) = queue.pop_front() {
            if let Some(node) = self.graph.node_weight(idx) {
                order.push(node.id.clone());
            }

            let mut unlocked = Vec::new();
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                let target = edge.target();
                let degree = in_degree.entry(target).or_insert(0);
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    unlocked.push(target);
                }
            }
            self.sort_by_node_id(&mut unlocked);
            queue.extend(unlocked);
        }

        if order.len() == self.graph.node_count() {
            Ok(order)
        } else {
            Err(GraphError::CycleDetected)
        }
    }

    /// Returns the set of node IDs reachable from the given roots (roots
    /// included), via breadth-first search.
    #[must_use]
    pub fn reachable_from(&self, roots: &[NodeId]) -> HashSet<NodeId> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = roots
            .iter()
            .filter_map(|id| self.node_index_map.get(id).copied())
            .collect();

        while let Some(idx) = queue.pop_front() {
            let Some(node) = self.graph.node_weight(idx) else {
                continue;
            };
            if !visited.insert(node.id.clone()) {
                continue;
            }
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                queue.push_back(edge.target());
            }
        }

        visited
    }

    fn sort_by_node_id(&self, indices: &mut [NodeIndex]) {
        indices.sort_by(|a, b| {
            let a_id = self.graph.node_weight(*a).map(|n| &n.id);
            let b_id = self.graph.node_weight(*b).map(|n| &n.id);
            a_id.cmp(&b_id)
        });
    }
}
