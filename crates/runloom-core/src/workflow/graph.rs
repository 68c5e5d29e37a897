//! Runtime index over a DAG.
//!
//! Uses `petgraph` to model nodes and edges as a directed graph so the
//! orchestrator can answer in-degree and successor queries without scanning
//! the edge list. Each graph edge carries its declaration index so outgoing
//! edges are always visited in the order the workflow declares them.
//!
//! Cycles are allowed: `loop_while` bodies commonly point back at their
//! loop node.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use runloom_types::dag::{Dag, EdgeDefinition, NodeDefinition, NodeType};

pub struct DagIndex {
    dag: Dag,
    graph: DiGraph<usize, usize>,
    by_id: HashMap<String, NodeIndex>,
}

impl DagIndex {
    /// Build the index. Edges naming unknown nodes are left out; preflight
    /// rejects such DAGs before a run starts.
    pub fn new(dag: Dag) -> Self {
        let mut graph = DiGraph::<usize, usize>::new();
        let mut by_id = HashMap::new();
        for (position, node) in dag.nodes.iter().enumerate() {
            by_id
                .entry(node.id.clone())
                .or_insert_with(|| graph.add_node(position));
        }
        for (position, edge) in dag.edges.iter().enumerate() {
            if let (Some(&from), Some(&to)) = (by_id.get(&edge.source), by_id.get(&edge.target)) {
                graph.add_edge(from, to, position);
            }
        }
        Self { dag, graph, by_id }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.by_id.get(id).map(|&idx| &self.dag.nodes[self.graph[idx]])
    }

    /// Outgoing edges of `id` in declaration order.
    pub fn outgoing(&self, id: &str) -> Vec<&EdgeDefinition> {
        let Some(&idx) = self.by_id.get(id) else {
            return Vec::new();
        };
        let mut positions: Vec<usize> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|edge| *edge.weight())
            .collect();
        positions.sort_unstable();
        positions.into_iter().map(|p| &self.dag.edges[p]).collect()
    }

    /// Number of distinct source nodes with an edge targeting `id`.
    ///
    /// Parallel edges from one source (a `success` and an `error` edge into
    /// the same join, say) count once, matching how join arrivals are
    /// recorded.
    pub fn in_degree(&self, id: &str) -> usize {
        self.by_id
            .get(id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .collect::<HashSet<_>>()
                    .len()
            })
            .unwrap_or(0)
    }

    /// `(trigger_id, target_id)` for every edge leaving a trigger node, in
    /// declaration order.
    pub fn entry_edges(&self) -> Vec<(&str, &str)> {
        self.dag
            .edges
            .iter()
            .filter(|edge| {
                self.node(&edge.source)
                    .is_some_and(|n| n.node_type() == NodeType::Trigger)
                    && self.contains(&edge.target)
            })
            .map(|edge| (edge.source.as_str(), edge.target.as_str()))
            .collect()
    }
}
