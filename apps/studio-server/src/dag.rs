use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;

use crate::models::{GraphEdge, GraphModel, GraphNode};

#[derive(Error, Debug, PartialEq)]
pub enum TopologyError {
    #[error("Invalid node: {0}")]
    InvalidNode(String),
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),
}

/// Static shape of a graph, as declared by whoever builds it. Live runs may
/// take edges that are only known here as dynamic.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    nodes: BTreeMap<String, String>,
    edges: BTreeMap<String, BTreeSet<String>>,
    dynamic: BTreeSet<String>,
    terminals: BTreeSet<String>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the topology
    pub fn add_node(&mut self, node_id: &str, label: &str) -> Result<(), TopologyError> {
        if self.nodes.contains_key(node_id) {
            return Err(TopologyError::DuplicateNode(node_id.to_string()));
        }
        self.nodes.insert(node_id.to_string(), label.to_string());
        Ok(())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Add an edge from source to target. Cycles are allowed; loops such as
    /// retry or polling steps are ordinary graphs here.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), TopologyError> {
        if !self.contains(from) {
            return Err(TopologyError::InvalidNode(from.to_string()));
        }
        if !self.contains(to) {
            return Err(TopologyError::InvalidNode(to.to_string()));
        }
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        Ok(())
    }

    /// Mark a node whose successor is only chosen at run time.
    pub fn add_dynamic_edge(&mut self, from: &str) -> Result<(), TopologyError> {
        if !self.contains(from) {
            return Err(TopologyError::InvalidNode(from.to_string()));
        }
        self.dynamic.insert(from.to_string());
        Ok(())
    }

    pub fn mark_terminal(&mut self, node_id: &str) -> Result<(), TopologyError> {
        if !self.contains(node_id) {
            return Err(TopologyError::InvalidNode(node_id.to_string()));
        }
        self.terminals.insert(node_id.to_string());
        Ok(())
    }

    /// Get dependents for a given node
    pub fn get_dependents(&self, node_id: &str) -> Vec<String> {
        self.edges
            .get(node_id)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Nodes without inbound static edges
    pub fn entry_nodes(&self) -> Vec<String> {
        let inbound: HashSet<&String> = self.edges.values().flatten().collect();
        self.nodes
            .keys()
            .filter(|id| !inbound.contains(id))
            .cloned()
            .collect()
    }

    /// Export in the wire format served to viewers. Nodes are sorted by id,
    /// each node's static edges by target, its dynamic edge last.
    pub fn to_model(&self) -> GraphModel {
        let nodes = self
            .nodes
            .iter()
            .map(|(id, label)| GraphNode {
                id: id.clone(),
                label: Some(label.clone()),
            })
            .collect();

        let mut edges = Vec::new();
        for id in self.nodes.keys() {
            for target in self.get_dependents(id) {
                edges.push(GraphEdge {
                    source: id.clone(),
                    target: Some(target),
                    dynamic: false,
                });
            }
            if self.dynamic.contains(id) {
                edges.push(GraphEdge {
                    source: id.clone(),
                    target: None,
                    dynamic: true,
                });
            }
        }

        GraphModel {
            nodes,
            edges,
            entry_nodes: self.entry_nodes(),
            terminal_nodes: self.terminals.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Topology {
        let mut topology = Topology::new();
        for id in ["Start", "Tick", "Done"] {
            topology.add_node(id, id).unwrap();
        }
        topology.add_edge("Start", "Tick").unwrap();
        topology.add_edge("Tick", "Tick").unwrap();
        topology.add_edge("Tick", "Done").unwrap();
        topology.mark_terminal("Done").unwrap();
        topology
    }

    #[test]
    fn test_model_sorts_nodes_and_infers_entry_and_terminals() {
        let model = sample().to_model();

        let ids: Vec<_> = model.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["Done", "Start", "Tick"]);
        assert_eq!(model.entry_nodes, vec!["Start"]);
        assert_eq!(model.terminal_nodes, vec!["Done"]);

        let tick_targets: Vec<_> = model
            .edges
            .iter()
            .filter(|e| e.source == "Tick")
            .map(|e| e.target.clone().unwrap())
            .collect();
        assert_eq!(tick_targets, vec!["Done", "Tick"]);
    }

    #[test]
    fn test_dynamic_edge_has_no_target() {
        let mut topology = sample();
        topology.add_dynamic_edge("Start").unwrap();

        let model = topology.to_model();
        let dynamic: Vec<_> = model.edges.iter().filter(|e| e.dynamic).collect();
        assert_eq!(dynamic.len(), 1);
        assert_eq!(dynamic[0].source, "Start");
        assert!(dynamic[0].target.is_none());
        // dynamic edges do not count as inbound
        assert_eq!(model.entry_nodes, vec!["Start"]);
    }

    #[test]
    fn test_invalid_edges_are_rejected() {
        let mut topology = sample();
        assert_eq!(
            topology.add_edge("Start", "Missing"),
            Err(TopologyError::InvalidNode("Missing".to_string()))
        );
        assert_eq!(
            topology.add_node("Tick", "again"),
            Err(TopologyError::DuplicateNode("Tick".to_string()))
        );
        assert!(topology.mark_terminal("Missing").is_err());
    }
}
