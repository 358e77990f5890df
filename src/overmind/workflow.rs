//! Workflow canvas validation and execution-graph construction.
//!
//! A stored canvas ([`WorkflowData`]) is untrusted editor output. Before
//! anything executes, [`build_graph`] validates it into an
//! [`ExecutionGraph`]:
//!
//! - node ids must be unique and edges must reference existing nodes;
//! - edges out of a conditional node must carry `config.branch` of `"true"`
//!   or `"false"`;
//! - the graph must be acyclic — cycles are rejected at load time with a
//!   validation error (the engine schedules topologically and has no notion
//!   of iteration).
//!
//! Construction happens once per execution; the engine never re-parses the
//! canvas at runtime.

use crate::overmind::models::{NodeType, WorkflowData, WorkflowEdge, WorkflowNode};
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;

/// Errors from workflow validation and execution.
#[derive(Debug)]
pub enum WorkflowError {
    /// The canvas (or a node config) is malformed. Never retried.
    Validation(String),
    /// A referenced entity does not exist.
    NotFound(String),
    /// Unexpected failure inside a node or the engine.
    System(String),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::Validation(msg) => write!(f, "workflow validation failed: {}", msg),
            WorkflowError::NotFound(msg) => write!(f, "not found: {}", msg),
            WorkflowError::System(msg) => write!(f, "workflow system error: {}", msg),
        }
    }
}

impl Error for WorkflowError {}

/// Validated, executable shape of a canvas.
pub struct ExecutionGraph {
    pub nodes: HashMap<String, WorkflowNode>,
    /// Out-edges per node, in canvas order.
    pub out_edges: HashMap<String, Vec<WorkflowEdge>>,
    /// Incoming-edge count per node.
    pub in_degree: HashMap<String, usize>,
    /// Nodes with no incoming edges, in canvas order.
    pub start_nodes: Vec<String>,
    /// Nodes with no outgoing edges, in canvas order.
    pub end_nodes: Vec<String>,
}

impl ExecutionGraph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The out-edge a conditional routes to for `branch`, if any. First
    /// matching edge wins; a missing match routes to END.
    pub fn conditional_target<'a>(
        &'a self,
        node_id: &str,
        branch: &str,
    ) -> Option<&'a WorkflowEdge> {
        self.out_edges
            .get(node_id)
            .and_then(|edges| edges.iter().find(|e| e.branch() == Some(branch)))
    }
}

/// Validate a canvas and build its execution graph.
pub fn build_graph(data: &WorkflowData) -> Result<ExecutionGraph, WorkflowError> {
    let mut nodes: HashMap<String, WorkflowNode> = HashMap::new();
    for node in &data.nodes {
        if nodes.insert(node.id.clone(), node.clone()).is_some() {
            return Err(WorkflowError::Validation(format!(
                "duplicate node id {:?}",
                node.id
            )));
        }
    }

    let mut out_edges: HashMap<String, Vec<WorkflowEdge>> = HashMap::new();
    let mut in_degree: HashMap<String, usize> =
        nodes.keys().map(|id| (id.clone(), 0)).collect();

    for edge in &data.edges {
        let source = nodes.get(&edge.from_node_id).ok_or_else(|| {
            WorkflowError::Validation(format!(
                "edge references unknown source node {:?}",
                edge.from_node_id
            ))
        })?;
        if !nodes.contains_key(&edge.to_node_id) {
            return Err(WorkflowError::Validation(format!(
                "edge references unknown target node {:?}",
                edge.to_node_id
            )));
        }
        if source.node_type == NodeType::Conditional {
            match edge.branch() {
                Some("true") | Some("false") => {}
                other => {
                    return Err(WorkflowError::Validation(format!(
                        "conditional edge {} -> {} has invalid branch {:?}",
                        edge.from_node_id, edge.to_node_id, other
                    )))
                }
            }
        }
        *in_degree.entry(edge.to_node_id.clone()).or_insert(0) += 1;
        out_edges
            .entry(edge.from_node_id.clone())
            .or_insert_with(Vec::new)
            .push(edge.clone());
    }

    reject_cycles(&nodes, &out_edges, &in_degree)?;

    let start_nodes: Vec<String> = data
        .nodes
        .iter()
        .filter(|n| in_degree.get(&n.id).copied().unwrap_or(0) == 0)
        .map(|n| n.id.clone())
        .collect();
    let end_nodes: Vec<String> = data
        .nodes
        .iter()
        .filter(|n| out_edges.get(&n.id).map(|e| e.is_empty()).unwrap_or(true))
        .map(|n| n.id.clone())
        .collect();

    Ok(ExecutionGraph {
        nodes,
        out_edges,
        in_degree,
        start_nodes,
        end_nodes,
    })
}

/// Kahn's algorithm: if the peel-off misses any node, a cycle exists.
fn reject_cycles(
    nodes: &HashMap<String, WorkflowNode>,
    out_edges: &HashMap<String, Vec<WorkflowEdge>>,
    in_degree: &HashMap<String, usize>,
) -> Result<(), WorkflowError> {
    let mut degrees = in_degree.clone();
    let mut queue: VecDeque<String> = degrees
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(id) = queue.pop_front() {
        visited.insert(id.clone());
        if let Some(edges) = out_edges.get(&id) {
            for edge in edges {
                let degree = degrees.get_mut(&edge.to_node_id).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(edge.to_node_id.clone());
                }
            }
        }
    }

    if visited.len() != nodes.len() {
        let stuck: Vec<&String> = nodes.keys().filter(|id| !visited.contains(*id)).collect();
        return Err(WorkflowError::Validation(format!(
            "workflow contains a cycle through {:?}",
            stuck
        )));
    }
    Ok(())
}
