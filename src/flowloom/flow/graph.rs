//! The workflow graph data model and its JSON/YAML encoding (§3, §6.4).
//!
//! Plain `serde(derive)` structs throughout, `rename_all` where the wire
//! format wants camelCase, round-trippable through both `serde_json` and
//! `serde_yaml`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The type tag carried by a node (§3). `Custom` carries the suffix after
/// `CUSTOM:` verbatim, so a deployment can register handlers for its own
/// node kinds without a core-crate change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeType {
    Input,
    Output,
    Llm,
    Tool,
    Condition,
    Parallel,
    Loop,
    Retrieve,
    Transform,
    Subflow,
    Custom(String),
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Input => write!(f, "INPUT"),
            NodeType::Output => write!(f, "OUTPUT"),
            NodeType::Llm => write!(f, "LLM"),
            NodeType::Tool => write!(f, "TOOL"),
            NodeType::Condition => write!(f, "CONDITION"),
            NodeType::Parallel => write!(f, "PARALLEL"),
            NodeType::Loop => write!(f, "LOOP"),
            NodeType::Retrieve => write!(f, "RETRIEVE"),
            NodeType::Transform => write!(f, "TRANSFORM"),
            NodeType::Subflow => write!(f, "SUBFLOW"),
            NodeType::Custom(name) => write!(f, "CUSTOM:{name}"),
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "INPUT" => NodeType::Input,
            "OUTPUT" => NodeType::Output,
            "LLM" => NodeType::Llm,
            "TOOL" => NodeType::Tool,
            "CONDITION" => NodeType::Condition,
            "PARALLEL" => NodeType::Parallel,
            "LOOP" => NodeType::Loop,
            "RETRIEVE" => NodeType::Retrieve,
            "TRANSFORM" => NodeType::Transform,
            "SUBFLOW" => NodeType::Subflow,
            other => match other.strip_prefix("CUSTOM:") {
                Some(suffix) if !suffix.is_empty() => NodeType::Custom(suffix.to_string()),
                _ => return Err(GraphError::UnknownNodeType(other.to_string())),
            },
        })
    }
}

impl Serialize for NodeType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Backoff policy for a node's retry configuration (§4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum Backoff {
    None,
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, cap_ms: u64 },
}

impl Backoff {
    /// The delay before retry attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential { base_ms, cap_ms } => {
                let scaled = base_ms.saturating_mul(1u64 << attempt.min(32));
                Duration::from_millis(scaled.min(*cap_ms))
            }
        }
    }
}

/// Per-node retry configuration (§4.5 "Retry policy").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    fn default_attempts() -> u32 {
        1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            backoff: Backoff::None,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::None
    }
}

/// One node in a [`WorkflowGraph`] (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, with = "duration_millis_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType, config: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            node_type,
            config,
            timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

/// A directed edge between two nodes (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
            label: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Graph-level execution configuration (§6.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphConfig {
    #[serde(default, with = "duration_millis_opt")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
}

/// A workflow graph: nodes, edges, and graph-level config (§3, §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<GraphConfig>,
}

/// Errors raised while parsing or validating a [`WorkflowGraph`] (§7
/// "Invalid-input / validation").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    UnknownNodeType(String),
    Parse(String),
    NoInputNode,
    MultipleInputNodes(usize),
    NoOutputNode,
    DeadEnd(String),
    Unreachable(String),
    DuplicateNodeId(String),
    DanglingEdge(String, String),
    Cyclic,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::UnknownNodeType(t) => write!(f, "unknown node type: {t}"),
            GraphError::Parse(msg) => write!(f, "graph parse error: {msg}"),
            GraphError::NoInputNode => write!(f, "graph has no INPUT node"),
            GraphError::MultipleInputNodes(n) => write!(f, "graph has {n} INPUT nodes, expected exactly 1"),
            GraphError::NoOutputNode => write!(f, "graph has no OUTPUT node"),
            GraphError::DeadEnd(id) => write!(f, "non-OUTPUT node {id} has no outgoing edges"),
            GraphError::Unreachable(id) => write!(f, "node {id} is not reachable from INPUT"),
            GraphError::DuplicateNodeId(id) => write!(f, "duplicate node id: {id}"),
            GraphError::DanglingEdge(source, target) => write!(f, "edge {source} -> {target} references an unknown node"),
            GraphError::Cyclic => write!(f, "graph must be acyclic when used as a subflow"),
        }
    }
}

impl std::error::Error for GraphError {}

impl WorkflowGraph {
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        serde_json::from_str(json).map_err(|e| GraphError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, GraphError> {
        serde_json::to_string(self).map_err(|e| GraphError::Parse(e.to_string()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, GraphError> {
        serde_yaml::from_str(yaml).map_err(|e| GraphError::Parse(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String, GraphError> {
        serde_yaml::to_string(self).map_err(|e| GraphError::Parse(e.to_string()))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    pub fn input_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Input)
    }

    /// Validates the structural invariants of §3: unique ids, no dangling
    /// edges, exactly one INPUT, at least one OUTPUT, every non-OUTPUT node
    /// has an outgoing edge, every non-INPUT node is reachable from INPUT.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNodeId(node.id.clone()));
            }
        }
        for edge in &self.edges {
            if self.node(&edge.source).is_none() || self.node(&edge.target).is_none() {
                return Err(GraphError::DanglingEdge(edge.source.clone(), edge.target.clone()));
            }
        }

        let input_count = self.nodes.iter().filter(|n| n.node_type == NodeType::Input).count();
        match input_count {
            0 => return Err(GraphError::NoInputNode),
            1 => {}
            n => return Err(GraphError::MultipleInputNodes(n)),
        }
        if !self.nodes.iter().any(|n| n.node_type == NodeType::Output) {
            return Err(GraphError::NoOutputNode);
        }

        for node in &self.nodes {
            if node.node_type != NodeType::Output && self.outgoing_edges(&node.id).is_empty() {
                return Err(GraphError::DeadEnd(node.id.clone()));
            }
        }

        let input_id = self.input_node().expect("checked above").id.clone();
        let reachable = self.reachable_from(&input_id);
        for node in &self.nodes {
            if node.node_type != NodeType::Input && !reachable.contains(node.id.as_str()) {
                return Err(GraphError::Unreachable(node.id.clone()));
            }
        }
        Ok(())
    }

    fn reachable_from<'a>(&'a self, start: &'a str) -> HashSet<&'a str> {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            for edge in self.outgoing_edges(current) {
                stack.push(edge.target.as_str());
            }
        }
        visited
    }

    /// Whether the graph contains a directed cycle over its edges (§3 "when
    /// used as a reusable subflow, the graph is acyclic"). LOOP nodes
    /// iterate internally and are not graph-level cycles.
    pub fn is_acyclic(&self) -> bool {
        let mut color: HashMap<&str, u8> = HashMap::new();
        for node in &self.nodes {
            if color.get(node.id.as_str()).copied().unwrap_or(0) == 0 && self.has_cycle_from(&node.id, &mut color) {
                return false;
            }
        }
        true
    }

    fn has_cycle_from<'a>(&'a self, node_id: &'a str, color: &mut HashMap<&'a str, u8>) -> bool {
        color.insert(node_id, 1);
        for edge in self.outgoing_edges(node_id) {
            match color.get(edge.target.as_str()).copied().unwrap_or(0) {
                0 => {
                    if self.has_cycle_from(&edge.target, color) {
                        return true;
                    }
                }
                1 => return true,
                _ => {}
            }
        }
        color.insert(node_id, 2);
        false
    }
}
