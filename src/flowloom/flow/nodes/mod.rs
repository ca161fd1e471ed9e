//! The node-handler interface (§4.5 "Node-handler interface") and the
//! built-in handlers for leaf node types. Control-flow node types
//! (CONDITION edge selection, PARALLEL fan-out, LOOP iteration, SUBFLOW
//! invocation) are handled directly by [`super::executor::FlowExecutor`]
//! since they affect which nodes run next, not just what a single node
//! produces; everything else goes through a [`NodeHandler`] looked up by
//! node type in a [`NodeRegistry`].

pub mod condition;
pub mod llm;
pub mod retrieve;
pub mod tool;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::flowloom::event::Dispatcher;
use crate::flowloom::execution::{ExecutionId, ExecutionTracker};
use crate::flowloom::flow::graph::NodeType;
use crate::flowloom::tools::{CancellationSignal, ToolPipeline};

/// Errors a node handler may raise (§7 "Handler error").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    InvalidConfig(String),
    ExecutionFailed(String),
    Timeout,
    Cancelled,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::InvalidConfig(msg) => write!(f, "invalid node config: {msg}"),
            NodeError::ExecutionFailed(msg) => write!(f, "node execution failed: {msg}"),
            NodeError::Timeout => write!(f, "node execution timed out"),
            NodeError::Cancelled => write!(f, "node execution was cancelled"),
        }
    }
}

impl std::error::Error for NodeError {}

/// Context passed to every node handler (§4.5): the node's own execution
/// id, its tracker, its dispatcher (for handlers that emit their own
/// envelopes, e.g. an LLM handler's CHAT/delta), a cancellation signal, and
/// the tool pipeline for TOOL-shaped nodes.
pub struct NodeContext {
    pub execution_id: ExecutionId,
    pub session_id: Option<String>,
    pub tracker: Arc<ExecutionTracker>,
    pub dispatcher: Option<Arc<Dispatcher>>,
    pub cancellation: CancellationSignal,
    pub tool_pipeline: Option<Arc<ToolPipeline>>,
}

/// A leaf node's execution contract: `(config, input, ctx) -> output`
/// (§4.5).
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, config: &serde_json::Value, input: serde_json::Value, ctx: &NodeContext) -> Result<serde_json::Value, NodeError>;
}

/// Resolves a [`NodeType`] to its [`NodeHandler`] (§4.5). Unknown node
/// types are rejected at load time (§6.4), not at execution time — callers
/// should validate the whole graph's node types against a registry before
/// executing it.
#[derive(Default)]
pub struct NodeRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// Populates the registry with the built-in handlers for INPUT, OUTPUT,
    /// LLM, TOOL, RETRIEVE, and TRANSFORM. CONDITION/PARALLEL/LOOP/SUBFLOW
    /// are not registered here — the executor interprets them directly.
    pub fn with_builtins(tool_pipeline: Arc<ToolPipeline>) -> Self {
        let mut registry = Self::new();
        registry.register(NodeType::Input, Arc::new(PassthroughHandler));
        registry.register(NodeType::Output, Arc::new(PassthroughHandler));
        registry.register(NodeType::Llm, Arc::new(llm::LlmNodeHandler::new(tool_pipeline.clone())));
        registry.register(NodeType::Tool, Arc::new(tool::ToolNodeHandler::new(tool_pipeline)));
        registry.register(NodeType::Retrieve, Arc::new(retrieve::RetrieveNodeHandler::new()));
        registry.register(NodeType::Transform, Arc::new(transform::TransformNodeHandler));
        registry
    }

    pub fn register(&mut self, node_type: NodeType, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type.to_string(), handler);
    }

    pub fn get(&self, node_type: &NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type.to_string()).cloned()
    }

    pub fn contains(&self, node_type: &NodeType) -> bool {
        self.handlers.contains_key(&node_type.to_string())
    }
}

/// INPUT and OUTPUT nodes carry no transformation of their own — INPUT
/// seeds the state map with the caller's input, OUTPUT reads whatever its
/// predecessor produced.
pub struct PassthroughHandler;

#[async_trait]
impl NodeHandler for PassthroughHandler {
    async fn execute(&self, _config: &serde_json::Value, input: serde_json::Value, _ctx: &NodeContext) -> Result<serde_json::Value, NodeError> {
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_handler_returns_input_unchanged() {
        let tracker = Arc::new(ExecutionTracker::new(std::time::Duration::from_secs(3600)));
        let root = tracker.start_root(crate::flowloom::execution::ExecutionKind::Flow, HashMap::new()).await;
        let (_handle, cancellation) = crate::flowloom::tools::CancellationHandle::new();
        let ctx = NodeContext {
            execution_id: root,
            session_id: None,
            tracker: tracker.clone(),
            dispatcher: None,
            cancellation,
            tool_pipeline: None,
        };
        let output = PassthroughHandler
            .execute(&serde_json::Value::Null, serde_json::json!({"x": 1}), &ctx)
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"x": 1}));
    }
}
