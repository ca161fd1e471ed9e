//! The graph interpreter (§4.5 "Flow Executor"). Walks a validated
//! [`WorkflowGraph`] from its INPUT node, running each node's handler as
//! soon as its incoming edges resolve, until every OUTPUT node has produced
//! a value (or the flow fails/is cancelled).
//!
//! Edge resolution is the one mechanism behind both fan-out and fan-in:
//! when a node finishes, every one of its outgoing edges is marked either
//! *satisfied* (the default — ordinary nodes and PARALLEL fan out to all
//! branches) or *pruned* (CONDITION selects exactly one outgoing edge and
//! prunes the rest). A downstream node becomes ready once all of its
//! incoming edges are resolved one way or the other; if every incoming edge
//! is pruned, the node itself is pruned and its own outgoing edges are
//! pruned in turn. A node with more than one *satisfied* incoming edge is a
//! join: its input is a JSON object keyed by predecessor node id (§9
//! "PARALLEL join semantics").

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::graph::{Edge, GraphError, Node, NodeType, WorkflowGraph};
use super::nodes::{condition, NodeContext, NodeError, NodeRegistry};
use crate::flowloom::event::{Dispatcher, EventEnvelope};
use crate::flowloom::execution::{ExecutionId, ExecutionKind, ExecutionStatus, ExecutionTracker};
use crate::flowloom::tools::{CancellationHandle, CancellationSignal, ToolPipeline};

/// Terminal state of a completed flow (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowStatus::Succeeded => "SUCCEEDED",
            FlowStatus::Failed => "FAILED",
            FlowStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Result of a completed flow run: one output value per OUTPUT node.
#[derive(Debug, Clone)]
pub struct FlowOutcome {
    pub execution_id: ExecutionId,
    pub status: FlowStatus,
    pub outputs: HashMap<String, serde_json::Value>,
    pub error: Option<String>,
}

/// Errors that abort a flow run before or during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    InvalidGraph(GraphError),
    UnknownParent(String),
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowError::InvalidGraph(e) => write!(f, "invalid graph: {e}"),
            FlowError::UnknownParent(id) => write!(f, "unknown parent execution: {id}"),
        }
    }
}

impl std::error::Error for FlowError {}

enum NodeOutcome {
    Cancelled,
    Failed(String),
}

struct NodeResult {
    output: serde_json::Value,
    branch: Option<String>,
}

struct ExecutedNode {
    result: NodeResult,
    execution_id: ExecutionId,
}

/// Executes [`WorkflowGraph`]s against a shared tracker, dispatcher, and
/// node registry (§4.5).
pub struct FlowExecutor {
    tracker: Arc<ExecutionTracker>,
    dispatcher: Option<Arc<Dispatcher>>,
    registry: Arc<NodeRegistry>,
    tool_pipeline: Option<Arc<ToolPipeline>>,
    cancellations: Mutex<HashMap<String, CancellationHandle>>,
}

impl FlowExecutor {
    pub fn new(tracker: Arc<ExecutionTracker>, registry: Arc<NodeRegistry>) -> Self {
        Self {
            tracker,
            dispatcher: None,
            registry,
            tool_pipeline: None,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_tool_pipeline(mut self, tool_pipeline: Arc<ToolPipeline>) -> Self {
        self.tool_pipeline = Some(tool_pipeline);
        self
    }

    /// Runs `graph` to completion against `input`, as a new top-level flow.
    pub async fn execute(&self, graph: &WorkflowGraph, input: serde_json::Value, session_id: Option<String>) -> Result<FlowOutcome, FlowError> {
        self.execute_inner(graph, input, session_id, None).await
    }

    /// Requests cooperative cancellation of a running flow by its
    /// execution id string. No-op if the flow has already finished or is
    /// unknown (§4.5 "Cancellation semantics").
    pub async fn cancel(&self, flow_execution_id: &str) {
        if let Some(handle) = self.cancellations.lock().await.get(flow_execution_id) {
            handle.cancel();
        }
    }

    async fn execute_inner(
        &self,
        graph: &WorkflowGraph,
        input: serde_json::Value,
        session_id: Option<String>,
        parent: Option<&ExecutionId>,
    ) -> Result<FlowOutcome, FlowError> {
        graph.validate().map_err(FlowError::InvalidGraph)?;

        let flow_id = match parent {
            Some(parent) => self
                .tracker
                .start_child(parent, ExecutionKind::Flow, HashMap::new())
                .await
                .map_err(|e| FlowError::UnknownParent(e.to_string()))?,
            None => self.tracker.start_root(ExecutionKind::Flow, HashMap::new()).await,
        };

        let (cancel_handle, cancellation) = CancellationHandle::new();
        self.cancellations.lock().await.insert(flow_id.as_str().to_string(), cancel_handle);

        self.emit(session_id.as_deref(), EventEnvelope::audit_flow_start(&graph.id, flow_id.as_str())).await;
        let start = Instant::now();

        let run = self.run_nodes(graph, input, &flow_id, session_id.as_deref(), &cancellation).await;

        let (status, outputs, error) = match run {
            Ok(outputs) => (FlowStatus::Succeeded, outputs, None),
            Err(NodeOutcome::Cancelled) => (FlowStatus::Cancelled, HashMap::new(), None),
            Err(NodeOutcome::Failed(msg)) => (FlowStatus::Failed, HashMap::new(), Some(msg)),
        };

        match status {
            FlowStatus::Succeeded => {
                self.tracker.succeed(&flow_id, serde_json::json!(&outputs)).await.ok();
            }
            FlowStatus::Failed => {
                self.tracker.fail(&flow_id, error.clone().unwrap_or_default()).await.ok();
            }
            FlowStatus::Cancelled => {
                self.tracker.cancel(&flow_id).await.ok();
            }
        }
        self.emit(session_id.as_deref(), EventEnvelope::audit_flow_end(flow_id.as_str(), status, start.elapsed().as_millis()))
            .await;
        self.cancellations.lock().await.remove(flow_id.as_str());

        Ok(FlowOutcome {
            execution_id: flow_id,
            status,
            outputs,
            error,
        })
    }

    async fn emit(&self, session_id: Option<&str>, envelope: EventEnvelope) {
        let (Some(dispatcher), Some(session_id)) = (&self.dispatcher, session_id) else {
            return;
        };
        if let Some(emitter) = dispatcher.get(session_id).await {
            let _ = emitter.emit(envelope).await;
        }
    }

    /// Drives the wavefront walk described in the module doc comment. Every
    /// node that becomes ready in the same round runs concurrently — this is
    /// what gives a PARALLEL fan-out wall-clock time close to its slowest
    /// branch rather than the sum of all branches (§8 "flow duration ≈ max
    /// of branch durations").
    async fn run_nodes(
        &self,
        graph: &WorkflowGraph,
        input: serde_json::Value,
        flow_id: &ExecutionId,
        session_id: Option<&str>,
        cancellation: &CancellationSignal,
    ) -> Result<HashMap<String, serde_json::Value>, NodeOutcome> {
        let input_node = graph.input_node().expect("validated: exactly one INPUT node");

        let mut outputs: HashMap<String, serde_json::Value> = HashMap::new();
        outputs.insert(input_node.id.clone(), input);

        let mut settled: HashSet<String> = HashSet::new();
        settled.insert(input_node.id.clone());
        let mut pruned: HashSet<String> = HashSet::new();
        let mut edge_satisfied: HashMap<(String, String), bool> = HashMap::new();
        // The execution id each settled node actually ran under, so a node
        // downstream of a PARALLEL branch point can be parented to the
        // PARALLEL node itself rather than to the flow (§9 "PARALLEL join
        // semantics": "the three tool executions are children of the
        // PARALLEL node").
        let mut node_exec_ids: HashMap<String, ExecutionId> = HashMap::new();

        for edge in graph.outgoing_edges(&input_node.id) {
            edge_satisfied.insert((edge.source.clone(), edge.target.clone()), true);
        }

        loop {
            if cancellation.is_cancelled() {
                return Err(NodeOutcome::Cancelled);
            }

            let ready: Vec<&Node> = graph
                .nodes
                .iter()
                .filter(|node| {
                    if settled.contains(&node.id) {
                        return false;
                    }
                    graph
                        .edges
                        .iter()
                        .filter(|e| e.target == node.id)
                        .all(|e| edge_satisfied.contains_key(&(e.source.clone(), e.target.clone())))
                })
                .collect();

            if ready.is_empty() {
                break;
            }

            let mut to_run: Vec<(&Node, Vec<&Edge>)> = Vec::new();
            for node in ready {
                let incoming: Vec<&Edge> = graph.edges.iter().filter(|e| e.target == node.id).collect();
                let satisfied: Vec<&Edge> = incoming
                    .iter()
                    .filter(|e| edge_satisfied[&(e.source.clone(), e.target.clone())])
                    .copied()
                    .collect();

                if satisfied.is_empty() {
                    pruned.insert(node.id.clone());
                    settled.insert(node.id.clone());
                    for out_edge in graph.outgoing_edges(&node.id) {
                        edge_satisfied.insert((out_edge.source.clone(), out_edge.target.clone()), false);
                    }
                    continue;
                }
                to_run.push((node, satisfied));
            }

            let mut futures: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = Result<ExecutedNode, NodeOutcome>> + Send + '_>>> =
                Vec::with_capacity(to_run.len());
            for (node, satisfied) in &to_run {
                let node_input = if satisfied.len() == 1 {
                    outputs.get(&satisfied[0].source).cloned().unwrap_or(serde_json::Value::Null)
                } else {
                    let mut map = serde_json::Map::new();
                    for edge in satisfied {
                        map.insert(edge.source.clone(), outputs.get(&edge.source).cloned().unwrap_or(serde_json::Value::Null));
                    }
                    serde_json::Value::Object(map)
                };
                let parent = satisfied
                    .iter()
                    .find_map(|e| match graph.node(&e.source) {
                        Some(src) if src.node_type == NodeType::Parallel => node_exec_ids.get(&e.source).cloned(),
                        _ => None,
                    })
                    .unwrap_or_else(|| flow_id.clone());
                futures.push(Box::pin(self.execute_node(graph, node, node_input, parent, session_id, cancellation)));
            }

            let results = futures_util::future::join_all(futures).await;

            for ((node, _satisfied), executed) in to_run.into_iter().zip(results.into_iter()) {
                match executed {
                    Ok(ExecutedNode { result, execution_id }) => {
                        settled.insert(node.id.clone());
                        outputs.insert(node.id.clone(), result.output);
                        node_exec_ids.insert(node.id.clone(), execution_id);

                        let out_edges = graph.outgoing_edges(&node.id);
                        if node.node_type == NodeType::Condition {
                            let label = result.branch.unwrap_or_default();
                            match condition::select_edge(&out_edges, &label) {
                                Ok(selected) => {
                                    for edge in &out_edges {
                                        let sat = edge.source == selected.source && edge.target == selected.target;
                                        edge_satisfied.insert((edge.source.clone(), edge.target.clone()), sat);
                                    }
                                }
                                Err(err) => return Err(NodeOutcome::Failed(err.to_string())),
                            }
                        } else {
                            for edge in out_edges {
                                edge_satisfied.insert((edge.source.clone(), edge.target.clone()), true);
                            }
                        }
                    }
                    Err(outcome) => return Err(outcome),
                }
            }
        }

        let final_outputs: HashMap<String, serde_json::Value> = graph
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Output)
            .filter_map(|n| outputs.get(&n.id).cloned().map(|v| (n.id.clone(), v)))
            .collect();
        Ok(final_outputs)
    }

    /// Allocates this node's child execution id under `parent` (the flow, or
    /// the PARALLEL node it branches from), emits AUDIT/node-start and
    /// AUDIT/node-end, and runs the retry loop around the handler dispatch.
    async fn execute_node(
        &self,
        graph: &WorkflowGraph,
        node: &Node,
        input: serde_json::Value,
        parent: ExecutionId,
        session_id: Option<&str>,
        cancellation: &CancellationSignal,
    ) -> Result<ExecutedNode, NodeOutcome> {
        if cancellation.is_cancelled() {
            return Err(NodeOutcome::Cancelled);
        }

        let kind = match node.node_type {
            NodeType::Tool => ExecutionKind::Tool,
            NodeType::Llm => ExecutionKind::Llm,
            NodeType::Parallel => ExecutionKind::Parallel,
            _ => ExecutionKind::Node,
        };
        let node_execution_id = self
            .tracker
            .start_child(&parent, kind, HashMap::new())
            .await
            .map_err(|e| NodeOutcome::Failed(e.to_string()))?;

        self.emit(session_id, EventEnvelope::audit_node_start(&node.id, node_execution_id.as_str())).await;

        let ctx = NodeContext {
            execution_id: node_execution_id.clone(),
            session_id: session_id.map(str::to_string),
            tracker: self.tracker.clone(),
            dispatcher: self.dispatcher.clone(),
            cancellation: cancellation.clone(),
            tool_pipeline: self.tool_pipeline.clone(),
        };

        let result = self.execute_with_retry(graph, node, input, &ctx).await;

        match &result {
            Ok(_) => {
                self.tracker.succeed(&node_execution_id, serde_json::Value::Null).await.ok();
                self.emit(session_id, EventEnvelope::audit_node_end(&node.id, node_execution_id.as_str(), ExecutionStatus::Succeeded))
                    .await;
            }
            Err(NodeOutcome::Cancelled) => {
                self.tracker.cancel(&node_execution_id).await.ok();
                self.emit(session_id, EventEnvelope::audit_node_end(&node.id, node_execution_id.as_str(), ExecutionStatus::Cancelled))
                    .await;
            }
            Err(NodeOutcome::Failed(msg)) => {
                self.tracker.fail(&node_execution_id, msg.clone()).await.ok();
                self.emit(session_id, EventEnvelope::audit_node_end(&node.id, node_execution_id.as_str(), ExecutionStatus::Failed))
                    .await;
            }
        }
        result.map(|result| ExecutedNode { result, execution_id: node_execution_id })
    }

    /// Retries a handler dispatch per [`super::graph::RetryPolicy`]; a
    /// cancellation short-circuits immediately regardless of attempts left.
    async fn execute_with_retry(&self, graph: &WorkflowGraph, node: &Node, input: serde_json::Value, ctx: &NodeContext) -> Result<NodeResult, NodeOutcome> {
        let attempts = node.retry.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            if ctx.cancellation.is_cancelled() {
                return Err(NodeOutcome::Cancelled);
            }
            match self.dispatch(graph, node, input.clone(), ctx).await {
                Ok(result) => return Ok(result),
                Err(NodeError::Cancelled) => return Err(NodeOutcome::Cancelled),
                Err(err) => {
                    last_error = Some(err);
                    if attempt < attempts {
                        let delay = node.retry.backoff.delay_for(attempt);
                        if delay > Duration::ZERO {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
        Err(NodeOutcome::Failed(last_error.map(|e| e.to_string()).unwrap_or_default()))
    }

    /// Resolves `node`'s type to a handler and runs it, bounded by the
    /// node's own timeout if set. CONDITION/PARALLEL/LOOP/SUBFLOW are
    /// control-flow types interpreted here directly rather than through
    /// the [`NodeRegistry`] (§4.5 "Node-handler interface").
    async fn dispatch(&self, graph: &WorkflowGraph, node: &Node, input: serde_json::Value, ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let body = async {
            match &node.node_type {
                NodeType::Condition => {
                    let label = condition::evaluate_label(&node.config, &input)?;
                    Ok(NodeResult { output: input, branch: Some(label) })
                }
                NodeType::Parallel => Ok(NodeResult { output: input, branch: None }),
                NodeType::Loop => self.run_loop(node, input, ctx).await,
                NodeType::Subflow => self.run_subflow(node, input, ctx).await,
                other => {
                    let handler = self
                        .registry
                        .get(other)
                        .ok_or_else(|| NodeError::InvalidConfig(format!("no handler registered for node type {other}")))?;
                    let output = handler.execute(&node.config, input, ctx).await?;
                    Ok(NodeResult { output, branch: None })
                }
            }
        };

        match node.timeout {
            Some(timeout) => tokio::time::timeout(timeout, body).await.map_err(|_| NodeError::Timeout)?,
            None => body.await,
        }
        .map(|result| {
            let _ = graph;
            result
        })
    }

    /// Bounded map over `config.over` (an array, or `input` if `config.over`
    /// is absent and `input` is itself an array): applies `config.body`
    /// (`{"type": "<NODE TYPE>", "config": {...}}`) to every element via the
    /// node registry, collecting results as `{"results": [...]}`. Each
    /// iteration is its own child execution under the LOOP node (§3 "a LOOP
    /// node iterates over a collection... each iteration is a child
    /// execution").
    async fn run_loop(&self, node: &Node, input: serde_json::Value, ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let items = match node.config.get("over") {
            Some(v) => v.as_array().cloned().ok_or_else(|| NodeError::InvalidConfig("LOOP \"over\" must be an array".to_string()))?,
            None => input
                .as_array()
                .cloned()
                .ok_or_else(|| NodeError::InvalidConfig("LOOP needs \"over\" or an array input".to_string()))?,
        };
        let body = node.config.get("body").ok_or_else(|| NodeError::InvalidConfig("LOOP config missing \"body\"".to_string()))?;
        let body_type: NodeType = body
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::InvalidConfig("LOOP body missing \"type\"".to_string()))?
            .parse()
            .map_err(|e: GraphError| NodeError::InvalidConfig(e.to_string()))?;
        let body_config = body.get("config").cloned().unwrap_or(serde_json::Value::Null);
        let handler = self
            .registry
            .get(&body_type)
            .ok_or_else(|| NodeError::InvalidConfig(format!("no handler registered for LOOP body type {body_type}")))?;
        let iteration_kind = match body_type {
            NodeType::Tool => ExecutionKind::Tool,
            NodeType::Llm => ExecutionKind::Llm,
            _ => ExecutionKind::Node,
        };

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            if ctx.cancellation.is_cancelled() {
                return Err(NodeError::Cancelled);
            }
            let iteration_id = self
                .tracker
                .start_child(&ctx.execution_id, iteration_kind, HashMap::new())
                .await
                .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;
            let iteration_ctx = NodeContext {
                execution_id: iteration_id.clone(),
                session_id: ctx.session_id.clone(),
                tracker: ctx.tracker.clone(),
                dispatcher: ctx.dispatcher.clone(),
                cancellation: ctx.cancellation.clone(),
                tool_pipeline: ctx.tool_pipeline.clone(),
            };
            match handler.execute(&body_config, item, &iteration_ctx).await {
                Ok(output) => {
                    self.tracker.succeed(&iteration_id, output.clone()).await.ok();
                    results.push(output);
                }
                Err(err) => {
                    self.tracker.fail(&iteration_id, err.to_string()).await.ok();
                    return Err(err);
                }
            }
        }
        Ok(NodeResult {
            output: serde_json::json!({ "results": results }),
            branch: None,
        })
    }

    /// Runs `config.graph` (an inline, nested [`WorkflowGraph`]) as a child
    /// flow, rejecting cyclic subflow graphs (§3 "when used as a reusable
    /// subflow, the graph is acyclic"). A single-OUTPUT nested graph's value
    /// is unwrapped directly; a multi-OUTPUT graph is passed through as the
    /// `{nodeId: value}` map.
    async fn run_subflow(&self, node: &Node, input: serde_json::Value, ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let graph_value = node.config.get("graph").ok_or_else(|| NodeError::InvalidConfig("SUBFLOW config missing \"graph\"".to_string()))?;
        let nested: WorkflowGraph = serde_json::from_value(graph_value.clone()).map_err(|e| NodeError::InvalidConfig(e.to_string()))?;
        if !nested.is_acyclic() {
            return Err(NodeError::InvalidConfig("SUBFLOW graph must be acyclic".to_string()));
        }

        let outcome = self
            .execute_inner(&nested, input, ctx.session_id.clone(), Some(&ctx.execution_id))
            .await
            .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;

        if outcome.status != FlowStatus::Succeeded {
            return Err(NodeError::ExecutionFailed(outcome.error.unwrap_or_else(|| format!("subflow {}", outcome.status))));
        }

        let output = if outcome.outputs.len() == 1 {
            outcome.outputs.into_values().next().expect("checked len == 1")
        } else {
            serde_json::json!(outcome.outputs)
        };
        Ok(NodeResult { output, branch: None })
    }
}
