//! TOOL node: invokes a registered tool through the pipeline (§4.4, §4.5).

use std::sync::Arc;

use async_trait::async_trait;

use super::{NodeContext, NodeError, NodeHandler};
use crate::flowloom::tools::ToolPipeline;

/// Config shape: `{"tool": "<name>", "input": <value>}`. If `input` is
/// omitted, the node's own input (its predecessor's output) is forwarded
/// verbatim.
pub struct ToolNodeHandler {
    pipeline: Arc<ToolPipeline>,
}

impl ToolNodeHandler {
    pub fn new(pipeline: Arc<ToolPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl NodeHandler for ToolNodeHandler {
    async fn execute(&self, config: &serde_json::Value, input: serde_json::Value, ctx: &NodeContext) -> Result<serde_json::Value, NodeError> {
        let tool_name = config
            .get("tool")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::InvalidConfig("TOOL config missing \"tool\"".to_string()))?;
        let tool_input = config.get("input").cloned().unwrap_or(input);
        self.pipeline
            .invoke(tool_name, tool_input, &ctx.execution_id, ctx.session_id.as_deref())
            .await
            .map_err(|e| NodeError::ExecutionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowloom::execution::{ExecutionKind, ExecutionTracker};
    use crate::flowloom::tools::protocol::{Tool, ToolContext, ToolDescriptor, ToolHandler, ToolSchema};
    use crate::flowloom::tools::ToolRegistry;
    use std::time::Duration;

    #[tokio::test]
    async fn tool_node_invokes_named_tool() {
        let tracker = Arc::new(ExecutionTracker::new(Duration::from_secs(3600)));
        let mut registry = ToolRegistry::new();
        let handler: Arc<dyn ToolHandler> = Arc::new(|input: serde_json::Value, _ctx: &ToolContext| async move { Ok(input) });
        registry.register(Tool::new(ToolDescriptor::new("echo", "echoes", ToolSchema::default()), handler));
        let pipeline = Arc::new(ToolPipeline::new(tracker.clone(), Arc::new(registry), vec![]));

        let root = tracker.start_root(ExecutionKind::Flow, Default::default()).await;
        let (_h, cancellation) = crate::flowloom::tools::CancellationHandle::new();
        let ctx = NodeContext {
            execution_id: root,
            session_id: None,
            tracker: tracker.clone(),
            dispatcher: None,
            cancellation,
            tool_pipeline: Some(pipeline.clone()),
        };
        let node_handler = ToolNodeHandler::new(pipeline);
        let output = node_handler
            .execute(&serde_json::json!({"tool": "echo", "input": {"s": "hi"}}), serde_json::Value::Null, &ctx)
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"s": "hi"}));
    }
}
