//! LLM node: runs a pluggable completion client through the same tool-call
//! loop shape as `planner.rs`'s `BasicPlanner` — parse a `{"tool_call": ...}`
//! marker out of the model's response, invoke it through the tool pipeline,
//! feed the result back in, repeat until the model stops requesting tools or
//! the iteration cap is hit — emitting its own CHAT/delta and CHAT/message
//! envelopes per round, per §4.5's "a handler may emit its own envelopes".

use std::sync::Arc;

use async_trait::async_trait;

use super::{NodeContext, NodeError, NodeHandler};
use crate::flowloom::event::EventEnvelope;
use crate::flowloom::tools::ToolPipeline;

/// A pluggable text-completion backend. Wiring a concrete provider (OpenAI,
/// Anthropic, ...) is the embedding application's job; this crate only
/// needs the request/response shape the tool loop drives.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, NodeError>;
}

/// Echoes the prompt back verbatim and never requests a tool call. Used as
/// the default client so a graph with an LLM node stays runnable without a
/// configured provider; real deployments inject one via
/// [`LlmNodeHandler::with_client`].
pub struct EchoLlmClient;

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, NodeError> {
        Ok(prompt.to_string())
    }
}

/// Config shape: `{"prompt": "<template>", "tools": ["name", ...] }`. The
/// input's top-level fields (if it's an object) are appended to the prompt
/// as a trailing `key: value` context block; `tools`, if present, is
/// informational only today (the pipeline already scopes which tools exist
/// — a future allowlist can filter against it).
pub struct LlmNodeHandler {
    client: Arc<dyn LlmClient>,
    tool_pipeline: Arc<ToolPipeline>,
    max_tool_iterations: usize,
}

impl LlmNodeHandler {
    pub fn new(tool_pipeline: Arc<ToolPipeline>) -> Self {
        Self {
            client: Arc::new(EchoLlmClient),
            tool_pipeline,
            max_tool_iterations: 5,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = client;
        self
    }

    pub fn with_max_tool_iterations(mut self, max_tool_iterations: usize) -> Self {
        self.max_tool_iterations = max_tool_iterations;
        self
    }
}

fn build_prompt(config: &serde_json::Value, input: &serde_json::Value) -> Result<String, NodeError> {
    let template = config
        .get("prompt")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NodeError::InvalidConfig("LLM config missing \"prompt\"".to_string()))?;
    let mut prompt = template.to_string();
    if let serde_json::Value::Object(map) = input {
        if !map.is_empty() {
            prompt.push_str("\n\ncontext:\n");
            for (key, value) in map {
                prompt.push_str(&format!("{key}: {value}\n"));
            }
        }
    }
    Ok(prompt)
}

struct ParsedToolCall {
    name: String,
    parameters: serde_json::Value,
}

/// Extracts the first `{"tool_call": {"name": ..., "parameters": ...}}`
/// marker from a model response, mirroring `planner.rs`'s `parse_tool_call`.
fn parse_tool_call(response: &str) -> Option<ParsedToolCall> {
    let marker = "{\"tool_call\"";
    let start = response.find(marker)?;
    let end = response[start..].rfind('}')?;
    let json: serde_json::Value = serde_json::from_str(&response[start..=start + end]).ok()?;
    let call = json.get("tool_call")?;
    let name = call.get("name")?.as_str()?.trim().to_string();
    if name.is_empty() {
        return None;
    }
    let parameters = call.get("parameters")?.clone();
    Some(ParsedToolCall { name, parameters })
}

async fn emit_chat(ctx: &NodeContext, envelope: EventEnvelope) {
    let (Some(dispatcher), Some(session_id)) = (&ctx.dispatcher, &ctx.session_id) else {
        return;
    };
    if let Some(emitter) = dispatcher.get(session_id).await {
        let _ = emitter.emit(envelope).await;
    }
}

#[async_trait]
impl NodeHandler for LlmNodeHandler {
    async fn execute(&self, config: &serde_json::Value, input: serde_json::Value, ctx: &NodeContext) -> Result<serde_json::Value, NodeError> {
        let mut prompt = build_prompt(config, &input)?;
        let mut iteration = 0;

        loop {
            if ctx.cancellation.is_cancelled() {
                return Err(NodeError::Cancelled);
            }

            let response = self.client.complete(&prompt).await?;
            emit_chat(ctx, EventEnvelope::chat_delta(ctx.execution_id.as_str(), response.clone())).await;

            let Some(call) = parse_tool_call(&response) else {
                emit_chat(ctx, EventEnvelope::chat_message(ctx.execution_id.as_str(), response.clone())).await;
                return Ok(serde_json::json!({ "message": response }));
            };

            if iteration >= self.max_tool_iterations {
                emit_chat(ctx, EventEnvelope::chat_message(ctx.execution_id.as_str(), response.clone())).await;
                return Ok(serde_json::json!({ "message": response, "maxToolIterationsReached": true }));
            }
            iteration += 1;

            let tool_pipeline = &self.tool_pipeline;
            let tool_result = tool_pipeline
                .invoke(&call.name, call.parameters.clone(), &ctx.execution_id, ctx.session_id.as_deref())
                .await;

            let tool_feedback = match tool_result {
                Ok(output) => format!(
                    "tool '{}' executed successfully. result: {}",
                    call.name,
                    serde_json::to_string(&output).unwrap_or_default()
                ),
                Err(err) => format!("tool '{}' failed: {err}", call.name),
            };
            prompt = format!("{prompt}\n\n{tool_feedback}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowloom::execution::{ExecutionKind, ExecutionTracker};
    use crate::flowloom::tools::protocol::{Tool, ToolContext, ToolDescriptor, ToolHandler, ToolSchema};
    use crate::flowloom::tools::ToolRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedClient {
        responses: tokio::sync::Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: tokio::sync::Mutex::new(responses.into_iter().rev().map(str::to_string).collect()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, _prompt: &str) -> Result<String, NodeError> {
            Ok(self.responses.lock().await.pop().expect("scripted response exhausted"))
        }
    }

    async fn ctx(tracker: Arc<ExecutionTracker>, tool_pipeline: Arc<ToolPipeline>) -> NodeContext {
        let root = tracker.start_root(ExecutionKind::Flow, Default::default()).await;
        let (_handle, cancellation) = crate::flowloom::tools::CancellationHandle::new();
        NodeContext {
            execution_id: root,
            session_id: None,
            tracker,
            dispatcher: None,
            cancellation,
            tool_pipeline: Some(tool_pipeline),
        }
    }

    fn empty_pipeline(tracker: Arc<ExecutionTracker>, call_count: Arc<AtomicUsize>) -> Arc<ToolPipeline> {
        let mut registry = ToolRegistry::new();
        let handler: Arc<dyn ToolHandler> = Arc::new(move |input: serde_json::Value, _ctx: &ToolContext| {
            let call_count = call_count.clone();
            async move {
                call_count.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        });
        registry.register(Tool::new(ToolDescriptor::new("echo", "echoes", ToolSchema::default()), handler));
        Arc::new(ToolPipeline::new(tracker, Arc::new(registry), vec![]))
    }

    #[tokio::test]
    async fn no_tool_call_returns_message_immediately() {
        let tracker = Arc::new(ExecutionTracker::new(Duration::from_secs(3600)));
        let pipeline = empty_pipeline(tracker.clone(), Arc::new(AtomicUsize::new(0)));
        let handler = LlmNodeHandler::new(pipeline.clone()).with_client(Arc::new(ScriptedClient::new(vec!["plain answer"])));
        let node_ctx = ctx(tracker, pipeline).await;

        let output = handler
            .execute(&serde_json::json!({"prompt": "hello"}), serde_json::Value::Null, &node_ctx)
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"message": "plain answer"}));
    }

    #[tokio::test]
    async fn tool_call_is_executed_then_final_answer_returned() {
        let tracker = Arc::new(ExecutionTracker::new(Duration::from_secs(3600)));
        let call_count = Arc::new(AtomicUsize::new(0));
        let pipeline = empty_pipeline(tracker.clone(), call_count.clone());
        let first = r#"{"tool_call": {"name": "echo", "parameters": {"s": "hi"}}}"#;
        let handler = LlmNodeHandler::new(pipeline.clone()).with_client(Arc::new(ScriptedClient::new(vec![first, "final answer"])));
        let node_ctx = ctx(tracker, pipeline).await;

        let output = handler
            .execute(&serde_json::json!({"prompt": "hello"}), serde_json::Value::Null, &node_ctx)
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"message": "final answer"}));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_prompt_is_invalid_config() {
        let tracker = Arc::new(ExecutionTracker::new(Duration::from_secs(3600)));
        let pipeline = empty_pipeline(tracker.clone(), Arc::new(AtomicUsize::new(0)));
        let handler = LlmNodeHandler::new(pipeline.clone());
        let node_ctx = ctx(tracker, pipeline).await;
        let err = handler.execute(&serde_json::json!({}), serde_json::Value::Null, &node_ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfig(_)));
    }
}
