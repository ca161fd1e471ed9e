//! Tool descriptors, the handler interface, and the registry (§3, §6.2).
//!
//! `ToolResult`, `ToolParameterType`, `ToolParameter`, and a registry keyed
//! by tool name already match the §6.2 tool-handler interface almost
//! verbatim; this module replaces a multi-protocol `ToolProtocol` trait
//! (one handler implementing several wire protocols at once) with a single
//! `ToolHandler` async closure boundary plus a [`ToolContext`] carrying the
//! execution id and cancellation signal the interceptor pipeline (§4.4)
//! needs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::flowloom::execution::ExecutionId;

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// JSON-Schema-shaped parameter type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ToolParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// One property in a tool's input schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ToolParameterType,
    pub description: Option<String>,
    pub required: bool,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ToolParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Object-shaped JSON Schema for a tool's input (§6.2): a map of
/// property-name to type/constraints plus the `required` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSchema {
    pub properties: Vec<ToolParameter>,
}

impl ToolSchema {
    pub fn new(properties: Vec<ToolParameter>) -> Self {
        Self { properties }
    }

    pub fn required_names(&self) -> Vec<&str> {
        self.properties
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect()
    }

    /// Renders this schema as a JSON-Schema object (`properties` + `required`).
    pub fn to_json_schema(&self) -> serde_json::Value {
        let mut props = serde_json::Map::new();
        for p in &self.properties {
            let type_name = match p.param_type {
                ToolParameterType::String => "string",
                ToolParameterType::Number => "number",
                ToolParameterType::Integer => "integer",
                ToolParameterType::Boolean => "boolean",
                ToolParameterType::Array => "array",
                ToolParameterType::Object => "object",
            };
            let mut entry = serde_json::json!({ "type": type_name });
            if let Some(desc) = &p.description {
                entry["description"] = serde_json::Value::String(desc.clone());
            }
            props.insert(p.name.clone(), entry);
        }
        serde_json::json!({
            "type": "object",
            "properties": serde_json::Value::Object(props),
            "required": self.required_names(),
        })
    }

    /// Validates `input` has every required property present. Does not
    /// check types — a full JSON-Schema validator is out of scope.
    pub fn validate(&self, input: &serde_json::Value) -> Result<(), ToolError> {
        let obj = input
            .as_object()
            .ok_or_else(|| ToolError::InvalidInput("input must be a JSON object".to_string()))?;
        for name in self.required_names() {
            if !obj.contains_key(name) {
                return Err(ToolError::InvalidInput(format!("missing required property: {name}")));
            }
        }
        Ok(())
    }
}

/// A resource a tool optionally exposes (MCP Resources) — an additive
/// capability (`list_resources`/`read_resource`) never required by a
/// handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
}

/// Name, description, input schema, optional per-invocation timeout, and
/// optional resource listing for a registered tool (§3 "Tool descriptor").
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: ToolSchema,
    pub timeout: Option<Duration>,
    pub resources: Vec<ResourceMetadata>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: ToolSchema) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            timeout: None,
            resources: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_resources(mut self, resources: Vec<ResourceMetadata>) -> Self {
        self.resources = resources;
        self
    }
}

/// A cooperative cancellation signal derived from a parent (§5). Handlers
/// are expected to poll [`CancellationSignal::is_cancelled`] at yield
/// points, or `await` [`CancellationSignal::cancelled`] alongside their own
/// I/O.
#[derive(Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

pub struct CancellationHandle {
    tx: watch::Sender<bool>,
}

impl CancellationHandle {
    pub fn new() -> (Self, CancellationSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancellationSignal { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancellationSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is cancelled.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Per-invocation context passed to every [`ToolHandler`] (§6.2).
pub struct ToolContext {
    pub execution_id: ExecutionId,
    pub cancellation: CancellationSignal,
}

/// A tool handler: `(input, ctx) -> output | error` (§6.2). Implemented by
/// in-process Rust closures or a remote-call adapter wrapping
/// [`crate::transport::ProcessTransport`].
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<serde_json::Value, ToolError>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(serde_json::Value, &ToolContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<serde_json::Value, ToolError>> + Send,
{
    async fn call(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<serde_json::Value, ToolError> {
        (self)(input, ctx).await
    }
}

/// Error kinds surfaced by tool execution (§7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    NotFound(String),
    InvalidInput(String),
    ExecutionFailed(String),
    Timeout,
    GuardrailViolation(String),
    CacheError(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {name}"),
            ToolError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            ToolError::ExecutionFailed(msg) => write!(f, "execution failed: {msg}"),
            ToolError::Timeout => write!(f, "tool invocation timed out"),
            ToolError::GuardrailViolation(msg) => write!(f, "guardrail violation: {msg}"),
            ToolError::CacheError(msg) => write!(f, "cache error: {msg}"),
        }
    }
}

impl std::error::Error for ToolError {}

/// A registered tool: descriptor plus handler.
pub struct Tool {
    pub descriptor: ToolDescriptor,
    pub handler: Arc<dyn ToolHandler>,
}

impl Tool {
    pub fn new(descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) -> Self {
        Self { descriptor, handler }
    }
}

/// A flat, name-keyed registry of tools (§3). Routing to in-process vs.
/// remote handlers is a property of the `ToolHandler` implementation, not
/// the registry itself.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Tool) {
        self.tools.insert(tool.descriptor.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn list(&self) -> Vec<&ToolDescriptor> {
        self.tools.values().map(|t| &t.descriptor).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_validates_required_properties() {
        let schema = ToolSchema::new(vec![ToolParameter::new("s", ToolParameterType::String).required()]);
        assert!(schema.validate(&serde_json::json!({"s": "hi"})).is_ok());
        assert!(schema.validate(&serde_json::json!({})).is_err());
    }

    #[test]
    fn schema_json_rendering_includes_required_list() {
        let schema = ToolSchema::new(vec![ToolParameter::new("s", ToolParameterType::String).required()]);
        let json = schema.to_json_schema();
        assert_eq!(json["required"], serde_json::json!(["s"]));
    }

    #[tokio::test]
    async fn registry_round_trips_a_tool() {
        let mut registry = ToolRegistry::new();
        let descriptor = ToolDescriptor::new("echo", "echoes input", ToolSchema::default());
        let handler: Arc<dyn ToolHandler> =
            Arc::new(|input: serde_json::Value, _ctx: &ToolContext| async move { Ok(input) });
        registry.register(Tool::new(descriptor, handler));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_signal_resolves_after_cancel() {
        let (handle, mut signal) = CancellationHandle::new();
        assert!(!signal.is_cancelled());
        handle.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }
}
