//! Thin [`ToolHandler`] wrappers around the concrete tool implementations
//! in [`super::builtin`] (§6.2 "tool handler interface" — any callable
//! boundary, in-process or remote, can back a registered tool as long as
//! it matches `(input, ctx) -> output | error`).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::builtin::{BashTool, Calculator, FileSystemTool, Memory, Platform};
use super::protocol::{ResourceMetadata, Tool, ToolContext, ToolDescriptor, ToolError, ToolHandler, ToolParameter, ToolParameterType, ToolSchema};

/// Wraps [`Calculator`] as a `calculator` tool: `{"expression": "2 + 2"}` ->
/// `{"result": 4.0}`.
pub struct CalculatorHandler {
    calculator: Calculator,
}

impl CalculatorHandler {
    pub fn new() -> Self {
        Self {
            calculator: Calculator::new(),
        }
    }

    pub fn into_tool(self) -> Tool {
        let schema = ToolSchema::new(vec![ToolParameter::new("expression", ToolParameterType::String)
            .with_description("a mathematical expression, e.g. sqrt(16) + mean([1,2,3])")
            .required()]);
        Tool::new(
            ToolDescriptor::new("calculator", "evaluates arithmetic, trigonometric, and statistical expressions", schema),
            Arc::new(self),
        )
    }
}

impl Default for CalculatorHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for CalculatorHandler {
    async fn call(&self, input: serde_json::Value, _ctx: &ToolContext) -> Result<serde_json::Value, ToolError> {
        let expression = input
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing \"expression\" string".to_string()))?;
        let result = self
            .calculator
            .evaluate(expression)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(serde_json::json!({ "result": result }))
    }
}

/// Wraps [`Memory`] as a `memory` tool: `{"op": "put"|"get"|"delete"|
/// "list"|"clear", "key": ..., "value": ..., "ttlSeconds": ...}`.
pub struct MemoryHandler {
    memory: Arc<Memory>,
}

impl MemoryHandler {
    pub fn new(memory: Arc<Memory>) -> Self {
        Self { memory }
    }

    pub fn into_tool(self) -> Tool {
        let schema = ToolSchema::new(vec![
            ToolParameter::new("op", ToolParameterType::String).required(),
            ToolParameter::new("key", ToolParameterType::String),
            ToolParameter::new("value", ToolParameterType::String),
            ToolParameter::new("ttlSeconds", ToolParameterType::Integer),
        ]);
        Tool::new(
            ToolDescriptor::new("memory", "a persistent, TTL-aware key-value store for cross-call agent state", schema),
            Arc::new(self),
        )
    }
}

#[async_trait]
impl ToolHandler for MemoryHandler {
    async fn call(&self, input: serde_json::Value, _ctx: &ToolContext) -> Result<serde_json::Value, ToolError> {
        let op = input
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing \"op\"".to_string()))?;
        let key = || {
            input
                .get("key")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ToolError::InvalidInput("missing \"key\"".to_string()))
        };
        match op {
            "put" => {
                let value = input
                    .get("value")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::InvalidInput("missing \"value\"".to_string()))?;
                let ttl = input.get("ttlSeconds").and_then(|v| v.as_u64());
                self.memory.put(key()?.to_string(), value.to_string(), ttl);
                Ok(serde_json::json!({ "stored": true }))
            }
            "get" => match self.memory.get(key()?, false) {
                Some((value, _)) => Ok(serde_json::json!({ "value": value, "found": true })),
                None => Ok(serde_json::json!({ "found": false })),
            },
            "delete" => Ok(serde_json::json!({ "deleted": self.memory.delete(key()?) })),
            "list" => Ok(serde_json::json!({ "keys": self.memory.list_keys() })),
            "clear" => {
                self.memory.clear();
                Ok(serde_json::json!({ "cleared": true }))
            }
            other => Err(ToolError::InvalidInput(format!("unknown memory op: {other}"))),
        }
    }
}

/// Wraps [`BashTool`] as a `bash` tool: `{"command": "ls -la"}`.
pub struct BashHandler {
    bash: BashTool,
}

impl BashHandler {
    pub fn new(bash: BashTool) -> Self {
        Self { bash }
    }

    pub fn linux() -> Self {
        Self::new(BashTool::new(Platform::Linux))
    }

    pub fn into_tool(self) -> Tool {
        let schema = ToolSchema::new(vec![ToolParameter::new("command", ToolParameterType::String).required()]);
        Tool::new(
            ToolDescriptor::new("bash", "executes a shell command and captures stdout/stderr/exit code", schema)
                .with_timeout(std::time::Duration::from_secs(self.bash.timeout_secs())),
            Arc::new(self),
        )
    }
}

#[async_trait]
impl ToolHandler for BashHandler {
    async fn call(&self, input: serde_json::Value, _ctx: &ToolContext) -> Result<serde_json::Value, ToolError> {
        let command = input
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing \"command\" string".to_string()))?;
        let result = self.bash.execute(command).await.map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(serde_json::json!({
            "success": result.success,
            "stdout": result.stdout,
            "stderr": result.stderr,
            "exitCode": result.exit_code,
            "durationMs": result.duration_ms,
        }))
    }
}

/// Wraps [`FileSystemTool`] as a `filesystem` tool: `{"op": "read"|"write"|
/// "append"|"delete"|"exists"|"list", "path": ..., "content": ...}`.
pub struct FileSystemHandler {
    fs: FileSystemTool,
}

impl FileSystemHandler {
    pub fn new(fs: FileSystemTool) -> Self {
        Self { fs }
    }

    pub fn rooted_at(root: PathBuf) -> Self {
        Self::new(FileSystemTool::new().with_root_path(root))
    }

    pub fn into_tool(self) -> Tool {
        let schema = ToolSchema::new(vec![
            ToolParameter::new("op", ToolParameterType::String).required(),
            ToolParameter::new("path", ToolParameterType::String).required(),
            ToolParameter::new("content", ToolParameterType::String),
            ToolParameter::new("recursive", ToolParameterType::Boolean),
        ]);
        Tool::new(
            ToolDescriptor::new("filesystem", "reads, writes, and lists files under a sandboxed root", schema).with_resources(vec![ResourceMetadata {
                uri: "file:///".to_string(),
                name: "sandboxed filesystem root".to_string(),
                description: None,
            }]),
            Arc::new(self),
        )
    }
}

#[async_trait]
impl ToolHandler for FileSystemHandler {
    async fn call(&self, input: serde_json::Value, _ctx: &ToolContext) -> Result<serde_json::Value, ToolError> {
        let op = input
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing \"op\"".to_string()))?;
        let path = input
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing \"path\"".to_string()))?;
        let to_tool_error = |e: Box<dyn std::error::Error + Send + Sync>| ToolError::ExecutionFailed(e.to_string());
        match op {
            "read" => {
                let content = self.fs.read_file(path).await.map_err(to_tool_error)?;
                Ok(serde_json::json!({ "content": content }))
            }
            "write" => {
                let content = input.get("content").and_then(|v| v.as_str()).unwrap_or_default();
                self.fs.write_file(path, content).await.map_err(to_tool_error)?;
                Ok(serde_json::json!({ "written": true }))
            }
            "append" => {
                let content = input.get("content").and_then(|v| v.as_str()).unwrap_or_default();
                self.fs.append_file(path, content).await.map_err(to_tool_error)?;
                Ok(serde_json::json!({ "appended": true }))
            }
            "delete" => {
                self.fs.delete_file(path).await.map_err(to_tool_error)?;
                Ok(serde_json::json!({ "deleted": true }))
            }
            "exists" => {
                let exists = self.fs.file_exists(path).await.map_err(to_tool_error)?;
                Ok(serde_json::json!({ "exists": exists }))
            }
            "list" => {
                let recursive = input.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false);
                let entries = self.fs.read_directory(path, recursive).await.map_err(to_tool_error)?;
                let entries: Vec<serde_json::Value> = entries
                    .into_iter()
                    .map(|e| serde_json::json!({ "name": e.name, "isDirectory": e.is_directory, "size": e.size }))
                    .collect();
                Ok(serde_json::json!({ "entries": entries }))
            }
            other => Err(ToolError::InvalidInput(format!("unknown filesystem op: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowloom::tools::protocol::ToolRegistry;

    fn test_ctx() -> ToolContext {
        ToolContext {
            execution_id: crate::flowloom::execution::mint_for_test(crate::flowloom::execution::ExecutionKind::Tool),
            cancellation: crate::flowloom::tools::protocol::CancellationHandle::new().1,
        }
    }

    #[tokio::test]
    async fn calculator_handler_evaluates_expression() {
        let handler = CalculatorHandler::new();
        let out = handler.call(serde_json::json!({"expression": "2 + 2"}), &test_ctx()).await.unwrap();
        assert_eq!(out["result"], serde_json::json!(4.0));
    }

    #[tokio::test]
    async fn memory_handler_put_then_get_round_trips() {
        let handler = MemoryHandler::new(Arc::new(Memory::new()));
        handler
            .call(serde_json::json!({"op": "put", "key": "k", "value": "v"}), &test_ctx())
            .await
            .unwrap();
        let out = handler.call(serde_json::json!({"op": "get", "key": "k"}), &test_ctx()).await.unwrap();
        assert_eq!(out["value"], serde_json::json!("v"));
    }

    #[tokio::test]
    async fn calculator_tool_registers_and_resolves_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(CalculatorHandler::new().into_tool());
        assert!(registry.get("calculator").is_some());
    }
}
