//! RETRIEVE node: looks up one or more keys from a shared key-value store,
//! built on `tools/builtin/memory.rs`'s TTL-aware `Memory` — the only
//! retrieval-shaped primitive in the tree (put/get/list/delete) — reused
//! here as a first-class node rather than through the tool pipeline, since
//! a RETRIEVE node's job is to seed the graph's state map, not to execute a
//! named tool the model chose.

use std::sync::Arc;

use async_trait::async_trait;

use super::{NodeContext, NodeError, NodeHandler};
use crate::flowloom::tools::builtin::memory::Memory;

/// Config shape: `{"key": "<k>"}` for a single lookup, or
/// `{"keys": ["<k1>", "<k2>", ...]}` for a batch. Missing keys are omitted
/// from the result rather than erroring — callers that require a key to
/// exist should branch on an empty `results` array (e.g. via a CONDITION
/// node downstream).
pub struct RetrieveNodeHandler {
    store: Arc<Memory>,
}

impl RetrieveNodeHandler {
    pub fn new() -> Self {
        Self { store: Arc::new(Memory::new()) }
    }

    pub fn with_store(store: Arc<Memory>) -> Self {
        Self { store }
    }
}

impl Default for RetrieveNodeHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn keys_from_config(config: &serde_json::Value) -> Result<Vec<String>, NodeError> {
    if let Some(key) = config.get("key").and_then(|v| v.as_str()) {
        return Ok(vec![key.to_string()]);
    }
    if let Some(keys) = config.get("keys").and_then(|v| v.as_array()) {
        return keys
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(|| NodeError::InvalidConfig("\"keys\" entries must be strings".to_string())))
            .collect();
    }
    Err(NodeError::InvalidConfig("RETRIEVE config needs \"key\" or \"keys\"".to_string()))
}

#[async_trait]
impl NodeHandler for RetrieveNodeHandler {
    async fn execute(&self, config: &serde_json::Value, _input: serde_json::Value, _ctx: &NodeContext) -> Result<serde_json::Value, NodeError> {
        let keys = keys_from_config(config)?;
        let results: Vec<serde_json::Value> = keys
            .into_iter()
            .filter_map(|key| {
                self.store.get(&key, false).map(|(value, _)| serde_json::json!({ "key": key, "value": value }))
            })
            .collect();
        Ok(serde_json::json!({ "results": results }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowloom::execution::{ExecutionKind, ExecutionTracker};
    use std::time::Duration;

    async fn ctx() -> NodeContext {
        let tracker = Arc::new(ExecutionTracker::new(Duration::from_secs(3600)));
        let root = tracker.start_root(ExecutionKind::Flow, Default::default()).await;
        let (_handle, cancellation) = crate::flowloom::tools::CancellationHandle::new();
        NodeContext {
            execution_id: root,
            session_id: None,
            tracker,
            dispatcher: None,
            cancellation,
            tool_pipeline: None,
        }
    }

    #[tokio::test]
    async fn retrieves_a_previously_stored_key() {
        let store = Arc::new(Memory::new());
        store.put("greeting".to_string(), "hello".to_string(), None);
        let handler = RetrieveNodeHandler::with_store(store);
        let output = handler
            .execute(&serde_json::json!({"key": "greeting"}), serde_json::Value::Null, &ctx().await)
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"results": [{"key": "greeting", "value": "hello"}]}));
    }

    #[tokio::test]
    async fn missing_key_is_omitted_not_errored() {
        let handler = RetrieveNodeHandler::new();
        let output = handler
            .execute(&serde_json::json!({"key": "absent"}), serde_json::Value::Null, &ctx().await)
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"results": []}));
    }

    #[tokio::test]
    async fn missing_config_is_invalid() {
        let handler = RetrieveNodeHandler::new();
        let err = handler.execute(&serde_json::json!({}), serde_json::Value::Null, &ctx().await).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfig(_)));
    }
}
