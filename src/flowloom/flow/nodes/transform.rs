//! TRANSFORM node: evaluates an `evalexpr` expression over the input's
//! top-level fields, grounded on `tools/builtin/calculator.rs`'s use of
//! `evalexpr::HashMapContext` for expression evaluation (§4.5).

use async_trait::async_trait;
use evalexpr::{ContextWithMutableVariables, HashMapContext};

use super::{NodeContext, NodeError, NodeHandler};

/// Config shape: `{"expression": "<evalexpr expression>"}`. Every
/// top-level field of the input (if it is a JSON object) is bound as an
/// evalexpr variable of the same name; a bare scalar input is bound to the
/// variable `value`. The evaluated result is wrapped as `{"out": <value>}`.
pub struct TransformNodeHandler;

fn bind_input(context: &mut HashMapContext, input: &serde_json::Value) -> Result<(), NodeError> {
    match input {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                let bound = json_to_evalexpr(value)?;
                context
                    .set_value(key.clone(), bound)
                    .map_err(|e| NodeError::InvalidConfig(e.to_string()))?;
            }
        }
        other => {
            let bound = json_to_evalexpr(other)?;
            context.set_value("value".to_string(), bound).map_err(|e| NodeError::InvalidConfig(e.to_string()))?;
        }
    }
    Ok(())
}

fn json_to_evalexpr(value: &serde_json::Value) -> Result<evalexpr::Value, NodeError> {
    Ok(match value {
        serde_json::Value::Number(n) => evalexpr::Value::Float(n.as_f64().ok_or_else(|| NodeError::InvalidConfig("non-finite number".to_string()))?),
        serde_json::Value::String(s) => evalexpr::Value::String(s.clone()),
        serde_json::Value::Bool(b) => evalexpr::Value::Boolean(*b),
        serde_json::Value::Null => evalexpr::Value::Empty,
        other => return Err(NodeError::InvalidConfig(format!("unsupported transform input field: {other}"))),
    })
}

fn evalexpr_to_json(value: evalexpr::Value) -> serde_json::Value {
    match value {
        evalexpr::Value::Float(f) => serde_json::json!(f),
        evalexpr::Value::Int(i) => serde_json::json!(i),
        evalexpr::Value::Boolean(b) => serde_json::json!(b),
        evalexpr::Value::String(s) => serde_json::json!(s),
        evalexpr::Value::Empty => serde_json::Value::Null,
        other => serde_json::json!(other.to_string()),
    }
}

#[async_trait]
impl NodeHandler for TransformNodeHandler {
    async fn execute(&self, config: &serde_json::Value, input: serde_json::Value, _ctx: &NodeContext) -> Result<serde_json::Value, NodeError> {
        let expression = config
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::InvalidConfig("TRANSFORM config missing \"expression\"".to_string()))?;
        let mut context = HashMapContext::new();
        bind_input(&mut context, &input)?;
        let result = evalexpr::eval_with_context(expression, &context).map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;
        Ok(serde_json::json!({ "out": evalexpr_to_json(result) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowloom::execution::{ExecutionKind, ExecutionTracker};
    use std::sync::Arc;
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
    async fn multiply_by_two_matches_the_linear_flow_scenario() {
        let handler = TransformNodeHandler;
        let output = handler
            .execute(&serde_json::json!({"expression": "x * 2"}), serde_json::json!({"x": 42}), &ctx().await)
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"out": 84.0}));
    }

    #[tokio::test]
    async fn missing_expression_is_invalid_config() {
        let handler = TransformNodeHandler;
        let err = handler.execute(&serde_json::json!({}), serde_json::json!({"x": 1}), &ctx().await).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfig(_)));
    }
}
