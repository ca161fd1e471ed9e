//! CONDITION node support (§4.5 "Conditional edges"). A CONDITION node's
//! own config evaluates to a branch label; exactly one outgoing edge whose
//! `condition` equals that label is selected; edges are expected to carry
//! disjoint conditions, with an optional condition-less edge as the
//! default if none match.
//!
//! Unlike the other node types this isn't a [`super::NodeHandler`] — a
//! condition doesn't produce an output value, it picks which edge the
//! executor follows next — so [`super::super::executor::FlowExecutor`]
//! calls [`select_branch`] directly during the graph walk.

use evalexpr::ContextWithMutableVariables;

use super::NodeError;
use crate::flowloom::flow::graph::Edge;

fn bind_input(context: &mut evalexpr::HashMapContext, input: &serde_json::Value) -> Result<(), NodeError> {
    if let serde_json::Value::Object(map) = input {
        for (key, value) in map {
            let bound = match value {
                serde_json::Value::Number(n) => evalexpr::Value::Float(n.as_f64().unwrap_or_default()),
                serde_json::Value::String(s) => evalexpr::Value::String(s.clone()),
                serde_json::Value::Bool(b) => evalexpr::Value::Boolean(*b),
                _ => continue,
            };
            context.set_value(key.clone(), bound).map_err(|e| NodeError::InvalidConfig(e.to_string()))?;
        }
    }
    Ok(())
}

/// Evaluates `config.expression` against `input`'s top-level fields,
/// returning a branch label (the string form of the result, so both a
/// direct `"big"` string result and a boolean result serialize sensibly).
pub fn evaluate_label(config: &serde_json::Value, input: &serde_json::Value) -> Result<String, NodeError> {
    let expression = config
        .get("expression")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NodeError::InvalidConfig("CONDITION config missing \"expression\"".to_string()))?;
    let mut context = evalexpr::HashMapContext::new();
    bind_input(&mut context, input)?;
    let result = evalexpr::eval_with_context(expression, &context).map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;
    Ok(match result {
        evalexpr::Value::String(s) => s,
        evalexpr::Value::Boolean(b) => b.to_string(),
        other => other.to_string(),
    })
}

/// Picks the outgoing edge whose `condition` equals `label`, falling back
/// to the single condition-less edge if present and no exact match exists.
pub fn select_edge<'a>(edges: &[&'a Edge], label: &str) -> Result<&'a Edge, NodeError> {
    if let Some(edge) = edges.iter().find(|e| e.condition.as_deref() == Some(label)) {
        return Ok(edge);
    }
    edges
        .iter()
        .find(|e| e.condition.is_none())
        .copied()
        .ok_or_else(|| NodeError::ExecutionFailed(format!("no outgoing edge matches condition {label:?} and no default edge exists")))
}
