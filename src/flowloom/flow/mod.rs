//! The flow executor (§4.5): a directed workflow graph interpreter that
//! orchestrates node execution, honors conditional/parallel/loop/subflow
//! control flow, and emits AUDIT envelopes as it goes.

pub mod executor;
pub mod graph;
pub mod nodes;

pub use executor::{FlowError, FlowExecutor, FlowOutcome, FlowStatus};
pub use graph::{Backoff, Edge, GraphConfig, GraphError, Node, NodeType, RetryPolicy, WorkflowGraph};
