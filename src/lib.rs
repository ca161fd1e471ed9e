// src/lib.rs

//! `flowloom` is a workflow execution core: a graph-based flow executor, an
//! interceptor-chained tool-invocation pipeline, a hierarchical execution
//! tracker, and a streamed event protocol, built to sit underneath an
//! AI-orchestration platform's HTTP/auth/storage layer.
//!
//! # Architecture
//!
//! ```text
//! client ──▶ Session ──▶ FlowExecutor ──▶ node handlers ──▶ ToolPipeline ──▶ ProcessTransport
//!               │              │                                │
//!               ▼              ▼                                ▼
//!            Emitter ◀──── ExecutionTracker ◀──────────── interceptor chain
//! ```
//!
//! See the [`flowloom`] module for the full component breakdown.

pub mod flowloom;

pub use flowloom::config::EngineConfig;
pub use flowloom::event::{Dispatcher, Emitter, EventEnvelope};
pub use flowloom::execution::{ExecutionKind, ExecutionTracker};
pub use flowloom::flow::{FlowExecutor, WorkflowGraph};
pub use flowloom::tools::{ToolPipeline, ToolRegistry};
