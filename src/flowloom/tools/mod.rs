//! The tool-invocation subsystem: descriptors, the interceptor chain, the
//! cache/fingerprint helpers, concrete built-in tools, and the pipeline
//! that ties them together (§3, §4.4, §6.2).

pub mod adapters;
pub mod builtin;
pub mod cache;
pub mod interceptor;
pub mod pipeline;
pub mod protocol;

pub use interceptor::{CachingInterceptor, GuardrailsInterceptor, Interceptor, InterceptorContext, LoggingInterceptor, MetricsInterceptor};
pub use pipeline::ToolPipeline;
pub use protocol::{
    CancellationHandle, CancellationSignal, ResourceMetadata, Tool, ToolContext, ToolDescriptor, ToolError, ToolHandler, ToolParameter,
    ToolParameterType, ToolRegistry, ToolResult, ToolSchema,
};
