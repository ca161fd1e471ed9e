//! The tool-invocation pipeline: runs the interceptor chain around every
//! tool call, allocates the TOOL execution id, and emits `tool/*`
//! envelopes (§4.4).

use std::sync::Arc;

use super::interceptor::{Interceptor, InterceptorContext};
use super::protocol::{CancellationHandle, ToolContext, ToolError, ToolRegistry};
use crate::flowloom::event::{Dispatcher, EventEnvelope};
use crate::flowloom::execution::{ExecutionId, ExecutionKind, ExecutionTracker};

/// Orchestrates interceptors around a tool call (§4.4 "Pipeline
/// algorithm"). Holds no state of its own between invocations — each
/// interceptor owns whatever state it needs (e.g. the caching
/// interceptor's bounded map), per §3's ownership summary.
pub struct ToolPipeline {
    tracker: Arc<ExecutionTracker>,
    dispatcher: Option<Arc<Dispatcher>>,
    registry: Arc<ToolRegistry>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ToolPipeline {
    pub fn new(tracker: Arc<ExecutionTracker>, registry: Arc<ToolRegistry>, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            tracker,
            dispatcher: None,
            registry,
            interceptors: super::interceptor::sorted_ascending(&interceptors),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    async fn emit(&self, session_id: Option<&str>, envelope: EventEnvelope) {
        let (Some(dispatcher), Some(session_id)) = (&self.dispatcher, session_id) else {
            return;
        };
        if let Some(emitter) = dispatcher.get(session_id).await {
            let _ = emitter.emit(envelope).await;
        }
    }

    /// Invokes `tool_name` with `input` under `parent`, running the full
    /// interceptor chain. `session_id`, if given, routes `tool/*`
    /// envelopes to that session's emitter.
    pub async fn invoke(
        &self,
        tool_name: &str,
        input: serde_json::Value,
        parent: &ExecutionId,
        session_id: Option<&str>,
    ) -> Result<serde_json::Value, ToolError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;
        tool.descriptor.schema.validate(&input)?;

        let execution_id = self
            .tracker
            .start_child(parent, ExecutionKind::Tool, std::collections::HashMap::new())
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        self.emit(
            session_id,
            EventEnvelope::tool_start(tool_name, &input, execution_id.as_str(), Some(parent.as_str())),
        )
        .await;

        let mut ctx = InterceptorContext::new(execution_id.clone(), Some(parent.as_str().to_string()), tool_name.to_string(), input.clone());

        if let Err(err) = self.run_before_chain(&mut ctx).await {
            self.tracker.fail(&execution_id, err.to_string()).await.ok();
            self.emit(session_id, EventEnvelope::tool_error(tool_name, err.to_string(), None)).await;
            return Err(err);
        }

        let (cancel_handle, cancellation) = CancellationHandle::new();
        let tool_ctx = ToolContext {
            execution_id: execution_id.clone(),
            cancellation,
        };

        let result = if let Some(cached) = ctx.skip.clone() {
            Ok(cached)
        } else if let Some(timeout) = tool.descriptor.timeout {
            match tokio::time::timeout(timeout, tool.handler.call(ctx.input.clone(), &tool_ctx)).await {
                Ok(inner) => inner,
                Err(_) => {
                    cancel_handle.cancel();
                    Err(ToolError::Timeout)
                }
            }
        } else {
            tool.handler.call(ctx.input.clone(), &tool_ctx).await
        };

        match result {
            Ok(output) => {
                self.run_after_chain(&mut ctx, &output).await;
                self.tracker.succeed(&execution_id, output.clone()).await.ok();
                let cached = ctx.metadata.get("cached").and_then(|v| v.as_bool()).unwrap_or(false);
                self.emit(
                    session_id,
                    EventEnvelope::tool_result(tool_name, &output, ctx.start_time.elapsed().as_millis(), cached),
                )
                .await;
                Ok(output)
            }
            Err(err) => {
                self.run_on_error_chain(&mut ctx, &err).await;
                self.tracker.fail(&execution_id, err.to_string()).await.ok();
                self.emit(session_id, EventEnvelope::tool_error(tool_name, err.to_string(), None)).await;
                Err(err)
            }
        }
    }

    /// Runs `before` ascending. On a failure from an interceptor with
    /// `stop_on_error`, notifies `on_error` for every interceptor that ran
    /// `before` so far (in reverse) and rethrows; otherwise logs and
    /// continues. Stops early (without error) once `ctx.skip` is set.
    async fn run_before_chain(&self, ctx: &mut InterceptorContext) -> Result<(), ToolError> {
        let mut ran = Vec::new();
        for interceptor in &self.interceptors {
            match interceptor.before(ctx).await {
                Ok(()) => {
                    ran.push(interceptor.clone());
                }
                Err(err) => {
                    if interceptor.stop_on_error() {
                        for prior in ran.iter().rev() {
                            prior.on_error(ctx, &err).await;
                        }
                        return Err(err);
                    }
                    log::warn!("interceptor[{}]: before failed (continuing): {err}", interceptor.name());
                }
            }
            if ctx.skip.is_some() {
                break;
            }
        }
        Ok(())
    }

    /// Runs `after` descending (reverse of `before` order) on every
    /// interceptor — including those that merely observed a cache hit via
    /// `ctx.skip`, so metrics records the hit (§4.4 "Edge cases").
    async fn run_after_chain(&self, ctx: &mut InterceptorContext, result: &serde_json::Value) {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.after(ctx, result).await;
        }
    }

    async fn run_on_error_chain(&self, ctx: &mut InterceptorContext, err: &ToolError) {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.on_error(ctx, err).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowloom::tools::interceptor::{CachingInterceptor, GuardrailsInterceptor, LoggingInterceptor, MetricsInterceptor};
    use crate::flowloom::tools::protocol::{Tool, ToolDescriptor, ToolHandler, ToolSchema};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn echo_registry(call_count: Arc<AtomicUsize>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        let handler: Arc<dyn ToolHandler> = Arc::new(move |input: serde_json::Value, _ctx: &ToolContext| {
            let call_count = call_count.clone();
            async move {
                call_count.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        });
        registry.register(Tool::new(
            ToolDescriptor::new("echo", "echoes input", ToolSchema::default()),
            handler,
        ));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn successful_invocation_emits_start_and_result_once_each() {
        let tracker = Arc::new(ExecutionTracker::new(Duration::from_secs(3600)));
        let dispatcher = Arc::new(Dispatcher::new(64, Duration::from_secs(1800)));
        let (_emitter, mut rx) = dispatcher.register("s1").await.unwrap();
        let call_count = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(call_count);
        let pipeline = ToolPipeline::new(tracker.clone(), registry, vec![Arc::new(LoggingInterceptor)]).with_dispatcher(dispatcher);

        let root = tracker.start_root(ExecutionKind::Flow, Default::default()).await;
        let result = pipeline
            .invoke("echo", serde_json::json!({"s": "hi"}), &root, Some("s1"))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"s": "hi"}));

        let start = rx.recv().await.unwrap();
        let done = rx.recv().await.unwrap();
        assert_eq!(start.envelope.event_type, "start");
        assert_eq!(done.envelope.event_type, "result");
    }

    #[tokio::test]
    async fn cache_hit_on_second_call_invokes_handler_once() {
        let tracker = Arc::new(ExecutionTracker::new(Duration::from_secs(3600)));
        let call_count = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(call_count.clone());
        let caching = Arc::new(CachingInterceptor::new(16, Duration::from_secs(60)));
        let pipeline = ToolPipeline::new(tracker.clone(), registry, vec![caching]);
        let root = tracker.start_root(ExecutionKind::Flow, Default::default()).await;

        let first = pipeline.invoke("echo", serde_json::json!({"s": "hi"}), &root, None).await.unwrap();
        let second = pipeline.invoke("echo", serde_json::json!({"s": "hi"}), &root, None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn guardrail_denial_prevents_handler_invocation() {
        let tracker = Arc::new(ExecutionTracker::new(Duration::from_secs(3600)));
        let call_count = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(call_count.clone());
        let guardrails = Arc::new(GuardrailsInterceptor::new(vec![GuardrailsInterceptor::deny_literal("DENY")]));
        let pipeline = ToolPipeline::new(tracker.clone(), registry, vec![guardrails]);
        let root = tracker.start_root(ExecutionKind::Flow, Default::default()).await;

        let err = pipeline
            .invoke("echo", serde_json::json!({"text": "please DENY me"}), &root, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::GuardrailViolation(_)));
        assert_eq!(call_count.load(Ordering::SeqCst), 0);

        let snapshot = tracker.snapshot(&root).await.unwrap();
        let tool_record = snapshot.iter().find(|r| r.id.kind() == ExecutionKind::Tool).unwrap();
        assert_eq!(tool_record.status, crate::flowloom::execution::ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn metrics_records_the_cache_hit_via_after() {
        let tracker = Arc::new(ExecutionTracker::new(Duration::from_secs(3600)));
        let call_count = Arc::new(AtomicUsize::new(0));
        let registry = echo_registry(call_count);
        let caching = Arc::new(CachingInterceptor::new(16, Duration::from_secs(60)));
        let metrics = Arc::new(MetricsInterceptor::new());
        let pipeline = ToolPipeline::new(tracker.clone(), registry, vec![caching, metrics.clone()]);
        let root = tracker.start_root(ExecutionKind::Flow, Default::default()).await;
        pipeline.invoke("echo", serde_json::json!({"s": "hi"}), &root, None).await.unwrap();
        pipeline.invoke("echo", serde_json::json!({"s": "hi"}), &root, None).await.unwrap();

        let recordings = metrics.recordings().await;
        assert_eq!(recordings.len(), 2);
        assert!(!recordings[0].cached);
        assert!(recordings[1].cached);
    }
}
