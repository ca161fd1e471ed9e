//! The ordered Before/After/OnError interceptor chain and its built-ins
//! (§4.4).
//!
//! Errors propagate as explicit `Result<_, ToolError>` returns per §9
//! "Cooperative exceptions across async boundaries," wrapping whatever a
//! handler's own `Box<dyn Error + Send + Sync>` reports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::cache::{fingerprint, ToolCache};
use super::protocol::ToolError;
use crate::flowloom::execution::ExecutionId;

/// Per-invocation scratch state interceptors mutate cooperatively (§3
/// "Interceptor-chain context").
pub struct InterceptorContext {
    pub execution_id: ExecutionId,
    pub parent_id: Option<String>,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub start_time: Instant,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Set by a `Before` hook to bypass the tool with a cached value.
    pub skip: Option<serde_json::Value>,
    /// Set by a `Before` hook to request that `After` persist the result.
    pub cache_on_success: bool,
}

impl InterceptorContext {
    pub fn new(execution_id: ExecutionId, parent_id: Option<String>, tool_name: String, input: serde_json::Value) -> Self {
        Self {
            execution_id,
            parent_id,
            tool_name,
            input,
            start_time: Instant::now(),
            metadata: HashMap::new(),
            skip: None,
            cache_on_success: false,
        }
    }
}

/// One stage in the interceptor chain (§4.4).
///
/// `order` determines execution sequence (ascending for `before`,
/// descending for `after`/`on_error`); `stop_on_error` determines whether a
/// `before` failure aborts the chain (rethrown) or is logged and skipped.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;
    fn order(&self) -> i64;
    fn stop_on_error(&self) -> bool {
        false
    }

    async fn before(&self, _ctx: &mut InterceptorContext) -> Result<(), ToolError> {
        Ok(())
    }

    /// Called only on successful tool execution.
    async fn after(&self, _ctx: &mut InterceptorContext, _result: &serde_json::Value) {}

    /// Called when the tool raised. May not change the error — it is
    /// rethrown by the pipeline regardless of what this hook does.
    async fn on_error(&self, _ctx: &mut InterceptorContext, _err: &ToolError) {}
}

/// Logs Before/After/OnError at order `i64::MIN` (runs first, per §4.4
/// item 1).
pub struct LoggingInterceptor;

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    fn order(&self) -> i64 {
        i64::MIN
    }

    async fn before(&self, ctx: &mut InterceptorContext) -> Result<(), ToolError> {
        log::debug!(
            "tool[{}]: invoking {} (parent={:?})",
            ctx.execution_id,
            ctx.tool_name,
            ctx.parent_id
        );
        Ok(())
    }

    async fn after(&self, ctx: &mut InterceptorContext, _result: &serde_json::Value) {
        log::info!(
            "tool[{}]: {} succeeded in {:?}",
            ctx.execution_id,
            ctx.tool_name,
            ctx.start_time.elapsed()
        );
    }

    async fn on_error(&self, ctx: &mut InterceptorContext, err: &ToolError) {
        log::warn!(
            "tool[{}]: {} failed after {:?}: {err}",
            ctx.execution_id,
            ctx.tool_name,
            ctx.start_time.elapsed()
        );
    }
}

/// Bounded TTL cache keyed by `(toolName, inputFingerprint)` at order 10
/// (§4.4 item 2).
pub struct CachingInterceptor {
    cache: Mutex<ToolCache>,
}

impl CachingInterceptor {
    pub fn new(capacity: usize, ttl: std::time::Duration) -> Self {
        Self {
            cache: Mutex::new(ToolCache::new(capacity, ttl)),
        }
    }
}

#[async_trait]
impl Interceptor for CachingInterceptor {
    fn name(&self) -> &str {
        "caching"
    }

    fn order(&self) -> i64 {
        10
    }

    async fn before(&self, ctx: &mut InterceptorContext) -> Result<(), ToolError> {
        let key = fingerprint(&ctx.tool_name, &ctx.input);
        ctx.metadata.insert("cacheKey".to_string(), serde_json::json!(key.clone()));
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&key) {
            ctx.skip = Some(cached);
            ctx.metadata.insert("cached".to_string(), serde_json::json!(true));
        } else {
            ctx.cache_on_success = true;
        }
        Ok(())
    }

    async fn after(&self, ctx: &mut InterceptorContext, result: &serde_json::Value) {
        if !ctx.cache_on_success {
            return;
        }
        let Some(key) = ctx.metadata.get("cacheKey").and_then(|v| v.as_str()).map(|s| s.to_string()) else {
            return;
        };
        self.cache.lock().await.put(key, result.clone());
    }
}

/// A guardrail validator: denies input by returning `Err(reason)` (§4.4
/// item 3).
pub type Validator = Arc<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;

/// Runs validators over the input at order 20; raises
/// [`ToolError::GuardrailViolation`] on the first denial. `stop_on_error`
/// is `true` — a denial aborts the chain rather than merely being logged
/// (§4.4 item 3).
pub struct GuardrailsInterceptor {
    validators: Vec<Validator>,
}

impl GuardrailsInterceptor {
    pub fn new(validators: Vec<Validator>) -> Self {
        Self { validators }
    }

    /// A validator denying any input whose string fields contain `needle`
    /// literally — ships as the example in §8 scenario 4.
    pub fn deny_literal(needle: impl Into<String>) -> Validator {
        let needle = needle.into();
        Arc::new(move |input: &serde_json::Value| {
            if contains_literal(input, &needle) {
                Err(format!("input contains denied literal {needle:?}"))
            } else {
                Ok(())
            }
        })
    }
}

fn contains_literal(value: &serde_json::Value, needle: &str) -> bool {
    match value {
        serde_json::Value::String(s) => s.contains(needle),
        serde_json::Value::Array(items) => items.iter().any(|v| contains_literal(v, needle)),
        serde_json::Value::Object(map) => map.values().any(|v| contains_literal(v, needle)),
        _ => false,
    }
}

#[async_trait]
impl Interceptor for GuardrailsInterceptor {
    fn name(&self) -> &str {
        "guardrails"
    }

    fn order(&self) -> i64 {
        20
    }

    fn stop_on_error(&self) -> bool {
        true
    }

    async fn before(&self, ctx: &mut InterceptorContext) -> Result<(), ToolError> {
        for validator in &self.validators {
            if let Err(reason) = validator(&ctx.input) {
                return Err(ToolError::GuardrailViolation(reason));
            }
        }
        Ok(())
    }
}

/// Records duration and success/failure at order 30 (§4.4 item 4).
pub struct MetricsInterceptor {
    recordings: Mutex<Vec<MetricRecording>>,
}

#[derive(Debug, Clone)]
pub struct MetricRecording {
    pub tool_name: String,
    pub success: bool,
    pub duration: std::time::Duration,
    pub cached: bool,
}

impl Default for MetricsInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInterceptor {
    pub fn new() -> Self {
        Self {
            recordings: Mutex::new(Vec::new()),
        }
    }

    pub async fn recordings(&self) -> Vec<MetricRecording> {
        self.recordings.lock().await.clone()
    }
}

#[async_trait]
impl Interceptor for MetricsInterceptor {
    fn name(&self) -> &str {
        "metrics"
    }

    fn order(&self) -> i64 {
        30
    }

    async fn before(&self, ctx: &mut InterceptorContext) -> Result<(), ToolError> {
        ctx.metadata.insert(
            "metricsStartedAt".to_string(),
            serde_json::json!(ctx.start_time.elapsed().as_nanos() as u64),
        );
        Ok(())
    }

    async fn after(&self, ctx: &mut InterceptorContext, _result: &serde_json::Value) {
        let cached = ctx
            .metadata
            .get("cached")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        self.recordings.lock().await.push(MetricRecording {
            tool_name: ctx.tool_name.clone(),
            success: true,
            duration: ctx.start_time.elapsed(),
            cached,
        });
        log::debug!(
            "metrics: {} succeeded in {:?} (cached={cached})",
            ctx.tool_name,
            ctx.start_time.elapsed()
        );
    }

    async fn on_error(&self, ctx: &mut InterceptorContext, _err: &ToolError) {
        self.recordings.lock().await.push(MetricRecording {
            tool_name: ctx.tool_name.clone(),
            success: false,
            duration: ctx.start_time.elapsed(),
            cached: false,
        });
    }
}

/// Sorts interceptors ascending by `order`, used by the pipeline for the
/// `before` pass (and reversed for `after`/`on_error`).
pub fn sorted_ascending(interceptors: &[Arc<dyn Interceptor>]) -> Vec<Arc<dyn Interceptor>> {
    let mut sorted: Vec<Arc<dyn Interceptor>> = interceptors.to_vec();
    sorted.sort_by_key(|i| i.order());
    sorted
}
