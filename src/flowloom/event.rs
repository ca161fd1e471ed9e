//! Streamed event protocol and per-session dispatcher (§4.2, §6.1).
//!
//! An [`EventEnvelope`] is the typed, serializable unit pushed to clients —
//! one JSON object per line. The [`Dispatcher`] owns one [`Emitter`] per
//! session and runs the periodic heartbeat/idle-cleanup sweep. An in-process
//! callback-style event handler is generalized here into a serializable
//! wire format; the bounded-queue-per-session emitter runs its drain loop
//! as a spawned task, one per concurrent session.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

/// The six event domains (§3, §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventDomain {
    Chat,
    Thinking,
    Tool,
    Audit,
    Interaction,
    System,
}

impl EventDomain {
    /// Whether this domain's envelopes are never dropped under backpressure
    /// (§4.2 "Backpressure policy"), regardless of event type.
    fn always_essential(self) -> bool {
        matches!(
            self,
            EventDomain::Tool | EventDomain::Interaction | EventDomain::Audit
        )
    }
}

/// Header carried by every envelope (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    pub domain: EventDomain,
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: String,
    pub timestamp: i64,
}

/// An immutable, two-part event envelope (§3, §6.1).
///
/// `envelope` carries the header; `data` carries the domain-specific
/// payload. Construct with [`EventEnvelope::new`] or one of the
/// domain-specific helpers below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub envelope: EventHeader,
    pub data: serde_json::Value,
}

static ENVELOPE_COUNTER: AtomicU64 = AtomicU64::new(1);

impl EventEnvelope {
    pub fn new(domain: EventDomain, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        let n = ENVELOPE_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            envelope: EventHeader {
                domain,
                event_type: event_type.into(),
                id: format!("evt-{n:08x}"),
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            data,
        }
    }

    /// Whether this envelope is eligible to be dropped under backpressure
    /// (§4.2): SYSTEM/heartbeat and CHAT/delta may be dropped when the
    /// emitter's queue is full; everything else (TOOL/*, CHAT/message,
    /// INTERACTION/*, AUDIT/*) is never dropped.
    pub fn is_droppable(&self) -> bool {
        if self.envelope.domain.always_essential() {
            return false;
        }
        match self.envelope.domain {
            EventDomain::System => self.envelope.event_type == "heartbeat",
            EventDomain::Chat => self.envelope.event_type == "delta",
            EventDomain::Thinking | EventDomain::Tool | EventDomain::Interaction | EventDomain::Audit => false,
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn heartbeat() -> Self {
        Self::new(EventDomain::System, "heartbeat", serde_json::Value::Null)
    }

    pub fn connected(session_id: &str) -> Self {
        Self::new(
            EventDomain::System,
            "connected",
            serde_json::json!({ "sessionId": session_id }),
        )
    }

    pub fn system_error(message: impl Into<String>, code: Option<String>) -> Self {
        Self::new(
            EventDomain::System,
            "error",
            serde_json::json!({ "message": message.into(), "code": code }),
        )
    }

    pub fn tool_start(
        tool_name: &str,
        input: &serde_json::Value,
        execution_id: &str,
        parent_id: Option<&str>,
    ) -> Self {
        Self::new(
            EventDomain::Tool,
            "start",
            serde_json::json!({
                "toolName": tool_name,
                "input": input,
                "executionId": execution_id,
                "parentId": parent_id,
            }),
        )
    }

    pub fn tool_result(tool_name: &str, output: &serde_json::Value, duration_ms: u128, cached: bool) -> Self {
        Self::new(
            EventDomain::Tool,
            "result",
            serde_json::json!({
                "toolName": tool_name,
                "output": output,
                "durationMs": duration_ms,
                "cached": cached,
            }),
        )
    }

    pub fn tool_error(tool_name: &str, message: impl Into<String>, code: Option<String>) -> Self {
        Self::new(
            EventDomain::Tool,
            "error",
            serde_json::json!({
                "toolName": tool_name,
                "message": message.into(),
                "code": code,
            }),
        )
    }

    /// One cumulative chunk of an in-progress LLM response (§9 "chat/delta
    /// vs chat/message": deltas are cumulative chunks of the same turn).
    pub fn chat_delta(execution_id: &str, chunk: impl Into<String>) -> Self {
        Self::new(
            EventDomain::Chat,
            "delta",
            serde_json::json!({ "executionId": execution_id, "chunk": chunk.into() }),
        )
    }

    /// The final, complete text for a turn (concatenation of its deltas).
    pub fn chat_message(execution_id: &str, content: impl Into<String>) -> Self {
        Self::new(
            EventDomain::Chat,
            "message",
            serde_json::json!({ "executionId": execution_id, "content": content.into() }),
        )
    }

    pub fn audit_flow_start(workflow_id: &str, execution_id: &str) -> Self {
        Self::new(
            EventDomain::Audit,
            "flow-start",
            serde_json::json!({ "workflowId": workflow_id, "executionId": execution_id }),
        )
    }

    pub fn audit_flow_end(execution_id: &str, status: impl fmt::Display, duration_ms: u128) -> Self {
        Self::new(
            EventDomain::Audit,
            "flow-end",
            serde_json::json!({
                "executionId": execution_id,
                "status": status.to_string(),
                "durationMs": duration_ms,
            }),
        )
    }

    pub fn audit_node_start(node_id: &str, execution_id: &str) -> Self {
        Self::new(
            EventDomain::Audit,
            "node-start",
            serde_json::json!({ "nodeId": node_id, "executionId": execution_id }),
        )
    }

    pub fn audit_node_end(node_id: &str, execution_id: &str, status: impl fmt::Display) -> Self {
        Self::new(
            EventDomain::Audit,
            "node-end",
            serde_json::json!({
                "nodeId": node_id,
                "executionId": execution_id,
                "status": status.to_string(),
            }),
        )
    }
}

/// Errors raised by dispatcher/emitter operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    SessionAlreadyRegistered(String),
    EmitterClosed,
    StreamOverrun,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::SessionAlreadyRegistered(id) => {
                write!(f, "session already registered: {id}")
            }
            DispatchError::EmitterClosed => write!(f, "emitter closed"),
            DispatchError::StreamOverrun => write!(f, "stream overrun"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// A per-session channel that serializes envelopes onto one client
/// connection (§4.2).
///
/// Internally this is a bounded `tokio::mpsc` channel; a consumer task
/// (owned by the caller — typically the HTTP/stream handler) drains the
/// receiver half and writes lines to the wire. `emit` never blocks the
/// caller: a full queue triggers the backpressure policy rather than
/// awaiting capacity.
pub struct Emitter {
    session_id: String,
    sender: mpsc::Sender<EventEnvelope>,
    closed: AtomicBool,
    last_emit_at: RwLock<std::time::Instant>,
}

impl Emitter {
    fn new(session_id: String, capacity: usize) -> (Arc<Self>, mpsc::Receiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let emitter = Arc::new(Self {
            session_id,
            sender,
            closed: AtomicBool::new(false),
            last_emit_at: RwLock::new(std::time::Instant::now()),
        });
        (emitter, receiver)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Non-blocking emit. Returns `Ok(())` if accepted or silently dropped
    /// as a droppable envelope under backpressure, `Err(StreamOverrun)` if a
    /// non-droppable envelope could not be queued (the caller should close
    /// the stream), `Err(EmitterClosed)` if the emitter is already closed.
    ///
    /// The emitter only holds the send half of its channel, so when the
    /// queue is full it drops the incoming droppable envelope rather than
    /// evicting the oldest one already queued — this still guarantees a
    /// non-droppable envelope is never silently lost, which is the
    /// property callers depend on.
    pub async fn emit(&self, envelope: EventEnvelope) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::EmitterClosed);
        }
        match self.sender.try_send(envelope) {
            Ok(()) => {
                *self.last_emit_at.write().await = std::time::Instant::now();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(envelope)) => self.handle_full_queue(envelope).await,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
                Err(DispatchError::EmitterClosed)
            }
        }
    }

    async fn handle_full_queue(&self, envelope: EventEnvelope) -> Result<(), DispatchError> {
        if envelope.is_droppable() {
            log::debug!(
                "emitter[{}]: queue full, dropping droppable envelope {:?}/{}",
                self.session_id,
                envelope.envelope.domain,
                envelope.envelope.event_type
            );
            return Ok(());
        }
        log::warn!(
            "emitter[{}]: stream-overrun — non-droppable envelope could not be queued, closing",
            self.session_id
        );
        self.closed.store(true, Ordering::Release);
        Err(DispatchError::StreamOverrun)
    }

    /// Marks the emitter closed. Subsequent `emit` calls are silently
    /// rejected with [`DispatchError::EmitterClosed`]. The channel buffer
    /// drains naturally as the consumer task keeps reading.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_emit_at.read().await.elapsed()
    }
}

struct Registration {
    emitter: Arc<Emitter>,
}

struct DispatcherInner {
    sessions: HashMap<String, Registration>,
}

/// Owns the per-session emitter map; broadcasts, heartbeats, and sweeps
/// idle sessions (§4.2).
pub struct Dispatcher {
    inner: Arc<RwLock<DispatcherInner>>,
    queue_capacity: usize,
    idle_ttl: Duration,
}

impl Dispatcher {
    pub fn new(queue_capacity: usize, idle_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(DispatcherInner {
                sessions: HashMap::new(),
            })),
            queue_capacity,
            idle_ttl,
        }
    }

    /// Registers a new session, returning its emitter and the receiver
    /// half the caller should drain onto the wire. Fails if the session is
    /// already registered.
    pub async fn register(
        &self,
        session_id: impl Into<String>,
    ) -> Result<(Arc<Emitter>, mpsc::Receiver<EventEnvelope>), DispatchError> {
        let session_id = session_id.into();
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&session_id) {
            return Err(DispatchError::SessionAlreadyRegistered(session_id));
        }
        let (emitter, receiver) = Emitter::new(session_id.clone(), self.queue_capacity);
        inner.sessions.insert(
            session_id,
            Registration {
                emitter: emitter.clone(),
            },
        );
        Ok((emitter, receiver))
    }

    pub async fn unregister(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(registration) = inner.sessions.remove(session_id) {
            registration.emitter.close();
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Emitter>> {
        let inner = self.inner.read().await;
        inner.sessions.get(session_id).map(|r| r.emitter.clone())
    }

    /// Best-effort send to every emitter for which `predicate(session_id)`
    /// is true.
    pub async fn broadcast(&self, envelope: EventEnvelope, predicate: impl Fn(&str) -> bool) {
        let targets: Vec<Arc<Emitter>> = {
            let inner = self.inner.read().await;
            inner
                .sessions
                .iter()
                .filter(|(id, _)| predicate(id))
                .map(|(_, r)| r.emitter.clone())
                .collect()
        };
        for emitter in targets {
            if let Err(e) = emitter.emit(envelope.clone()).await {
                log::debug!("dispatcher: broadcast to {} failed: {e}", emitter.session_id());
            }
        }
    }

    /// Emits a SYSTEM/heartbeat on every registered emitter. Intended to be
    /// driven by a caller-owned periodic task (e.g. `tokio::time::interval`
    /// at [`crate::EngineConfig::heartbeat_interval`]).
    pub async fn heartbeat_all(&self) {
        self.broadcast(EventEnvelope::heartbeat(), |_| true).await;
    }

    /// Unregisters any emitter whose last successful emit is older than
    /// the configured idle TTL.
    pub async fn sweep_idle(&self) {
        let stale: Vec<String> = {
            let inner = self.inner.read().await;
            let mut stale = Vec::new();
            for (id, registration) in inner.sessions.iter() {
                if registration.emitter.idle_for().await > self.idle_ttl {
                    stale.push(id.clone());
                }
            }
            stale
        };
        for id in stale {
            log::info!("dispatcher: unregistering idle session {id}");
            self.unregister(&id).await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}
