//! Framed JSON-RPC 2.0 transport over a child process's standard I/O
//! (§4.3, §6.3).
//!
//! Built on a `Box<dyn Error + Send + Sync>` result convention for the
//! subprocess boundary and a `tokio::spawn` reader task for the child's
//! stdout; the pending-request correlation map follows the same
//! task/result correlation idiom using `tokio::sync::oneshot` instead of a
//! join handle.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};

/// A JSON-RPC 2.0 id — either a string or an integer (§3, §6.3). Parsing
/// accepts either; writing preserves whichever type was seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Number(n) => write!(f, "{n}"),
            RpcId::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

/// A classified inbound or outbound JSON-RPC 2.0 message (§3, §6.3).
#[derive(Debug, Clone)]
pub enum RpcMessage {
    Request {
        id: RpcId,
        method: String,
        params: Option<JsonValue>,
    },
    Notification {
        method: String,
        params: Option<JsonValue>,
    },
    Response {
        id: RpcId,
        result: Option<JsonValue>,
        error: Option<RpcError>,
    },
}

/// Wire-level shape used only for (de)serialization; [`RpcMessage`] is the
/// classified value the rest of the engine works with.
#[derive(Debug, Serialize, Deserialize)]
struct RawMessage {
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<RpcId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<JsonValue>,
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error: Option<RpcError>,
}

impl RpcMessage {
    /// Classifies a raw line per §4.3's message classification rule:
    /// `id` + `method` → request; `method`, no `id` → notification; `id`,
    /// no `method` (has `result` or `error`) → response; anything else is a
    /// parse error.
    pub fn parse(line: &str) -> Result<Self, TransportError> {
        let raw: RawMessage =
            serde_json::from_str(line).map_err(|e| TransportError::Parse(e.to_string()))?;
        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(RpcMessage::Request {
                id,
                method,
                params: raw.params,
            }),
            (None, Some(method)) => Ok(RpcMessage::Notification {
                method,
                params: raw.params,
            }),
            (Some(id), None) if raw.result.is_some() || raw.error.is_some() => Ok(RpcMessage::Response {
                id,
                result: raw.result,
                error: raw.error,
            }),
            _ => Err(TransportError::Parse(
                "message has neither (id, method) nor (id, result|error)".to_string(),
            )),
        }
    }

    pub fn to_line(&self) -> Result<String, TransportError> {
        let raw = match self {
            RpcMessage::Request { id, method, params } => RawMessage {
                jsonrpc: Some("2.0".to_string()),
                id: Some(id.clone()),
                method: Some(method.clone()),
                params: params.clone(),
                result: None,
                error: None,
            },
            RpcMessage::Notification { method, params } => RawMessage {
                jsonrpc: Some("2.0".to_string()),
                id: None,
                method: Some(method.clone()),
                params: params.clone(),
                result: None,
                error: None,
            },
            RpcMessage::Response { id, result, error } => RawMessage {
                jsonrpc: Some("2.0".to_string()),
                id: Some(id.clone()),
                method: None,
                params: None,
                result: result.clone(),
                error: error.clone(),
            },
        };
        serde_json::to_string(&raw).map_err(|e| TransportError::Parse(e.to_string()))
    }

    pub fn request(id: RpcId, method: impl Into<String>, params: Option<JsonValue>) -> Self {
        RpcMessage::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<JsonValue>) -> Self {
        RpcMessage::Notification {
            method: method.into(),
            params,
        }
    }
}

/// Errors raised by the transport (§7 "Remote transport failure").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    NotStarted,
    Closed,
    Io(String),
    Parse(String),
    Send(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotStarted => write!(f, "transport not started"),
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Io(e) => write!(f, "io error: {e}"),
            TransportError::Parse(e) => write!(f, "parse error: {e}"),
            TransportError::Send(e) => write!(f, "send error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Handler invoked for every inbound message that was not a response to a
/// pending request (notifications, and requests from the peer).
pub type MessageHandler = Arc<dyn Fn(RpcMessage) + Send + Sync>;

struct PendingRequests {
    map: Mutex<HashMap<RpcId, oneshot::Sender<Result<RpcMessage, TransportError>>>>,
}

impl PendingRequests {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    async fn register(&self, id: RpcId) -> oneshot::Receiver<Result<RpcMessage, TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.map.lock().await.insert(id, tx);
        rx
    }

    async fn complete(&self, id: &RpcId, message: RpcMessage) -> bool {
        if let Some(tx) = self.map.lock().await.remove(id) {
            let _ = tx.send(Ok(message));
            true
        } else {
            false
        }
    }

    async fn fail_all(&self) {
        let mut map = self.map.lock().await;
        for (_, tx) in map.drain() {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }
}

static REQUEST_COUNTER: AtomicI64 = AtomicI64::new(1);

/// Framed JSON-RPC 2.0 transport over a spawned child process's stdio
/// (§4.3). One reader task parses newline-delimited JSON from the child's
/// stdout; writes go straight to stdin, serialized one line at a time.
pub struct ProcessTransport {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    pending: Arc<PendingRequests>,
    active: Arc<AtomicBool>,
    handler: Mutex<Option<MessageHandler>>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProcessTransport {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            pending: Arc::new(PendingRequests::new()),
            active: Arc::new(AtomicBool::new(false)),
            handler: Mutex::new(None),
            reader_task: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Installs the handler invoked for every inbound message once any
    /// pending-future completion has been attempted (§4.3 item 4). Must be
    /// called before [`Self::start`] to observe early notifications
    /// reliably, though it may be changed at any time.
    pub async fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.lock().await = Some(handler);
    }

    /// Spawns the subprocess and starts the reader task.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let stdin = child.stdin.take().ok_or_else(|| TransportError::Io("no stdin".to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Io("no stdout".to_string()))?;

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        self.active.store(true, Ordering::Release);

        let pending = self.pending.clone();
        let active = self.active.clone();
        let handler = self.handler_clone().await;
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match RpcMessage::parse(&line) {
                            Ok(message) => {
                                if let RpcMessage::Response { id, .. } = &message {
                                    pending.complete(id, message.clone()).await;
                                }
                                if let Some(ref h) = handler {
                                    // §4.3 item 4: the handler is called exactly once per
                                    // inbound message, after any pending-future completion.
                                    // A panicking handler must not take the reader task down
                                    // with it, so its call is isolated and swallowed.
                                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| h(message)));
                                    if result.is_err() {
                                        log::error!("transport: message handler panicked");
                                    }
                                }
                            }
                            Err(e) => {
                                log::warn!("transport: parse error on inbound line: {e}");
                            }
                        }
                    }
                    Ok(None) => {
                        log::info!("transport: subprocess stdout closed (EOF)");
                        break;
                    }
                    Err(e) => {
                        log::warn!("transport: error reading stdout: {e}");
                        break;
                    }
                }
            }
            active.store(false, Ordering::Release);
            pending.fail_all().await;
        });
        *self.reader_task.lock().await = Some(handle);
        Ok(())
    }

    async fn handler_clone(&self) -> Option<MessageHandler> {
        self.handler.lock().await.clone()
    }

    /// Serializes and writes a single line. Fails with
    /// [`TransportError::NotStarted`]/[`TransportError::Closed`] if the
    /// transport isn't running.
    pub async fn send(&self, message: &RpcMessage) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        let mut line = message.to_line()?;
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::NotStarted)?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        stdin.flush().await.map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }

    /// Generates a fresh numeric request id, unique for this transport's
    /// lifetime.
    pub fn next_id(&self) -> RpcId {
        RpcId::Number(REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers `request`'s id in the pending-requests map, sends it, and
    /// returns the eventual response. Fails with
    /// [`TransportError::Closed`] if the transport dies before a matching
    /// response arrives.
    pub async fn send_request(&self, method: impl Into<String>, params: Option<JsonValue>) -> Result<RpcMessage, TransportError> {
        let id = self.next_id();
        let request = RpcMessage::request(id.clone(), method, params);
        let rx = self.pending.register(id).await;
        self.send(&request).await?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Stops the transport: interrupts the reader, terminates the
    /// subprocess gracefully (5s timeout) then forcibly, fails all pending
    /// requests, and marks the transport inactive.
    pub async fn stop(&self) {
        self.active.store(false, Ordering::Release);
        *self.stdin.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            let graceful = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            if graceful.is_err() {
                log::warn!("transport: subprocess did not exit within 5s, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        self.pending.fail_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_request_notification_response() {
        let request = RpcMessage::parse(r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":null}"#).unwrap();
        assert!(matches!(request, RpcMessage::Request { .. }));

        let notif = RpcMessage::parse(r#"{"jsonrpc":"2.0","method":"log","params":{"msg":"hi"}}"#).unwrap();
        assert!(matches!(notif, RpcMessage::Notification { .. }));

        let response = RpcMessage::parse(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#).unwrap();
        assert!(matches!(response, RpcMessage::Response { .. }));

        let err_response = RpcMessage::parse(r#"{"jsonrpc":"2.0","id":"abc","error":{"code":-1,"message":"bad"}}"#).unwrap();
        match err_response {
            RpcMessage::Response { id, error, .. } => {
                assert_eq!(id, RpcId::String("abc".to_string()));
                assert_eq!(error.unwrap().code, -1);
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn malformed_message_is_parse_error() {
        let err = RpcMessage::parse(r#"{"jsonrpc":"2.0","foo":"bar"}"#).unwrap_err();
        assert!(matches!(err, TransportError::Parse(_)));
    }

    #[test]
    fn id_type_is_preserved_through_round_trip() {
        let message = RpcMessage::request(RpcId::String("xyz".to_string()), "do_it", None);
        let line = message.to_line().unwrap();
        let parsed = RpcMessage::parse(&line).unwrap();
        match parsed {
            RpcMessage::Request { id, .. } => assert_eq!(id, RpcId::String("xyz".to_string())),
            _ => panic!("expected request"),
        }
    }

    #[tokio::test]
    async fn round_trip_with_echo_subprocess() {
        // `cat` echoes stdin to stdout line-by-line, standing in for a
        // well-behaved JSON-RPC peer that immediately "responds" with
        // whatever it was sent (after we rewrite the id into a response
        // shape on our side via a second request id-matching message).
        let transport = ProcessTransport::new("cat", vec![]);
        transport.start().await.unwrap();
        assert!(transport.is_active());

        // Send a pre-built "response" line directly and confirm our own
        // request for the same id resolves once `cat` echoes it back.
        let id = transport.next_id();
        let pending = transport.pending.clone();
        let rx = pending.register(id.clone()).await;
        let response = RpcMessage::Response {
            id: id.clone(),
            result: Some(serde_json::json!({"pong": true})),
            error: None,
        };
        transport.send(&response).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap().unwrap();
        match got {
            RpcMessage::Response { result, .. } => {
                assert_eq!(result, Some(serde_json::json!({"pong": true})));
            }
            _ => panic!("expected response"),
        }
        transport.stop().await;
        assert!(!transport.is_active());
    }

    #[tokio::test]
    async fn stop_fails_pending_requests() {
        let transport = ProcessTransport::new("cat", vec![]);
        transport.start().await.unwrap();
        let id = transport.next_id();
        let rx = transport.pending.register(id).await;
        transport.stop().await;
        let result = rx.await.unwrap();
        assert_eq!(result, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn send_after_stop_fails() {
        let transport = ProcessTransport::new("cat", vec![]);
        transport.start().await.unwrap();
        transport.stop().await;
        let err = transport
            .send(&RpcMessage::notification("noop", None))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[tokio::test]
    async fn dead_subprocess_fails_all_pending_requests() {
        // `false` exits immediately with a non-zero status; stdout EOFs
        // right away, which should trip the reader's failure path.
        let transport = ProcessTransport::new("false", vec![]);
        transport.start().await.unwrap();
        let result = transport.send_request("ping", None).await;
        assert!(result.is_err());
        // Give the reader task a moment to observe EOF.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!transport.is_active());
    }
}
