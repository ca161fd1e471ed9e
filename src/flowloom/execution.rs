//! Execution-id generation and the hierarchical execution tracker (§3, §4.1).
//!
//! Every flow, node, tool, and LLM call in the engine is assigned an
//! [`ExecutionId`] by the [`ExecutionTracker`]. Parent ids are stored as
//! values rather than pointers to parent records (§9 "Hierarchical id
//! registry"), following an append-only log idiom: entries are appended,
//! never mutated in place except for the terminal
//! status transition, and traversal walks an index rather than following
//! in-memory references.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// The kind of unit of work an [`ExecutionId`] was minted for (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionKind {
    Flow,
    Agent,
    Node,
    Tool,
    Llm,
    Parallel,
}

impl ExecutionKind {
    /// Short prefix used when rendering ids, purely for readability.
    fn prefix(self) -> &'static str {
        match self {
            ExecutionKind::Flow => "flow",
            ExecutionKind::Agent => "agent",
            ExecutionKind::Node => "node",
            ExecutionKind::Tool => "tool",
            ExecutionKind::Llm => "llm",
            ExecutionKind::Parallel => "par",
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionKind::Flow => "FLOW",
            ExecutionKind::Agent => "AGENT",
            ExecutionKind::Node => "NODE",
            ExecutionKind::Tool => "TOOL",
            ExecutionKind::Llm => "LLM",
            ExecutionKind::Parallel => "PARALLEL",
        };
        f.write_str(s)
    }
}

/// An opaque, immutable execution identifier (§3).
///
/// Ids are globally unique within a process lifetime. The textual form
/// (`{prefix}-{counter}-{depth}`) is not a contract clients should parse —
/// only a debugging aid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionId {
    id: String,
    parent: Option<String>,
    kind: ExecutionKind,
    depth: u32,
    created_at: DateTime<Utc>,
}

impl ExecutionId {
    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn kind(&self) -> ExecutionKind {
        self.kind
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Mints a detached id for use in unit tests of other modules that need an
/// `ExecutionId` but not a full tracker (e.g. interceptor-chain tests).
#[doc(hidden)]
pub(crate) fn mint_for_test(kind: ExecutionKind) -> ExecutionId {
    mint(kind, None)
}

fn mint(kind: ExecutionKind, parent: Option<&ExecutionId>) -> ExecutionId {
    let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let depth = parent.map(|p| p.depth + 1).unwrap_or(0);
    ExecutionId {
        id: format!("{}-{n:08x}", kind.prefix()),
        parent: parent.map(|p| p.id.clone()),
        kind,
        depth,
        created_at: Utc::now(),
    }
}

/// Status of an execution record (§3). Transitions are monotonic along the
/// order listed: `PENDING -> RUNNING -> {SUCCEEDED, FAILED, CANCELLED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// One record per [`ExecutionId`], owned by the [`ExecutionTracker`] (§3).
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    children: Vec<String>,
}

impl ExecutionRecord {
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at.map(|end| {
            (end - self.started_at)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }
}

/// Errors raised by [`ExecutionTracker`] operations (§4.1 "Failure model").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// `StartChild` was called with a parent id the tracker has never seen
    /// (or has since evicted).
    UnknownParent(String),
    /// A terminal transition or lookup referenced an id the tracker has
    /// never seen (or has since evicted).
    UnknownExecution(String),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::UnknownParent(id) => write!(f, "unknown parent execution: {id}"),
            TrackerError::UnknownExecution(id) => write!(f, "unknown execution: {id}"),
        }
    }
}

impl std::error::Error for TrackerError {}

struct Inner {
    records: HashMap<String, ExecutionRecord>,
}

/// The in-memory registry of execution records and their parent/child
/// relationships (§4.1).
///
/// All operations are safe under concurrent callers; the record map is
/// guarded by a single `tokio::sync::RwLock` (§5 "Shared-resource policy" —
/// tracker operations are short, O(1) except snapshot/render).
pub struct ExecutionTracker {
    inner: Arc<RwLock<Inner>>,
    retention: Duration,
}

impl ExecutionTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                records: HashMap::new(),
            })),
            retention,
        }
    }

    /// Creates a root execution record with no parent, status RUNNING.
    pub async fn start_root(
        &self,
        kind: ExecutionKind,
        metadata: HashMap<String, serde_json::Value>,
    ) -> ExecutionId {
        let id = mint(kind, None);
        let record = ExecutionRecord {
            id: id.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            error: None,
            metadata,
            children: Vec::new(),
        };
        let mut inner = self.inner.write().await;
        inner.records.insert(id.as_str().to_string(), record);
        id
    }

    /// Creates a child execution record under `parent`. Fails with
    /// [`TrackerError::UnknownParent`] if the parent is unknown.
    pub async fn start_child(
        &self,
        parent: &ExecutionId,
        kind: ExecutionKind,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<ExecutionId, TrackerError> {
        let mut inner = self.inner.write().await;
        if !inner.records.contains_key(parent.as_str()) {
            return Err(TrackerError::UnknownParent(parent.as_str().to_string()));
        }
        let id = mint(kind, Some(parent));
        let record = ExecutionRecord {
            id: id.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            error: None,
            metadata,
            children: Vec::new(),
        };
        inner.records.insert(id.as_str().to_string(), record);
        inner
            .records
            .get_mut(parent.as_str())
            .expect("checked above")
            .children
            .push(id.as_str().to_string());
        Ok(id)
    }

    /// Idempotent terminal transition. Returns `Ok(true)` on the first call
    /// for `id`, `Ok(false)` on any subsequent call (§8 invariant 2).
    pub async fn succeed(
        &self,
        id: &ExecutionId,
        result: serde_json::Value,
    ) -> Result<bool, TrackerError> {
        self.terminate(id, ExecutionStatus::Succeeded, Some(result), None)
            .await
    }

    pub async fn fail(&self, id: &ExecutionId, error: impl Into<String>) -> Result<bool, TrackerError> {
        self.terminate(id, ExecutionStatus::Failed, None, Some(error.into()))
            .await
    }

    pub async fn cancel(&self, id: &ExecutionId) -> Result<bool, TrackerError> {
        self.terminate(id, ExecutionStatus::Cancelled, None, None)
            .await
    }

    async fn terminate(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, TrackerError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id.as_str())
            .ok_or_else(|| TrackerError::UnknownExecution(id.as_str().to_string()))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.status = status;
        record.ended_at = Some(Utc::now());
        record.result = result;
        record.error = error;
        Ok(true)
    }

    /// Returns a clone of the current record for `id`, if any.
    pub async fn get(&self, id: &ExecutionId) -> Option<ExecutionRecord> {
        let inner = self.inner.read().await;
        inner.records.get(id.as_str()).cloned()
    }

    /// Depth-first pre-order collection of the subtree rooted at `root_id`.
    pub async fn snapshot(&self, root_id: &ExecutionId) -> Result<Vec<ExecutionRecord>, TrackerError> {
        let inner = self.inner.read().await;
        if !inner.records.contains_key(root_id.as_str()) {
            return Err(TrackerError::UnknownExecution(root_id.as_str().to_string()));
        }
        let mut out = Vec::new();
        let mut stack = vec![root_id.as_str().to_string()];
        while let Some(current) = stack.pop() {
            if let Some(record) = inner.records.get(&current) {
                out.push(record.clone());
                for child in record.children.iter().rev() {
                    stack.push(child.clone());
                }
            }
        }
        Ok(out)
    }

    /// Ascii tree using `├──`/`└──` glyphs (§4.1).
    pub async fn render_tree(&self, root_id: &ExecutionId) -> Result<String, TrackerError> {
        let inner = self.inner.read().await;
        if !inner.records.contains_key(root_id.as_str()) {
            return Err(TrackerError::UnknownExecution(root_id.as_str().to_string()));
        }
        let mut out = String::new();
        render_node(&inner.records, root_id.as_str(), "", true, &mut out);
        Ok(out)
    }

    /// Evicts finished records older than the configured retention window,
    /// skipping any record whose descendants are still live. Eviction is
    /// lazy — call this periodically (e.g. alongside the dispatcher's idle
    /// cleanup); it is never invoked implicitly by other operations.
    pub async fn evict_expired(&self) {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let retention = self.retention;
        let mut live_parents: std::collections::HashSet<String> = std::collections::HashSet::new();
        for record in inner.records.values() {
            if !record.status.is_terminal() {
                let mut p = record.id.parent_id().map(|s| s.to_string());
                while let Some(pid) = p {
                    live_parents.insert(pid.clone());
                    p = inner.records.get(&pid).and_then(|r| r.id.parent_id().map(|s| s.to_string()));
                }
            }
        }
        let to_evict: Vec<String> = inner
            .records
            .values()
            .filter(|r| {
                r.status.is_terminal()
                    && r.ended_at
                        .map(|end| (now - end).to_std().unwrap_or(Duration::ZERO) > retention)
                        .unwrap_or(false)
                    && r.children.is_empty()
                    && !live_parents.contains(r.id.as_str())
            })
            .map(|r| r.id.as_str().to_string())
            .collect();
        for id in to_evict {
            log::debug!("tracker: evicting expired execution record {id}");
            inner.records.remove(&id);
        }
    }
}

fn render_node(
    records: &HashMap<String, ExecutionRecord>,
    id: &str,
    prefix: &str,
    is_last: bool,
    out: &mut String,
) {
    let Some(record) = records.get(id) else {
        return;
    };
    let connector = if prefix.is_empty() {
        ""
    } else if is_last {
        "└── "
    } else {
        "├── "
    };
    out.push_str(prefix);
    out.push_str(connector);
    out.push_str(&format!("[{}] {} {}", record.id.kind(), record.id.as_str(), record.status));
    if let Some(duration) = record.duration() {
        out.push_str(&format!(" ({}ms)", duration.as_millis()));
    }
    out.push('\n');

    let child_prefix = if prefix.is_empty() {
        String::new()
    } else if is_last {
        format!("{prefix}    ")
    } else {
        format!("{prefix}│   ")
    };
    let next_prefix = if prefix.is_empty() { "" } else { &child_prefix };
    for (i, child) in record.children.iter().enumerate() {
        let last = i == record.children.len() - 1;
        render_node(records, child, next_prefix, last, out);
    }
}
