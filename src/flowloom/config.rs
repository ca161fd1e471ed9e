//! Engine-wide configuration.
//!
//! A plain struct the embedding application constructs directly. No
//! file-format parsing dependency is
//! pulled in for its own sake — workflow *graphs* are data and are parsed
//! from JSON/YAML (see [`crate::flow::graph`]), but engine configuration is
//! just Rust values.
//!
//! # Example
//!
//! ```rust
//! use flowloom::EngineConfig;
//!
//! let config = EngineConfig::default();
//! assert_eq!(config.emitter_queue_capacity, 1024);
//! ```

use std::time::Duration;

/// Global configuration for the workflow engine's ambient subsystems
/// (tracker retention, emitter backpressure, heartbeat cadence, tool cache).
///
/// Constructed once at the composition root and passed by reference to the
/// tracker, dispatcher, and pipeline (§9 prefers composition-root-owned
/// collaborators over process-wide singletons).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the worker pool backing flow execution. Defaults to
    /// `8 * available_parallelism()`.
    pub worker_pool_size: usize,
    /// How long finished execution records remain before becoming eligible
    /// for eviction from the tracker.
    pub tracker_retention: Duration,
    /// Bounded queue depth in front of each session's emitter.
    pub emitter_queue_capacity: usize,
    /// An emitter idle longer than this is unregistered by the dispatcher.
    pub emitter_idle_ttl: Duration,
    /// Interval between SYSTEM/heartbeat envelopes.
    pub heartbeat_interval: Duration,
    /// Maximum number of entries the tool-call cache holds.
    pub cache_capacity: usize,
    /// Time-to-live for a cached tool result.
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            worker_pool_size: 8 * cores,
            tracker_retention: Duration::from_secs(60 * 60),
            emitter_queue_capacity: 1024,
            emitter_idle_ttl: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(15),
            cache_capacity: 1024,
            cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}
