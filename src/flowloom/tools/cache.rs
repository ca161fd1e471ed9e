//! Canonical JSON fingerprinting and the bounded TTL/LRU cache backing the
//! Caching interceptor (§4.4 item 2).
//!
//! `serde_json::Value`'s object representation does not guarantee sorted
//! keys across crate feature flags, so fingerprinting recurses explicitly
//! through a `BTreeMap<String, Value>` to force canonical key order,
//! exactly as `thought_chain.rs`'s `compute_thought_hash` hashes its
//! canonicalized fields with `sha2::Sha256`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Canonicalizes `value` (sorted object keys, recursively) and returns its
/// SHA-256 hex digest, prefixed with `tool_name` so identical inputs to
/// different tools never collide.
pub fn fingerprint(tool_name: &str, value: &serde_json::Value) -> String {
    let canonical = canonicalize(value);
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, &serde_json::Value> = map.iter().collect();
            let mut out = String::from("{");
            for (i, (k, v)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).unwrap_or_default());
                out.push(':');
                out.push_str(&canonicalize(v));
            }
            out.push('}');
            out
        }
        serde_json::Value::Array(items) => {
            let mut out = String::from("[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&canonicalize(item));
            }
            out.push(']');
            out
        }
        serde_json::Value::Number(n) => {
            // Normalize numeric representation: an integral float and an
            // integer with the same magnitude must fingerprint identically.
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(f) = n.as_f64() {
                format!("{f}")
            } else {
                n.to_string()
            }
        }
        other => other.to_string(),
    }
}

struct Entry {
    value: serde_json::Value,
    inserted_at: Instant,
}

/// A bounded LRU cache with lazy TTL eviction on access (§4.4, §5, §8
/// boundary scenario: "Cache at capacity with full LRU eviction still
/// serves the most-recently-used entries").
pub struct ToolCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
}

impl ToolCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns the cached value for `key`, or `None` if absent or expired.
    /// A hit promotes the key to most-recently-used.
    pub fn get(&mut self, key: &str) -> Option<serde_json::Value> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            self.order.retain(|k| k != key);
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn put(&mut self, key: String, value: serde_json::Value) {
        if self.entries.contains_key(&key) {
            self.entries.insert(
                key.clone(),
                Entry {
                    value,
                    inserted_at: Instant::now(),
                },
            );
            self.touch(&key);
            return;
        }
        while self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
        self.entries.insert(
            key.clone(),
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
        self.order.push_back(key);
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_key_order_independent() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(fingerprint("t", &a), fingerprint("t", &b));
    }

    #[test]
    fn fingerprint_normalizes_integral_floats() {
        let a = serde_json::json!({"n": 1});
        let b = serde_json::json!({"n": 1.0});
        assert_eq!(fingerprint("t", &a), fingerprint("t", &b));
    }

    #[test]
    fn fingerprint_differs_across_tools() {
        let v = serde_json::json!({"s": "hi"});
        assert_ne!(fingerprint("echo", &v), fingerprint("other", &v));
    }

    #[test]
    fn cache_put_then_get_round_trips() {
        let mut cache = ToolCache::new(4, Duration::from_secs(60));
        cache.put("k".to_string(), serde_json::json!(42));
        assert_eq!(cache.get("k"), Some(serde_json::json!(42)));
    }

    #[test]
    fn cache_expires_after_ttl() {
        let mut cache = ToolCache::new(4, Duration::from_millis(1));
        cache.put("k".to_string(), serde_json::json!(42));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn cache_at_capacity_evicts_least_recently_used() {
        let mut cache = ToolCache::new(2, Duration::from_secs(60));
        cache.put("a".to_string(), serde_json::json!(1));
        cache.put("b".to_string(), serde_json::json!(2));
        // Touch "a" so "b" becomes least-recently-used.
        assert_eq!(cache.get("a"), Some(serde_json::json!(1)));
        cache.put("c".to_string(), serde_json::json!(3));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(serde_json::json!(1)));
        assert_eq!(cache.get("c"), Some(serde_json::json!(3)));
    }
}
