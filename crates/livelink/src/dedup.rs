//! Short-window event deduplication.
//!
//! Upstreams replay bursts of identical events (notably after a reconnect).
//! An event is identified by a SHA-256 signature over its kind and the
//! canonical JSON of its payload with volatile fields (arrival timestamps)
//! stripped, and suppressed while that signature is inside the window.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::classifier::duration_ms;
use crate::clock::SharedClock;
use crate::config::DedupConfig;

/// A remembered event signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    pub hash: String,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub entries: usize,
    /// Events reported as duplicates since creation or the last clear.
    pub suppressed: u64,
    pub capacity: usize,
    pub window_ms: u64,
}

#[derive(Debug, Default)]
struct Entries {
    // Insertion order; first_seen_at is non-decreasing front to back.
    order: VecDeque<DedupEntry>,
    index: HashSet<String>,
}

impl Entries {
    fn purge(&mut self, now: DateTime<Utc>, window: chrono::Duration) -> usize {
        let mut removed = 0;
        while let Some(front) = self.order.front() {
            if now - front.first_seen_at < window {
                break;
            }
            if let Some(entry) = self.order.pop_front() {
                self.index.remove(&entry.hash);
                removed += 1;
            }
        }
        removed
    }
}

/// Suppresses repeats of the same event within a time window.
#[derive(Debug)]
pub struct EventDeduplicator {
    entries: Mutex<Entries>,
    window: Duration,
    capacity: usize,
    volatile_fields: HashSet<String>,
    clock: SharedClock,
    suppressed: AtomicU64,
}

impl EventDeduplicator {
    pub fn new(config: &DedupConfig, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            window: config.window(),
            capacity: config.capacity.max(1),
            volatile_fields: config.volatile_fields.iter().cloned().collect(),
            clock,
            suppressed: AtomicU64::new(0),
        }
    }

    fn chrono_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX)
    }

    /// Signature of an event: hex SHA-256 of `kind` and the canonical payload.
    pub fn signature(&self, kind: &str, payload: &Value) -> String {
        let canonical = canonicalize(payload, &self.volatile_fields);
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns `true` when the same event was seen within the window.
    /// Otherwise records it and returns `false`.
    pub fn is_duplicate(&self, kind: &str, payload: &Value) -> bool {
        let hash = self.signature(kind, payload);
        let now = self.clock.now();

        let mut entries = self.entries.lock();
        entries.purge(now, self.chrono_window());

        if entries.index.contains(&hash) {
            drop(entries);
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            trace!(kind, hash = %hash, "Suppressed duplicate event");
            return true;
        }

        while entries.order.len() >= self.capacity {
            match entries.order.pop_front() {
                Some(evicted) => {
                    entries.index.remove(&evicted.hash);
                }
                None => break,
            }
        }
        entries.index.insert(hash.clone());
        entries.order.push_back(DedupEntry {
            hash,
            first_seen_at: now,
        });
        false
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        self.entries.lock().purge(now, self.chrono_window())
    }

    pub fn stats(&self) -> DedupStats {
        let entries = self.entries.lock().order.len();
        DedupStats {
            entries,
            suppressed: self.suppressed.load(Ordering::Relaxed),
            capacity: self.capacity,
            window_ms: duration_ms(self.window),
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.order.clear();
        entries.index.clear();
        self.suppressed.store(0, Ordering::Relaxed);
    }
}

/// Rebuild `value` with object keys in sorted order and volatile keys
/// removed at every depth.
fn canonicalize(value: &Value, volatile: &HashSet<String>) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().filter(|k| !volatile.contains(*k)).collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key], volatile));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| canonicalize(item, volatile))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn setup(config: DedupConfig) -> (Arc<ManualClock>, EventDeduplicator) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let dedup = EventDeduplicator::new(&config, clock.clone());
        (clock, dedup)
    }

    #[test]
    fn test_duplicate_within_window_then_expires() {
        let (clock, dedup) = setup(DedupConfig::default());
        let first = json!({"user": "bob", "gift": "rose", "count": 1, "timestamp": 1});
        let replay = json!({"count": 1, "gift": "rose", "user": "bob", "timestamp": 2});

        assert!(!dedup.is_duplicate("gift", &first));
        assert!(dedup.is_duplicate("gift", &replay));

        clock.advance(chrono::Duration::seconds(61));
        assert!(!dedup.is_duplicate("gift", &replay));
        assert_eq!(dedup.stats().suppressed, 1);
    }

    #[test]
    fn test_kind_is_part_of_signature() {
        let (_clock, dedup) = setup(DedupConfig::default());
        let payload = json!({"user": "bob"});
        assert!(!dedup.is_duplicate("follow", &payload));
        assert!(!dedup.is_duplicate("share", &payload));
        assert!(dedup.is_duplicate("follow", &payload));
    }

    #[test]
    fn test_nested_volatile_fields_are_ignored() {
        let (_clock, dedup) = setup(DedupConfig::default());
        let a = json!({"msg": {"text": "hi", "receivedAt": 10}, "user": {"id": 1}});
        let b = json!({"user": {"id": 1}, "msg": {"receivedAt": 99, "text": "hi"}});
        assert_eq!(dedup.signature("chat", &a), dedup.signature("chat", &b));

        let c = json!({"user": {"id": 1}, "msg": {"text": "hello"}});
        assert_ne!(dedup.signature("chat", &a), dedup.signature("chat", &c));
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let (_clock, dedup) = setup(DedupConfig {
            capacity: 3,
            ..Default::default()
        });
        for i in 0..4 {
            assert!(!dedup.is_duplicate("chat", &json!({"n": i})));
        }
        assert_eq!(dedup.stats().entries, 3);
        // n=0 was evicted even though it has not expired.
        assert!(!dedup.is_duplicate("chat", &json!({"n": 0})));
        assert!(dedup.is_duplicate("chat", &json!({"n": 3})));
    }

    #[test]
    fn test_purge_and_clear() {
        let (clock, dedup) = setup(DedupConfig::default());
        dedup.is_duplicate("chat", &json!({"n": 1}));
        clock.advance(chrono::Duration::seconds(30));
        dedup.is_duplicate("chat", &json!({"n": 2}));
        clock.advance(chrono::Duration::seconds(30));

        assert_eq!(dedup.purge_expired(), 1);
        assert_eq!(dedup.stats().entries, 1);

        dedup.is_duplicate("chat", &json!({"n": 2}));
        dedup.clear();
        let stats = dedup.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.suppressed, 0);
    }
}
