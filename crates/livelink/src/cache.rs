//! Resolved session cache.
//!
//! Thread-safe, TTL-bounded cache of handle -> [`ResolvedSession`], measured
//! from each session's `resolved_at`. Optionally persisted through a
//! [`StateStore`] so a restart does not have to re-resolve.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::classifier::duration_ms;
use crate::clock::{SharedClock, system_clock};
use crate::error::Result;
use crate::resolver::ResolvedSession;
use crate::store::StateStore;

/// Default TTL for cached sessions (5 minutes).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// Store key for the persisted cache.
pub const CACHE_STORE_KEY: &str = "session_cache";

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub ttl_ms: u64,
}

/// TTL cache of resolved sessions keyed by user handle.
#[derive(Clone)]
pub struct SessionCache {
    entries: Arc<DashMap<String, ResolvedSession>>,
    clock: SharedClock,
    ttl: Duration,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    store: Option<Arc<dyn StateStore>>,
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl SessionCache {
    /// Create a cache with the default TTL.
    pub fn new(clock: SharedClock) -> Self {
        Self::with_ttl(clock, DEFAULT_SESSION_TTL)
    }

    pub fn with_ttl(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
            ttl,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            store: None,
        }
    }

    /// Attach a store used by [`persist`](Self::persist) and [`restore`](Self::restore).
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current time on the cache's clock.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    fn is_expired(&self, session: &ResolvedSession) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        match session.resolved_at.checked_add_signed(ttl) {
            Some(deadline) => self.clock.now() >= deadline,
            None => false,
        }
    }

    /// Get a live session. Expired entries are removed and reported as a miss.
    pub fn get(&self, handle: &str) -> Option<ResolvedSession> {
        let Some(entry) = self.entries.get(handle) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if self.is_expired(entry.value()) {
            drop(entry); // Release the shard lock before removing
            self.entries
                .remove_if(handle, |_, session| self.is_expired(session));
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(handle, "Cached session expired");
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value().clone())
    }

    pub fn put(&self, handle: impl Into<String>, session: ResolvedSession) {
        self.entries.insert(handle.into(), session);
    }

    /// Invalidate one handle, or everything with `None`.
    pub fn invalidate(&self, handle: Option<&str>) {
        match handle {
            Some(handle) => {
                self.entries.remove(handle);
            }
            None => self.entries.clear(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all expired entries. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        // Collect first: removing while iterating a DashMap can deadlock.
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| self.is_expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for handle in expired {
            if self
                .entries
                .remove_if(&handle, |_, session| self.is_expired(session))
                .is_some()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Removed expired cached sessions");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ttl_ms: duration_ms(self.ttl),
        }
    }

    /// Write the live entries to the attached store. No-op without a store.
    pub async fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let snapshot: BTreeMap<String, ResolvedSession> = self
            .entries
            .iter()
            .filter(|entry| !self.is_expired(entry.value()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let count = snapshot.len();
        store
            .save(CACHE_STORE_KEY, serde_json::to_value(snapshot)?)
            .await?;
        debug!(count, "Persisted session cache");
        Ok(())
    }

    /// Load entries from the attached store, dropping expired ones.
    /// Returns how many entries were restored.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let Some(value) = store.load(CACHE_STORE_KEY).await? else {
            return Ok(0);
        };

        let snapshot: BTreeMap<String, ResolvedSession> = serde_json::from_value(value)?;
        let mut restored = 0;
        for (handle, session) in snapshot {
            if self.is_expired(&session) {
                continue;
            }
            self.entries.insert(handle, session);
            restored += 1;
        }
        debug!(restored, "Restored session cache");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn setup() -> (Arc<ManualClock>, SessionCache) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let cache = SessionCache::new(clock.clone());
        (clock, cache)
    }

    fn session(clock: &ManualClock, id: &str) -> ResolvedSession {
        ResolvedSession::new(id, "test", clock.now(), DEFAULT_SESSION_TTL, serde_json::Value::Null)
    }

    #[test]
    fn test_get_and_expiry() {
        let (clock, cache) = setup();
        cache.put("alice", session(&clock, "room-1"));

        assert_eq!(cache.get("alice").unwrap().identifier, "room-1");

        clock.advance(chrono::Duration::seconds(299));
        assert!(cache.get("alice").is_some());

        clock.advance(chrono::Duration::seconds(1));
        assert!(cache.get("alice").is_none());
        assert!(cache.is_empty(), "expired entry should be removed on read");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_invalidate() {
        let (clock, cache) = setup();
        cache.put("alice", session(&clock, "1"));
        cache.put("bob", session(&clock, "2"));

        cache.invalidate(Some("alice"));
        assert!(cache.get("alice").is_none());
        assert!(cache.get("bob").is_some());

        cache.invalidate(None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cleanup_expired() {
        let (clock, cache) = setup();
        cache.put("old", session(&clock, "1"));
        clock.advance(chrono::Duration::minutes(3));
        cache.put("new", session(&clock, "2"));
        clock.advance(chrono::Duration::minutes(3));

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("new").is_some());
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let (clock, cache) = setup();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let cache = cache.with_store(store.clone());

        cache.put("alice", session(&clock, "1"));
        clock.advance(chrono::Duration::minutes(4));
        cache.put("bob", session(&clock, "2"));
        cache.persist().await.unwrap();

        let restored = SessionCache::new(clock.clone()).with_store(store);
        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(restored.restore().await.unwrap(), 1);
        assert!(restored.get("alice").is_none());
        assert_eq!(restored.get("bob").unwrap().identifier, "2");
    }
}
