//! Stream start anchoring.
//!
//! Keeps the best-known wall-clock start of the broadcast so events can be
//! tagged with an elapsed offset that stays consistent across reconnects and
//! restarts. Sources rank SessionMetadata > EarliestEvent > ConnectFallback;
//! a lower-ranked source never replaces a higher-ranked one.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::AnchorConfig;
use crate::error::Result;
use crate::store::StateStore;

/// Store key for the persisted anchor.
pub const ANCHOR_STORE_KEY: &str = "stream_anchor";

/// Numeric timestamps at or above this are milliseconds.
const MILLIS_THRESHOLD: f64 = 1e11;

/// Where an anchor came from, in increasing order of authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorSource {
    /// Handshake time, used when nothing better is known.
    ConnectFallback,
    /// Earliest plausible event timestamp seen so far.
    EarliestEvent,
    /// Start time reported by the platform.
    SessionMetadata,
}

impl fmt::Display for AnchorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AnchorSource::ConnectFallback => "connect_fallback",
            AnchorSource::EarliestEvent => "earliest_event",
            AnchorSource::SessionMetadata => "session_metadata",
        })
    }
}

/// Best-known broadcast start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAnchor {
    pub start_time: DateTime<Utc>,
    pub source: AnchorSource,
    /// Whether this value is known to be in the store.
    #[serde(default)]
    pub persisted: bool,
}

impl StreamAnchor {
    pub fn new(start_time: DateTime<Utc>, source: AnchorSource) -> Self {
        Self {
            start_time,
            source,
            persisted: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedAnchor {
    target: String,
    anchor: StreamAnchor,
}

#[derive(Debug, Default)]
struct AnchorState {
    target: Option<String>,
    anchor: Option<StreamAnchor>,
    connected_at: Option<DateTime<Utc>>,
}

/// Derives, holds and persists the stream anchor for one target.
pub struct StreamClockAnchor {
    state: Mutex<AnchorState>,
    candidate_fields: Vec<String>,
    sanity_floor: DateTime<Utc>,
    clock: SharedClock,
    store: Option<Arc<dyn StateStore>>,
}

impl fmt::Debug for StreamClockAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamClockAnchor")
            .field("target", &state.target)
            .field("anchor", &state.anchor)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl StreamClockAnchor {
    pub fn new(config: &AnchorConfig, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(AnchorState::default()),
            candidate_fields: config.candidate_fields.clone(),
            sanity_floor: config.sanity_floor,
            clock,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Associate the anchor with `target`. Switching targets drops the
    /// current anchor. Returns `true` when that happened.
    pub fn bind(&self, target: &str) -> bool {
        let mut state = self.state.lock();
        if state.target.as_deref() == Some(target) {
            return false;
        }
        let had_anchor = state.anchor.is_some();
        state.target = Some(target.to_string());
        state.anchor = None;
        state.connected_at = None;
        if had_anchor {
            debug!(target, "Anchor reset for new target");
        }
        had_anchor
    }

    pub fn target(&self) -> Option<String> {
        self.state.lock().target.clone()
    }

    /// Record the handshake time used by the connect fallback.
    pub fn mark_connected(&self, at: DateTime<Utc>) {
        self.state.lock().connected_at = Some(at);
    }

    pub fn anchor(&self) -> Option<StreamAnchor> {
        self.state.lock().anchor.clone()
    }

    /// Whether `ts` is a believable broadcast time right now.
    pub fn is_plausible(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.sanity_floor && ts <= self.clock.now()
    }

    /// Look for a start time in session metadata. Returns the anchor after
    /// the observation.
    pub fn observe(&self, metadata: &Value) -> Option<StreamAnchor> {
        let found = self.candidate_fields.iter().find_map(|pointer| {
            let ts = metadata.pointer(pointer).and_then(parse_timestamp)?;
            self.is_plausible(ts).then_some((pointer, ts))
        });

        let mut state = self.state.lock();
        if let Some((pointer, ts)) = found {
            // The first metadata anchor holds for the whole target.
            let changed = state
                .anchor
                .as_ref()
                .is_none_or(|current| current.source < AnchorSource::SessionMetadata);
            if changed {
                info!(field = %pointer, start_time = %ts, "Stream anchor from session metadata");
                state.anchor = Some(StreamAnchor::new(ts, AnchorSource::SessionMetadata));
            }
        }
        state.anchor.clone()
    }

    /// Feed an event timestamp. Returns the anchor after the observation.
    pub fn observe_event(&self, ts: Option<DateTime<Utc>>) -> Option<StreamAnchor> {
        let ts = ts.filter(|ts| self.is_plausible(*ts));
        let now = self.clock.now();

        let mut state = self.state.lock();
        match (ts, state.anchor.as_ref()) {
            (Some(ts), None) => {
                state.anchor = Some(StreamAnchor::new(ts, AnchorSource::EarliestEvent));
            }
            (Some(ts), Some(current)) => {
                let replace = match current.source {
                    AnchorSource::SessionMetadata => false,
                    AnchorSource::EarliestEvent => ts < current.start_time,
                    AnchorSource::ConnectFallback => true,
                };
                if replace {
                    debug!(start_time = %ts, "Stream anchor moved to earlier event");
                    state.anchor = Some(StreamAnchor::new(ts, AnchorSource::EarliestEvent));
                }
            }
            (None, None) => {
                let at = state.connected_at.unwrap_or(now);
                debug!(start_time = %at, "Stream anchor falls back to connect time");
                state.anchor = Some(StreamAnchor::new(at, AnchorSource::ConnectFallback));
            }
            (None, Some(_)) => {}
        }
        state.anchor.clone()
    }

    /// Time since the anchor, or `None` when no anchor is known.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let anchor = self.state.lock().anchor.as_ref()?.start_time;
        Some((now - anchor).max(chrono::Duration::zero()))
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        self.elapsed(now)
            .map(|d| u64::try_from(d.num_milliseconds()).unwrap_or(0))
    }

    /// Forget the anchor, in memory and in the store.
    pub async fn reset(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.anchor = None;
            state.connected_at = None;
        }
        if let Some(store) = &self.store {
            store.remove(ANCHOR_STORE_KEY).await?;
        }
        Ok(())
    }

    /// Write the current anchor and target to the store. No-op without a
    /// store, target or anchor.
    pub async fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let record = {
            let state = self.state.lock();
            match (&state.target, &state.anchor) {
                (Some(target), Some(anchor)) => PersistedAnchor {
                    target: target.clone(),
                    anchor: StreamAnchor {
                        persisted: true,
                        ..anchor.clone()
                    },
                },
                _ => return Ok(()),
            }
        };

        store
            .save(ANCHOR_STORE_KEY, serde_json::to_value(&record)?)
            .await?;

        let mut state = self.state.lock();
        if let Some(anchor) = state.anchor.as_mut()
            && anchor.start_time == record.anchor.start_time
            && anchor.source == record.anchor.source
        {
            anchor.persisted = true;
        }
        Ok(())
    }

    /// Bind to `target` and load its persisted anchor, if one was recorded
    /// for the same target and is still plausible.
    pub async fn restore(&self, target: &str) -> Result<Option<StreamAnchor>> {
        self.bind(target);
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(value) = store.load(ANCHOR_STORE_KEY).await? else {
            return Ok(None);
        };

        let record: PersistedAnchor = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, "Ignoring unreadable persisted anchor");
                return Ok(None);
            }
        };
        if record.target != target || !self.is_plausible(record.anchor.start_time) {
            return Ok(None);
        }

        let restored = StreamAnchor {
            persisted: true,
            ..record.anchor
        };
        let mut state = self.state.lock();
        if state.target.as_deref() != Some(target) {
            return Ok(None);
        }
        let keep_current = state
            .anchor
            .as_ref()
            .is_some_and(|current| current.source > restored.source);
        if !keep_current {
            info!(target, start_time = %restored.start_time, source = %restored.source, "Restored stream anchor");
            state.anchor = Some(restored);
        }
        Ok(state.anchor.clone())
    }
}

/// Parse a platform timestamp: seconds or milliseconds since the epoch (as a
/// number or numeric string), or an RFC 3339 string.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => from_epoch_number(n.as_f64()?),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<f64>() {
                return from_epoch_number(n);
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    }
}

fn from_epoch_number(n: f64) -> Option<DateTime<Utc>> {
    if !n.is_finite() || n <= 0.0 {
        return None;
    }
    let millis = if n >= MILLIS_THRESHOLD { n } else { n * 1000.0 };
    if millis > i64::MAX as f64 {
        return None;
    }
    Utc.timestamp_millis_opt(millis as i64).single()
}
