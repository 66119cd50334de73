//! Background cleanup of expired cache and dedup entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::SessionCache;
use crate::dedup::EventDeduplicator;

/// Entries removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cache_removed: usize,
    pub dedup_removed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.cache_removed + self.dedup_removed
    }
}

/// Purges expired entries on a fixed interval.
#[derive(Debug, Clone)]
pub struct Sweeper {
    cache: SessionCache,
    dedup: Arc<EventDeduplicator>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(cache: SessionCache, dedup: Arc<EventDeduplicator>, interval: Duration) -> Self {
        Self {
            cache,
            dedup,
            interval,
        }
    }

    /// Run one pass. Locks are only held inside the purge calls.
    pub fn sweep(&self) -> SweepReport {
        SweepReport {
            cache_removed: self.cache.cleanup_expired(),
            dedup_removed: self.dedup.purge_expired(),
        }
    }

    /// Sweep every interval until `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        trace!("Sweeper stopped");
                        break;
                    }

                    _ = interval.tick() => {
                        let report = self.sweep();
                        if report.total() > 0 {
                            debug!(
                                cache_removed = report.cache_removed,
                                dedup_removed = report.dedup_removed,
                                "Swept expired entries"
                            );
                        }
                    }
                }
            }
        })
    }
}
