// Retry scheduling: bounded exponential backoff with jitter.
//
// Callers keep their own attempt counters; the policy only answers "how long"
// and "whether".

use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::classifier::{ErrorClassification, duration_ms};
use crate::error::{LinkError, Result};

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry. Actual delay = base * 2^attempt ± jitter.
    pub base_delay_ms: u64,
    /// Hard cap on any computed delay.
    pub max_delay_ms: u64,
    /// Attempts allowed per logical operation.
    pub max_attempts: u32,
    /// Symmetric jitter as a fraction of the computed delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Same policy without jitter, for deterministic schedules.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// Unjittered delay for `attempt` (0-indexed): `min(max, base * 2^attempt)`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        // 2^attempt through a checked shift so large attempts saturate.
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(multiplier)
                .min(self.max_delay_ms),
        )
    }

    /// Delay before retry number `attempt`, jittered and clamped to `[0, max]`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || nominal.is_zero() {
            return nominal;
        }

        let nominal_ms = duration_ms(nominal) as f64;
        let offset = rand::rng().random_range(-ratio..=ratio) * nominal_ms;
        let jittered = (nominal_ms + offset).clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(jittered.round() as u64)
    }

    /// Whether another attempt should be made after `attempt` failures.
    pub fn should_retry(&self, attempt: u32, classification: &ErrorClassification) -> bool {
        attempt < self.max_attempts && classification.retryable
    }

    /// Backoff delay honouring any wait suggested by the classification.
    pub fn delay_for(&self, attempt: u32, classification: &ErrorClassification) -> Duration {
        let delay = self.next_delay(attempt);
        match classification.suggested_wait() {
            Some(wait) => delay.max(wait),
            None => delay,
        }
    }
}

/// Sleep for `delay` unless `token` is cancelled first.
pub async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(LinkError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
