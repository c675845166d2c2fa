//! Redelivery contract shared with the queue provider.
//!
//! The provider owns redelivery, so the only knob we control is how many retries we ask for. The
//! schedule below is what operators should expect to see on the provider side; it is also used to
//! compute the `Upstash-Retries` header on publish.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first redelivery.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound on any single redelivery delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    /// Number of retries requested from the provider (attempts after the first).
    pub fn provider_retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Delay before redelivery number `attempt` (1-based). Doubles each time, capped at
    /// `max_backoff`. Returns `None` once the attempt budget is exhausted.
    pub fn backoff_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.provider_retries() {
            return None;
        }

        let exp = attempt - 1;
        let multiplier = 1_u32.checked_shl(exp).unwrap_or(u32::MAX);
        let delay = self.initial_backoff.saturating_mul(multiplier);
        Some(delay.min(self.max_backoff))
    }

    /// The full redelivery schedule, one entry per retry.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.provider_retries()).filter_map(|attempt| self.backoff_for(attempt)).collect()
    }
}
