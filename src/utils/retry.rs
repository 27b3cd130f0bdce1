use rand::{thread_rng, Rng};
use std::time::Duration;

use crate::cli::config::RetrySettings;

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    attempts: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
            max: max.max(base),
        }
    }

    /// Backoff for one retry budget out of the shared retry settings
    pub fn from_settings(attempts: u32, settings: &RetrySettings) -> Self {
        Self::new(
            attempts,
            Duration::from_millis(settings.backoff_base_ms),
            Duration::from_millis(settings.backoff_max_ms),
        )
    }

    /// Total attempts, including the first one
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before retry number `attempt` (1-based count of failures so far)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self.base.saturating_mul(1u32 << exponent).min(self.max);

        // Full jitter on the upper half keeps retries from concurrent tasks apart
        let half = ceiling / 2;
        let jitter_ms = half.as_millis() as u64;
        if jitter_ms == 0 {
            return ceiling;
        }
        half + Duration::from_millis(thread_rng().gen_range(0..=jitter_ms))
    }

    /// Sleep before the next attempt
    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.delay(attempt)).await;
    }
}
