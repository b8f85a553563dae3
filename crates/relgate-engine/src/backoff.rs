//! Exponential backoff with a ceiling and optional jitter.
//!
//! Used for HTTP rule retries (no jitter) and for background processing
//! retries (with jitter so that restarted workers do not retry in lockstep).

use std::time::Duration;

use rand::Rng;

/// Delay schedule: `min * 2^retry`, clamped to `max`, plus up to `jitter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        let base = self.min.checked_mul(factor).unwrap_or(self.max).min(self.max);
        base + self.random_jitter()
    }

    fn random_jitter(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
