//! Exponential reconnect backoff with jitter.
//!
//! `delay(attempt) = min(base * 2^attempt, max) * jitter` with a zero-based
//! `attempt` and `jitter` drawn uniformly from the configured range.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Computes reconnect delays; holds no per-episode state.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub config: ReconnectConfig,
}

impl BackoffPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Delay before the zero-based `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(63) as i32);
        let raw = self.config.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.config.max_delay.as_secs_f64()))
    }

    /// Delay before the zero-based `attempt`, jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt).mul_f64(self.jitter())
    }

    /// Returns `true` if `attempt` (zero-based) is still allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.config.max_attempts <= 0 || attempt < self.config.max_attempts as u32
    }

    fn jitter(&self) -> f64 {
        let (lo, hi) = self.config.jitter_range;
        if lo >= hi {
            return lo;
        }
        rand::rng().random_range(lo..=hi)
    }
}
