//! Exponential backoff policy.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest fraction of the computed delay added as jitter.
pub const JITTER_RATIO: f64 = 0.1;

/// Exponential backoff configuration.
///
/// The delay before retry `n` (1-based) is
/// `min(initial_delay * multiplier^(n-1), max_delay)`, plus up to 10% uniform
/// random jitter when enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Add random jitter to spread out synchronized retries.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Creates an exponential policy without jitter.
    pub fn exponential(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            multiplier,
            jitter: false,
        }
    }

    /// Creates a policy that waits the same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        Self::exponential(delay, delay, 1.0)
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the capped delay for an attempt in milliseconds, before jitter.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);

        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            (raw.max(0.0) as u64).min(self.max_delay_ms)
        }
    }

    /// Calculates the delay for an attempt using the given random source.
    ///
    /// Deterministic for a seeded generator.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_ms(attempt);

        let jitter = if self.jitter && base > 0 {
            (base as f64 * JITTER_RATIO * rng.random::<f64>()) as u64
        } else {
            0
        };

        Duration::from_millis(base.saturating_add(jitter))
    }

    /// Calculates the delay for an attempt using the thread-local generator.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }
}
