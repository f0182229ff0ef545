//! Exponential backoff with a cap and optional jitter.

use std::time::Duration;

use rand::Rng;

/// Largest exponent applied; keeps the multiplier from overflowing
const MAX_EXPONENT: u32 = 16;

/// Backoff schedule shared by feed reconnects and delivery retries
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Cap on the exponential part
    pub max: Duration,
    /// Adds up to `jitter_fraction * delay` of random extra wait (0.0 = none)
    pub jitter_fraction: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter_fraction: 0.0,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter_fraction: 0.0,
        }
    }

    /// Set the jitter fraction, clamped to [0, 1]
    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = if jitter_fraction.is_finite() {
            jitter_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// `initial * 2^attempt`, capped at `max`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.pow(attempt.min(MAX_EXPONENT));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Delay before retry number `attempt` (0-based), jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_fraction <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(0.0..=self.jitter_fraction);
        base + base.mul_f64(spread)
    }
}
