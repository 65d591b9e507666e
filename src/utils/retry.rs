//! Retry pacing with exponential backoff
//!
//! This module computes how long to wait before retrying a transient
//! failure, using exponential backoff with symmetric jitter to prevent
//! thundering herd problems. It knows nothing about credentials: rotation
//! and backoff are composed by the request executor.

use rand::Rng;
use std::time::Duration;

/// Configuration for backoff between retries of the same request
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,

    /// Maximum delay between retries (caps exponential growth, before jitter)
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,

    /// Jitter as a fraction of the delay, applied in both directions
    pub jitter_fraction: f64,

    /// Number of retries allowed; `next_delay` is exhausted past this
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.2,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set delay before the first retry
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set jitter fraction (0.0 disables jitter). Values outside `[0.0, 1.0]`
    /// are clamped when delays are computed; non-finite values disable jitter.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// Set maximum retry attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Un-jittered delay for retry `attempt` (1-indexed), capped at `max_delay`
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64(self.raw_secs(attempt))
    }

    /// Delay before retry `attempt` (1-indexed), or `None` once the retry
    /// budget is exhausted
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    /// Same as [`next_delay`](Self::next_delay) with a caller-provided RNG
    pub fn next_delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let raw = self.raw_secs(attempt);
        let fraction = if self.jitter_fraction.is_finite() {
            self.jitter_fraction.abs().min(1.0)
        } else {
            0.0
        };
        let jitter = if fraction > 0.0 && raw > 0.0 {
            raw * rng.gen_range(-fraction..=fraction)
        } else {
            0.0
        };

        Some(Duration::from_secs_f64((raw + jitter).max(0.0)))
    }

    fn raw_secs(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_secs = self.max_delay.as_secs_f64();
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if secs.is_finite() {
            secs.clamp(0.0, max_secs)
        } else {
            max_secs
        }
    }
}

/// Backoff presets for different use cases
pub mod presets {
    use super::*;

    /// Fail on the first transient error
    pub fn no_retry() -> BackoffPolicy {
        BackoffPolicy::new().with_max_attempts(0)
    }
}
