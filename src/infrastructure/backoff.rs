//! Backoff schedules for queue retries and channel subscription retries.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

/// Exponential backoff calculator.
///
/// The delay for attempt `k` (1-based) is `initial_delay * multiplier^(k-1)`,
/// capped at `max_delay_ms`, with optional symmetric jitter applied last.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with default configuration
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    /// Create a new exponential backoff with custom configuration
    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay to wait after the given attempt failed.
    ///
    /// Attempt `0` is treated as the first attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let final_delay = if jitter_range > 0.0 {
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (capped_delay + jitter).max(1.0)
        } else {
            capped_delay.max(0.0)
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear backoff: attempt `k` waits `step * k`.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    step: Duration,
}

impl LinearBackoff {
    pub fn new(step: Duration) -> Self {
        Self { step }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt.max(1))
    }
}
