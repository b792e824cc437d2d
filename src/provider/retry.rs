// src/provider/retry.rs — Exponential backoff between same-tier attempts
//
// The router owns the retry loop; this module only decides how long to wait.
// Rate limits honour the server's retry-after; everything else backs off
// exponentially with deterministic jitter so tests stay reproducible.

use std::time::Duration;

use crate::infra::config::RouterConfig;
use crate::infra::errors::ProviderError;

const BACKOFF_FACTOR: f64 = 2.0;
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8_000),
            backoff_factor: BACKOFF_FACTOR,
            jitter_fraction: JITTER_FRACTION,
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            ..Self::default()
        }
    }

    /// No waiting at all; used by tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed) after `error`.
    pub fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        if self.max_delay.is_zero() {
            return Duration::ZERO;
        }
        if let ProviderError::RateLimit { retry_after_ms } = error {
            if *retry_after_ms > 0 {
                return Duration::from_millis(*retry_after_ms) + Duration::from_millis(100);
            }
        }

        let base_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);
        let jitter = deterministic_jitter(attempt, self.jitter_fraction);
        Duration::from_millis((capped_ms * jitter) as u64)
    }
}

/// Multiplier in [1 - fraction, 1 + fraction], stable per attempt.
fn deterministic_jitter(attempt: u32, fraction: f64) -> f64 {
    let hash = (attempt.wrapping_mul(2654435761)) as f64 / u32::MAX as f64;
    1.0 + fraction * (2.0 * hash - 1.0)
}
