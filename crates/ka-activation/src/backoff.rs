//! Exponential backoff for the bounded retries in token capture, validation and
//! redemption.

use ka_config::RetryConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, config: &RetryConfig) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    pub fn validation(config: &RetryConfig) -> Self {
        Self::new(config.validation_max_attempts, config)
    }

    pub fn redemption(config: &RetryConfig) -> Self {
        Self::new(config.redemption_max_attempts, config)
    }

    /// Whether another attempt fits in the budget after `attempts_made`.
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Sleep before the next attempt, after `attempts_made` (>= 1) failures:
    /// `base * 2^(n-1)`, capped at `max_delay`, plus up to 25% jitter.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() as u64 / 4).max(1);
        let jitter = rand::rng().random_range(0..=spread);
        (delay + Duration::from_millis(jitter)).min(self.max_delay)
    }
}
