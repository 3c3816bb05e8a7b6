use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Retry policy for transient helper pod start-up failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of create-through-wait attempts, including the first one.
    pub max_attempts: u32,
    /// Delay, in milliseconds, before the first retry.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries.
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier applied to the delay after each attempt.
    pub backoff_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Returns the delay to wait before retry number `retry` (starting at 1).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let delay = self.initial_delay_ms as f64 * (self.backoff_factor as f64).powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);

        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidRetry("`max_attempts` must be at least 1"));
        }
        if self.backoff_factor < 1.0 {
            return Err(ValidationError::InvalidRetry("`backoff_factor` must be at least 1.0"));
        }

        Ok(())
    }
}
