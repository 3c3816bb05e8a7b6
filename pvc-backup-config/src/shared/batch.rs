use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// How a batch of volume backups is scheduled.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BatchConfig {
    /// Maximum number of backup attempts in flight at once. `1` processes
    /// volumes sequentially.
    pub max_concurrency: usize,
    /// Overall time budget for a batch. Attempts still running when it expires
    /// are cancelled and cleaned up.
    pub timeout_secs: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            timeout_secs: None,
        }
    }
}

impl BatchConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_concurrency == 0 {
            return Err(ValidationError::ZeroConcurrency);
        }
        if self.timeout_secs == Some(0) {
            return Err(ValidationError::ZeroDuration("batch.timeout_secs"));
        }

        Ok(())
    }
}
