use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::{RetryConfig, ValidationError};

/// Settings for the short-lived helper pod that archives a volume.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Container image for the helper. Must provide `sh` and `tar`.
    pub image: String,
    /// How long to wait for the helper pod to become ready, per start-up attempt.
    pub ready_timeout_secs: u64,
    /// Interval between readiness polls.
    pub poll_interval_ms: u64,
    /// Upper bound for the in-pod archive command.
    pub exec_timeout_secs: u64,
    /// Upper bound for deleting the helper pod.
    pub cleanup_timeout_secs: u64,
    /// Retry policy for transient start-up failures.
    pub startup_retry: RetryConfig,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            image: "alpine:3.20".to_owned(),
            ready_timeout_secs: 120,
            poll_interval_ms: 2_000,
            exec_timeout_secs: 1_800,
            cleanup_timeout_secs: 30,
            startup_retry: RetryConfig::default(),
        }
    }
}

impl HelperConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.image.trim().is_empty() {
            return Err(ValidationError::EmptyHelperImage);
        }
        for (name, value) in [
            ("helper.ready_timeout_secs", self.ready_timeout_secs),
            ("helper.poll_interval_ms", self.poll_interval_ms),
            ("helper.exec_timeout_secs", self.exec_timeout_secs),
            ("helper.cleanup_timeout_secs", self.cleanup_timeout_secs),
        ] {
            if value == 0 {
                return Err(ValidationError::ZeroDuration(name));
            }
        }

        self.startup_retry.validate()
    }
}
