use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Settings for copying archives out of helper pods.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Name or path of the `kubectl` binary used for `kubectl cp`.
    pub kubectl_binary: String,
    /// Upper bound for a single copy.
    pub copy_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            kubectl_binary: "kubectl".to_owned(),
            copy_timeout_secs: 1_800,
        }
    }
}

impl TransferConfig {
    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.kubectl_binary.trim().is_empty() {
            return Err(ValidationError::EmptyPath("transfer.kubectl_binary"));
        }
        if self.copy_timeout_secs == 0 {
            return Err(ValidationError::ZeroDuration("transfer.copy_timeout_secs"));
        }

        Ok(())
    }
}
