use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Limits applied to volume discovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Overall time budget for one discovery call.
    pub timeout_secs: u64,
    /// Maximum number of namespaces a single discovery call may scan.
    pub max_namespace_scan: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_namespace_scan: 100,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.timeout_secs == 0 {
            return Err(ValidationError::ZeroDuration("discovery.timeout_secs"));
        }
        if self.max_namespace_scan == 0 {
            return Err(ValidationError::ZeroNamespaceScan);
        }

        Ok(())
    }
}
