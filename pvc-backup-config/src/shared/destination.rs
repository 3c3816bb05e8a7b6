use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigSecret;
use crate::shared::ValidationError;

/// Where finished archives end up.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationConfig {
    /// Archives stay in the local backup directory.
    #[default]
    Local,
    /// Archives are pushed to a remote host after the local checksum succeeds.
    Remote(RemoteDestinationConfig),
}

impl DestinationConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            DestinationConfig::Local => Ok(()),
            DestinationConfig::Remote(remote) => remote.validate(),
        }
    }
}

/// Transfer protocol used for remote pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProtocol {
    Scp,
    Rsync,
}

impl fmt::Display for RemoteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteProtocol::Scp => f.write_str("scp"),
            RemoteProtocol::Rsync => f.write_str("rsync"),
        }
    }
}

/// Connection details for a remote archive destination.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDestinationConfig {
    pub protocol: RemoteProtocol,
    /// IP address or hostname of the remote host.
    pub host: String,
    /// SSH port. Uses the client default when unset.
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    /// Password handed to `sshpass` through its environment.
    pub password: ConfigSecret,
    /// Directory on the remote host; created if missing.
    pub directory: String,
    /// Keep the local archive after a successful upload.
    #[serde(default)]
    pub keep_local_copy: bool,
    /// Upper bound for one upload, including directory creation.
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_upload_timeout_secs() -> u64 {
    1_800
}

impl RemoteDestinationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::MissingRemoteField("host"));
        }
        if self.username.trim().is_empty() {
            return Err(ValidationError::MissingRemoteField("username"));
        }
        if self.password.is_empty() {
            return Err(ValidationError::MissingRemoteField("password"));
        }
        if self.directory.trim().is_empty() {
            return Err(ValidationError::MissingRemoteField("directory"));
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::ZeroDuration("destination.timeout_secs"));
        }

        Ok(())
    }
}
