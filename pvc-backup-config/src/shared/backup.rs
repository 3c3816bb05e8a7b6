use std::path::PathBuf;

use serde::Deserialize;

use crate::Config;
use crate::shared::{
    AuthConfig, BatchConfig, DestinationConfig, DiscoveryConfig, HelperConfig, TransferConfig,
    ValidationError,
};

/// Complete configuration for a backup run.
///
/// Every field has a documented default so the tool runs with no
/// configuration at all. The loaded value is treated as immutable for the
/// duration of a run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory receiving the archives copied out of helper pods.
    pub backup_dir: PathBuf,
    /// SQLite file holding the backup history.
    pub metadata_db_path: PathBuf,
    /// Number of entries shown by history listings.
    pub history_limit: usize,
    pub auth: AuthConfig,
    pub helper: HelperConfig,
    pub discovery: DiscoveryConfig,
    pub transfer: TransferConfig,
    pub batch: BatchConfig,
    pub destination: DestinationConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("./backups"),
            metadata_db_path: PathBuf::from("./data/backups.db"),
            history_limit: 50,
            auth: AuthConfig::default(),
            helper: HelperConfig::default(),
            discovery: DiscoveryConfig::default(),
            transfer: TransferConfig::default(),
            batch: BatchConfig::default(),
            destination: DestinationConfig::default(),
        }
    }
}

impl Config for BackupConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

impl BackupConfig {
    /// Validates every section of the configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.backup_dir.as_os_str().is_empty() {
            return Err(ValidationError::EmptyPath("backup_dir"));
        }
        if self.metadata_db_path.as_os_str().is_empty() {
            return Err(ValidationError::EmptyPath("metadata_db_path"));
        }

        self.auth.validate()?;
        self.helper.validate()?;
        self.discovery.validate()?;
        self.transfer.validate()?;
        self.batch.validate()?;
        self.destination.validate()
    }
}
