use pvc_backup_config::load_config;
use pvc_backup_config::shared::BackupConfig;

/// Loads the [`BackupConfig`] and validates it.
pub fn load_backup_config() -> anyhow::Result<BackupConfig> {
    let config = load_config::<BackupConfig>()?;
    config.validate()?;

    Ok(config)
}
