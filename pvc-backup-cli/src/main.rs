use std::process::ExitCode;

use clap::Parser;
use pvc_backup_config::shared::BackupConfig;
use pvc_backup_telemetry::{TracingOptions, init_tracing};
use tracing::error;

use crate::cli::Cli;
use crate::config::load_backup_config;
use crate::core::run;

mod cli;
mod config;
mod core;

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Load backup config
    let config = load_backup_config()?;

    let _log_flusher = init_tracing(TracingOptions::new(env!("CARGO_BIN_NAME")))?;

    // We start the runtime.
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli, config))
}

async fn async_main(cli: Cli, config: BackupConfig) -> anyhow::Result<ExitCode> {
    match run(cli, config).await {
        Ok(exit_code) => Ok(exit_code),
        Err(err) => {
            error!("pvc-backup failed: {err:#}");
            Err(err)
        }
    }
}
