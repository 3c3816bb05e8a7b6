use std::collections::BTreeSet;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use pvc_backup::auth::{AuthRequest, AuthResolver, CredentialContext, list_context_names};
use pvc_backup::catalog::{DiscoveryScope, VolumeCatalog, VolumeRecord, annotate_last_success};
use pvc_backup::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use pvc_backup::history::{HistoryStore, SqliteHistoryStore};
use pvc_backup::orchestrator::{BackupAttempt, BackupOrchestrator};
use pvc_backup::transfer::KubectlCopyTransport;
use pvc_backup_config::shared::{AuthMode, BackupConfig, DestinationConfig};
use secrecy::SecretString;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use crate::cli::{AuthArgs, BackupArgs, Cli, Command};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Runs the command selected on the command line.
pub async fn run(cli: Cli, config: BackupConfig) -> anyhow::Result<ExitCode> {
    log_config(&config);

    match cli.command {
        Command::Contexts => {
            let path = cli
                .auth
                .kubeconfig
                .as_deref()
                .or(config.auth.kubeconfig_path.as_deref());
            let names = list_context_names(path).map_err(auth_failure)?;
            for name in names {
                println!("{name}");
            }
        }
        Command::Summary => {
            let credentials = authenticate(&cli.auth, &config).await?;
            let summary = catalog(&credentials, &config)
                .summary(config.discovery.timeout())
                .await?;
            println!("namespaces: {}", summary.namespaces);
            println!("pods:       {}", summary.pods);
            println!("claims:     {}", summary.claims);
        }
        Command::Discover { namespaces } => {
            let credentials = authenticate(&cli.auth, &config).await?;
            let history = open_history(&config).await?;

            let mut records = catalog(&credentials, &config)
                .discover(
                    DiscoveryScope::from_filter(&namespaces),
                    config.discovery.timeout(),
                )
                .await?;
            annotate_last_success(&mut records, &history.last_success_map().await?);

            print_volumes(&records);
        }
        Command::Backup(args) => return backup(&cli.auth, args, config).await,
        Command::History { limit } => {
            let history = open_history(&config).await?;
            let records = history.recent(limit.unwrap_or(config.history_limit)).await?;

            for record in records {
                println!(
                    "{}  {}/{}  {}  stage={}  {}",
                    record.timestamp.format(TIMESTAMP_FORMAT),
                    record.namespace,
                    record.claim_name,
                    record.status,
                    record.stage,
                    record.archive_path.as_deref().unwrap_or(&record.message),
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn backup(
    auth: &AuthArgs,
    args: BackupArgs,
    mut config: BackupConfig,
) -> anyhow::Result<ExitCode> {
    let claims = args
        .claims
        .iter()
        .map(|claim| parse_claim(claim))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if !args.all && args.namespaces.is_empty() && claims.is_empty() {
        bail!("nothing to back up: pass --all, --namespace or --claim");
    }
    if let Some(max_concurrency) = args.max_concurrency {
        config.batch.max_concurrency = max_concurrency;
        config.validate()?;
    }

    let credentials = Arc::new(authenticate(auth, &config).await?);

    let scope = if args.all {
        DiscoveryScope::AllNamespaces
    } else {
        let namespaces = args
            .namespaces
            .iter()
            .cloned()
            .chain(claims.iter().map(|(namespace, _)| namespace.clone()));
        DiscoveryScope::from_filter(namespaces)
    };
    let records = catalog(&credentials, &config)
        .discover(scope, config.discovery.timeout())
        .await?;
    let volumes = select_volumes(records, &args.namespaces, &claims, args.all)?;
    if volumes.is_empty() {
        warn!("no claims matched the selection");
        return Ok(ExitCode::SUCCESS);
    }

    let transport = Arc::new(KubectlCopyTransport::new(
        config.transfer.kubectl_binary.clone(),
        credentials.transport().clone(),
    ));
    let history = open_history(&config).await?;
    let orchestrator = BackupOrchestrator::new(credentials, &config, transport, history);

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let shutdown_handle = tokio::spawn(forward_signals(shutdown_tx));

    let attempts = orchestrator.backup_batch(&volumes, shutdown_rx).await;

    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    print_attempts(&attempts);

    if attempts.iter().all(BackupAttempt::is_success) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Triggers shutdown on SIGINT or SIGTERM.
///
/// Attempts in flight fail at their current stage and still delete their
/// helper pods.
async fn forward_signals(shutdown_tx: ShutdownTx) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(error = %err, "failed to register SIGTERM handler, only Ctrl+C stops the batch");
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for Ctrl+C");
                return;
            }
            if let Err(err) = shutdown_tx.shutdown() {
                warn!("failed to send shutdown signal: {:?}", err);
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT (Ctrl+C) received, stopping backups");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, stopping backups");
        }
    }

    if let Err(err) = shutdown_tx.shutdown() {
        warn!("failed to send shutdown signal: {:?}", err);
    }
}

/// Builds the auth request from the command line and the configuration, then
/// resolves it.
async fn authenticate(args: &AuthArgs, config: &BackupConfig) -> anyhow::Result<CredentialContext> {
    let resolver = AuthResolver::new(&config.auth);
    let mode = args.auth_mode.unwrap_or_else(|| resolver.default_mode());

    let mut request = AuthRequest::new(mode);
    request.kubeconfig_path = args.kubeconfig.clone();
    request.context = args.context.clone();
    if mode == AuthMode::PastedKubeconfig {
        let mut content = String::new();
        tokio::io::stdin().read_to_string(&mut content).await?;
        request.kubeconfig_content = Some(SecretString::from(content));
    }

    let credentials = resolver.resolve(request).await.map_err(auth_failure)?;
    info!(mode = %credentials.mode(), "authenticated");

    Ok(credentials)
}

fn auth_failure(err: pvc_backup::auth::AuthError) -> anyhow::Error {
    anyhow!("{err}. {}", err.remediation())
}

fn catalog(credentials: &CredentialContext, config: &BackupConfig) -> VolumeCatalog {
    VolumeCatalog::new(credentials.client(), config.discovery.max_namespace_scan)
}

async fn open_history(config: &BackupConfig) -> anyhow::Result<SqliteHistoryStore> {
    let history = SqliteHistoryStore::connect(&config.metadata_db_path).await?;
    history.initialize().await?;

    Ok(history)
}

/// Splits `namespace/name`.
fn parse_claim(value: &str) -> anyhow::Result<(String, String)> {
    match value.split_once('/') {
        Some((namespace, name))
            if !namespace.trim().is_empty() && !name.trim().is_empty() && !name.contains('/') =>
        {
            Ok((namespace.trim().to_owned(), name.trim().to_owned()))
        }
        _ => bail!("invalid claim `{value}`, expected `namespace/name`"),
    }
}

/// Keeps the discovered records the operator asked for.
///
/// Explicitly named claims must exist.
fn select_volumes(
    records: Vec<VolumeRecord>,
    namespaces: &[String],
    claims: &[(String, String)],
    all: bool,
) -> anyhow::Result<Vec<VolumeRecord>> {
    if all {
        return Ok(records);
    }

    let found: BTreeSet<(&str, &str)> = records
        .iter()
        .map(|record| (record.namespace.as_str(), record.name.as_str()))
        .collect();
    let missing: Vec<String> = claims
        .iter()
        .filter(|(namespace, name)| !found.contains(&(namespace.as_str(), name.as_str())))
        .map(|(namespace, name)| format!("{namespace}/{name}"))
        .collect();
    if !missing.is_empty() {
        bail!("claims not found: {}", missing.join(", "));
    }

    let namespaces: BTreeSet<&str> = namespaces.iter().map(|ns| ns.trim()).collect();
    Ok(records
        .into_iter()
        .filter(|record| {
            namespaces.contains(record.namespace.as_str())
                || claims
                    .iter()
                    .any(|(namespace, name)| *namespace == record.namespace && *name == record.name)
        })
        .collect())
}

fn print_volumes(records: &[VolumeRecord]) {
    for record in records {
        let last_backup = record
            .last_successful_backup_at
            .map(|at| at.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_else(|| "never".to_owned());
        println!(
            "{:<40} {:<8} {:<8} {:<40} last backup: {last_backup}",
            record.qualified_name(),
            record.phase,
            record.capacity.as_deref().unwrap_or("-"),
            record.owner.to_string(),
        );
    }
}

fn print_attempts(attempts: &[BackupAttempt]) {
    for attempt in attempts {
        println!(
            "{}: {} ({})",
            attempt.volume.qualified_name(),
            attempt.status,
            attempt.message
        );
        if let Some(digest) = &attempt.digest {
            println!("  sha256: {digest}");
        }
        if let Some(remediation) = attempt.remediation {
            println!("  stage {}: {remediation}", attempt.stage);
        }
    }
}

fn log_config(config: &BackupConfig) {
    debug!(
        backup_dir = %config.backup_dir.display(),
        metadata_db_path = %config.metadata_db_path.display(),
        "storage config"
    );
    debug!(
        image = config.helper.image,
        ready_timeout_secs = config.helper.ready_timeout_secs,
        exec_timeout_secs = config.helper.exec_timeout_secs,
        max_startup_attempts = config.helper.startup_retry.max_attempts,
        "helper config"
    );
    debug!(
        max_concurrency = config.batch.max_concurrency,
        timeout_secs = ?config.batch.timeout_secs,
        "batch config"
    );
    match &config.destination {
        DestinationConfig::Local => debug!("using local destination"),
        DestinationConfig::Remote(remote) => debug!(
            protocol = %remote.protocol,
            host = remote.host,
            directory = remote.directory,
            keep_local_copy = remote.keep_local_copy,
            "using remote destination"
        ),
    }
}

#[cfg(test)]
mod tests {
    use pvc_backup::catalog::OwnerResolution;

    use super::*;

    fn record(namespace: &str, name: &str) -> VolumeRecord {
        VolumeRecord {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            uid: format!("uid-{name}"),
            phase: "Bound".to_owned(),
            capacity: None,
            storage_class: None,
            access_modes: Vec::new(),
            bound_volume: None,
            owner: OwnerResolution::Unknown,
            last_successful_backup_at: None,
        }
    }

    #[test]
    fn test_parse_claim() {
        assert_eq!(
            parse_claim("apps/data-pvc").unwrap(),
            ("apps".to_owned(), "data-pvc".to_owned())
        );
        assert!(parse_claim("data-pvc").is_err());
        assert!(parse_claim("/data-pvc").is_err());
        assert!(parse_claim("a/b/c").is_err());
    }

    #[test]
    fn test_select_by_namespace_and_claim() {
        let records = vec![
            record("apps", "data"),
            record("apps", "logs"),
            record("db", "pg"),
            record("db", "wal"),
        ];
        let claims = vec![("db".to_owned(), "wal".to_owned())];

        let selected = select_volumes(records, &["apps".to_owned()], &claims, false).unwrap();
        let names: Vec<String> = selected.iter().map(VolumeRecord::qualified_name).collect();

        assert_eq!(names, ["apps/data", "apps/logs", "db/wal"]);
    }

    #[test]
    fn test_missing_named_claim_is_an_error() {
        let claims = vec![("db".to_owned(), "gone".to_owned())];
        let err = select_volumes(vec![record("db", "pg")], &[], &claims, false).unwrap_err();
        assert!(err.to_string().contains("db/gone"));
    }
}
