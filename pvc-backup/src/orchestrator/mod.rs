//! Sequencing of backup attempts.
//!
//! One [`BackupAttempt`] runs these stages in order, stopping at the first
//! failure:
//!
//! 1. `auth`: the credential context still has its files.
//! 2. `discovery`: the claim still exists with the same uid.
//! 3. `create`, `wait`, `exec`: the helper pod archives the claim.
//! 4. `copy`, `checksum`: the archive is copied out and verified.
//! 5. `upload`: only when a remote destination is configured.
//!
//! `cleanup` always runs afterwards, also when the attempt was interrupted.

mod attempt;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{StreamExt, stream};
use pvc_backup_config::shared::{BackupConfig, BatchConfig};
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span, warn};

use crate::auth::CredentialContext;
use crate::catalog::VolumeRecord;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx, shutdown_requested};
use crate::history::{HistoryRecord, HistoryStore};
use crate::naming;
use crate::runner::{CleanupOutcome, HelperLease, HelperWorkloadRunner};
use crate::transfer::{ArchiveTransferer, CopyTransport};
use crate::upload::{RemoteUploader, uploader_from_config};

pub use attempt::*;

/// Directory inside the helper pod where the archive is written.
const IN_POD_ARCHIVE_DIR: &str = "/tmp";

/// What the stages produced so far.
#[derive(Debug, Default)]
struct Artifacts {
    archive_path: Option<PathBuf>,
    remote_path: Option<String>,
    digest: Option<String>,
}

/// Runs backup attempts against one cluster.
pub struct BackupOrchestrator<H> {
    credentials: Arc<CredentialContext>,
    runner: HelperWorkloadRunner,
    transferer: ArchiveTransferer,
    uploader: Option<Arc<dyn RemoteUploader>>,
    history: H,
    discovery_timeout: Duration,
    batch: BatchConfig,
}

impl<H> BackupOrchestrator<H>
where
    H: HistoryStore + Send + Sync,
{
    /// Builds an orchestrator from the loaded configuration.
    ///
    /// The uploader follows `config.destination`; use
    /// [`BackupOrchestrator::with_uploader`] to replace it.
    pub fn new(
        credentials: Arc<CredentialContext>,
        config: &BackupConfig,
        transport: Arc<dyn CopyTransport>,
        history: H,
    ) -> Self {
        let runner = HelperWorkloadRunner::new(credentials.client(), config.helper.clone());
        let transferer = ArchiveTransferer::new(
            transport,
            config.backup_dir.clone(),
            config.transfer.copy_timeout(),
        );

        Self {
            credentials,
            runner,
            transferer,
            uploader: uploader_from_config(&config.destination),
            history,
            discovery_timeout: config.discovery.timeout(),
            batch: config.batch.clone(),
        }
    }

    pub fn with_uploader(mut self, uploader: Option<Arc<dyn RemoteUploader>>) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    /// Backs up a single volume and records the attempt.
    pub async fn backup_one(&self, volume: &VolumeRecord, shutdown_rx: ShutdownRx) -> BackupAttempt {
        let attempt = self.attempt(volume, None, shutdown_rx).await;
        self.record(&attempt).await;

        attempt
    }

    /// Backs up every volume in `volumes`, at most `batch.max_concurrency` at a
    /// time, and returns the attempts in completion order.
    ///
    /// Exactly one attempt is produced and recorded per volume. A failing
    /// volume never stops the others. Once the batch budget runs out or
    /// shutdown is requested, the remaining attempts fail fast at the stage they
    /// were in.
    pub async fn backup_batch(
        &self,
        volumes: &[VolumeRecord],
        shutdown_rx: ShutdownRx,
    ) -> Vec<BackupAttempt> {
        let deadline = self.batch.timeout().map(|budget| Instant::now() + budget);
        let max_concurrency = self.batch.max_concurrency.max(1);

        info!(
            volumes = volumes.len(),
            max_concurrency,
            budget_secs = ?self.batch.timeout_secs,
            "starting backup batch"
        );

        let attempts: Vec<BackupAttempt> = stream::iter(volumes)
            .map(|volume| {
                let shutdown_rx = shutdown_rx.clone();
                async move {
                    let attempt = self.attempt(volume, deadline, shutdown_rx).await;
                    self.record(&attempt).await;
                    attempt
                }
            })
            .buffer_unordered(max_concurrency)
            .collect()
            .await;

        let succeeded = attempts.iter().filter(|attempt| attempt.is_success()).count();
        info!(
            succeeded,
            failed = attempts.len() - succeeded,
            "backup batch finished"
        );

        attempts
    }

    async fn record(&self, attempt: &BackupAttempt) {
        if let Err(err) = self.history.record(HistoryRecord::from(attempt)).await {
            warn!(
                namespace = %attempt.volume.namespace,
                claim = %attempt.volume.name,
                error = %err,
                "failed to record backup attempt"
            );
        }
    }

    async fn attempt(
        &self,
        volume: &VolumeRecord,
        deadline: Option<Instant>,
        shutdown_rx: ShutdownRx,
    ) -> BackupAttempt {
        let span = info_span!(
            "backup_attempt",
            namespace = %volume.namespace,
            claim = %volume.name
        );

        self.run_attempt(volume, deadline, shutdown_rx)
            .instrument(span)
            .await
    }

    async fn run_attempt(
        &self,
        volume: &VolumeRecord,
        deadline: Option<Instant>,
        shutdown_rx: ShutdownRx,
    ) -> BackupAttempt {
        let started_at = Utc::now();
        let mut journal = StageJournal::new();
        let mut lease = self.runner.lease_for(volume);
        let mut artifacts = Artifacts::default();

        let result = {
            let stages = self.run_stages(volume, &mut journal, &mut lease, &mut artifacts);
            tokio::pin!(stages);

            let budget = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                result = &mut stages => ShutdownResult::Ok(result),
                _ = shutdown_requested(shutdown_rx) => ShutdownResult::Shutdown("shutdown was requested"),
                _ = budget => ShutdownResult::Shutdown("the batch time budget was exhausted"),
            }
        };

        let outcome = match result {
            ShutdownResult::Ok(outcome) => outcome,
            ShutdownResult::Shutdown(reason) => {
                let stage = journal
                    .current_stage()
                    .or_else(|| journal.events().last().map(|event| event.stage))
                    .unwrap_or(BackupStage::Auth);
                let failure = StageFailure::new(stage, format!("interrupted: {reason}"));
                warn!(stage = %stage, reason, "backup attempt interrupted");
                journal.failed(&failure);
                Err(failure)
            }
        };

        journal.begin(BackupStage::Cleanup);
        let cleanup = journal.record(BackupStage::Cleanup, lease.release().await);
        if let Ok(CleanupOutcome::AlreadyGone(pod)) = &cleanup {
            info!(pod = %pod, "helper pod was already gone");
        }

        let (status, stage, message, remediation) = match (outcome, cleanup) {
            (Ok(()), Ok(_)) => {
                let location = artifacts
                    .remote_path
                    .clone()
                    .or_else(|| {
                        artifacts
                            .archive_path
                            .as_ref()
                            .map(|path| path.display().to_string())
                    })
                    .unwrap_or_default();
                (
                    AttemptStatus::Success,
                    BackupStage::Cleanup,
                    format!("Backup completed: {location}"),
                    None,
                )
            }
            (Ok(()), Err(cleanup)) => (
                AttemptStatus::Failed,
                BackupStage::Cleanup,
                cleanup.message.clone(),
                Some(cleanup.remediation()),
            ),
            (Err(failure), Ok(_)) => (
                AttemptStatus::Failed,
                failure.stage,
                failure.message.clone(),
                Some(failure.remediation()),
            ),
            (Err(failure), Err(cleanup)) => (
                AttemptStatus::Failed,
                failure.stage,
                format!("{}; {cleanup}", failure.message),
                Some(failure.remediation()),
            ),
        };

        match status {
            AttemptStatus::Success => info!(message = %message, "backup succeeded"),
            AttemptStatus::Failed => error!(stage = %stage, message = %message, "backup failed"),
        }

        BackupAttempt {
            volume: volume.clone(),
            stage,
            status,
            started_at,
            ended_at: Utc::now(),
            message,
            archive_path: artifacts.archive_path,
            remote_path: artifacts.remote_path,
            digest: artifacts.digest,
            remediation,
            stages: journal.into_events(),
        }
    }

    async fn run_stages(
        &self,
        volume: &VolumeRecord,
        journal: &mut StageJournal,
        lease: &mut HelperLease,
        artifacts: &mut Artifacts,
    ) -> Result<(), StageFailure> {
        journal.begin(BackupStage::Auth);
        let auth = self
            .credentials
            .ensure_valid()
            .await
            .map_err(|err| StageFailure::new(BackupStage::Auth, err.to_string()));
        journal.record(BackupStage::Auth, auth)?;

        journal.begin(BackupStage::Discovery);
        let discovery = self.confirm_claim(volume).await;
        journal.record(BackupStage::Discovery, discovery)?;

        let archive_name = naming::archive_name(&volume.namespace, &volume.name, Utc::now());
        let in_pod_path = format!("{IN_POD_ARCHIVE_DIR}/{archive_name}");
        let report = self.runner.run(volume, &in_pod_path, lease, journal).await?;

        journal.begin(BackupStage::Copy);
        let copy = self
            .transferer
            .copy(
                &volume.namespace,
                &report.pod_name,
                &report.archive_path,
                &archive_name,
            )
            .await
            .map_err(|err| StageFailure::new(BackupStage::Copy, err.to_string()));
        let local_path = journal.record(BackupStage::Copy, copy)?;
        artifacts.archive_path = Some(local_path.clone());

        journal.begin(BackupStage::Checksum);
        let digest = self
            .transferer
            .digest(&local_path, report.expected_digest.as_deref())
            .await
            .map_err(|err| StageFailure::new(BackupStage::Checksum, err.to_string()));
        artifacts.digest = Some(journal.record(BackupStage::Checksum, digest)?);

        if let Some(uploader) = &self.uploader {
            journal.begin(BackupStage::Upload);
            let upload = uploader
                .upload(&local_path)
                .await
                .map_err(|err| StageFailure::new(BackupStage::Upload, err.to_string()));
            artifacts.remote_path = Some(journal.record(BackupStage::Upload, upload)?);

            if !uploader.keep_local_copy() {
                match tokio::fs::remove_file(&local_path).await {
                    Ok(()) => artifacts.archive_path = None,
                    Err(err) => warn!(
                        path = %local_path.display(),
                        error = %err,
                        "failed to remove local archive after upload"
                    ),
                }
            }
        }

        Ok(())
    }

    /// Fails unless the claim still exists with the uid seen at discovery.
    async fn confirm_claim(&self, volume: &VolumeRecord) -> Result<(), StageFailure> {
        let client = self.credentials.client();
        let lookup = tokio::time::timeout(
            self.discovery_timeout,
            client.get_claim(&volume.namespace, &volume.name),
        )
        .await;

        let failure = |message: String| StageFailure::new(BackupStage::Discovery, message);
        match lookup {
            Ok(Ok(Some(claim))) if volume.uid.is_empty() || claim.uid == volume.uid => Ok(()),
            Ok(Ok(Some(claim))) => Err(failure(format!(
                "claim {} was recreated since discovery (uid {} is now {})",
                volume.qualified_name(),
                volume.uid,
                claim.uid
            ))),
            Ok(Ok(None)) => Err(failure(format!(
                "claim {} no longer exists",
                volume.qualified_name()
            ))),
            Ok(Err(err)) => Err(failure(format!(
                "failed to read claim {}: {err}",
                volume.qualified_name()
            ))),
            Err(_) => Err(failure(format!(
                "reading claim {} did not finish within {}s",
                volume.qualified_name(),
                self.discovery_timeout.as_secs()
            ))),
        }
    }
}
