//! Lifecycle of the helper pod that archives a claim.
//!
//! A helper run is an explicit state machine:
//!
//! ```text
//! Create{n} ──► WaitReady{n} ──► Exec ──► Done
//!    ▲               │
//!    └── transient ──┘   (n < startup_retry.max_attempts)
//! ```
//!
//! Cleanup is deliberately not a state. The pod is owned by a [`HelperLease`]
//! which the orchestrator releases after every attempt, whatever the outcome.

mod lease;
mod spec;

use std::sync::Arc;

use pvc_backup_config::shared::HelperConfig;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::VolumeRecord;
use crate::k8s::{K8sClient, K8sError, PodPhase};
use crate::orchestrator::{BackupStage, StageFailure, StageJournal};

pub use lease::{CleanupOutcome, HelperLease};
pub use spec::{
    HELPER_CONTAINER_NAME, HELPER_MOUNT_PATH, HelperWorkloadSpec, archive_command, parse_digest,
};

/// Container waiting reasons that will not resolve by waiting or retrying.
const PERMANENT_WAITING_REASONS: &[&str] = &["InvalidImageName", "CreateContainerConfigError"];

/// Where a helper run currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerState {
    Create { attempt: u32 },
    WaitReady { attempt: u32 },
    Exec,
    Done(ExecReport),
}

/// Result of a successful helper run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecReport {
    pub pod_name: String,
    /// Archive location inside the helper pod.
    pub archive_path: String,
    /// Digest printed by `sha256sum` inside the pod, when the image has it.
    pub expected_digest: Option<String>,
}

/// A start-up failure together with its retry classification.
#[derive(Debug)]
struct StartupFailure {
    failure: StageFailure,
    transient: bool,
}

impl StartupFailure {
    fn transient(stage: BackupStage, message: impl Into<String>) -> Self {
        Self {
            failure: StageFailure::new(stage, message),
            transient: true,
        }
    }

    fn permanent(stage: BackupStage, message: impl Into<String>) -> Self {
        Self {
            failure: StageFailure::new(stage, message),
            transient: false,
        }
    }

    fn from_api(stage: BackupStage, context: &str, err: &K8sError) -> Self {
        Self {
            failure: StageFailure::new(stage, format!("{context}: {err}")),
            transient: is_transient(err),
        }
    }
}

/// Returns `true` when retrying the request may succeed.
///
/// Validation, authentication, authorization (quota denials included) and
/// missing-object errors are permanent. Conflicts, throttling, server errors
/// and transport failures are transient.
pub fn is_transient(err: &K8sError) -> bool {
    !matches!(err.status_code(), Some(400 | 401 | 403 | 404 | 422))
}

/// Creates helper pods, waits for them and runs the archive command.
#[derive(Clone)]
pub struct HelperWorkloadRunner {
    client: Arc<dyn K8sClient>,
    config: HelperConfig,
}

impl HelperWorkloadRunner {
    pub fn new(client: Arc<dyn K8sClient>, config: HelperConfig) -> Self {
        Self { client, config }
    }

    /// Returns an empty lease for a helper pod in the namespace of `volume`.
    pub fn lease_for(&self, volume: &VolumeRecord) -> HelperLease {
        HelperLease::new(
            self.client.clone(),
            &volume.namespace,
            self.config.cleanup_timeout(),
        )
    }

    /// Drives the state machine until the archive exists inside the pod.
    ///
    /// Every executed stage, retried ones included, is appended to `journal`.
    /// The created pod is tracked by `lease` and is never deleted here except
    /// between start-up attempts.
    pub async fn run(
        &self,
        volume: &VolumeRecord,
        archive_path: &str,
        lease: &mut HelperLease,
        journal: &mut StageJournal,
    ) -> Result<ExecReport, StageFailure> {
        let mut state = RunnerState::Create { attempt: 1 };
        loop {
            state = match state {
                RunnerState::Done(report) => return Ok(report),
                state => {
                    self.step(state, volume, archive_path, lease, journal)
                        .await?
                }
            };
        }
    }

    /// Executes one state and returns the next one.
    pub async fn step(
        &self,
        state: RunnerState,
        volume: &VolumeRecord,
        archive_path: &str,
        lease: &mut HelperLease,
        journal: &mut StageJournal,
    ) -> Result<RunnerState, StageFailure> {
        match state {
            RunnerState::Create { attempt } => {
                journal.set_startup_attempt(attempt);
                journal.begin(BackupStage::Create);
                match self.create(volume, lease).await {
                    Ok(()) => {
                        journal.succeeded(BackupStage::Create);
                        Ok(RunnerState::WaitReady { attempt })
                    }
                    Err(failure) => {
                        self.after_startup_failure(failure, attempt, lease, journal)
                            .await
                    }
                }
            }
            RunnerState::WaitReady { attempt } => {
                journal.begin(BackupStage::Wait);
                match self.wait_ready(&volume.namespace, lease).await {
                    Ok(()) => {
                        journal.succeeded(BackupStage::Wait);
                        Ok(RunnerState::Exec)
                    }
                    Err(failure) => {
                        self.after_startup_failure(failure, attempt, lease, journal)
                            .await
                    }
                }
            }
            RunnerState::Exec => {
                journal.begin(BackupStage::Exec);
                match self.exec(&volume.namespace, archive_path, lease).await {
                    Ok(report) => {
                        journal.succeeded(BackupStage::Exec);
                        Ok(RunnerState::Done(report))
                    }
                    Err(failure) => {
                        journal.failed(&failure);
                        Err(failure)
                    }
                }
            }
            RunnerState::Done(report) => Ok(RunnerState::Done(report)),
        }
    }

    async fn create(
        &self,
        volume: &VolumeRecord,
        lease: &mut HelperLease,
    ) -> Result<(), StartupFailure> {
        let node_name = self.consumer_node(volume).await;
        let spec = HelperWorkloadSpec::for_volume(volume, &self.config.image, node_name);

        debug!(
            namespace = %spec.namespace,
            pod = %spec.name,
            node = ?spec.node_name,
            "creating helper pod"
        );

        match tokio::time::timeout(self.config.ready_timeout(), self.client.create_pod(&spec)).await
        {
            Ok(Ok(())) => {
                lease.track(spec.name);
                Ok(())
            }
            Ok(Err(err)) => Err(StartupFailure::from_api(
                BackupStage::Create,
                &format!("failed to create helper pod {}/{}", spec.namespace, spec.name),
                &err,
            )),
            Err(_) => {
                // The request may still have been applied.
                lease.track(spec.name.clone());
                Err(StartupFailure::transient(
                    BackupStage::Create,
                    format!(
                        "creating helper pod {}/{} did not finish within {}s",
                        spec.namespace,
                        spec.name,
                        self.config.ready_timeout_secs
                    ),
                ))
            }
        }
    }

    async fn wait_ready(&self, namespace: &str, lease: &HelperLease) -> Result<(), StartupFailure> {
        let Some(pod) = lease.pod_name() else {
            return Err(StartupFailure::permanent(
                BackupStage::Wait,
                "no helper pod to wait for",
            ));
        };

        let deadline = Instant::now() + self.config.ready_timeout();
        let poll_interval = self.config.poll_interval();
        let mut last_phase = PodPhase::Unknown;
        let mut last_hint: Option<String> = None;

        loop {
            let status = match tokio::time::timeout_at(
                deadline,
                self.client.get_pod_status(namespace, pod),
            )
            .await
            {
                Ok(Ok(Some(status))) => status,
                Ok(Ok(None)) => {
                    return Err(StartupFailure::transient(
                        BackupStage::Wait,
                        format!("helper pod {namespace}/{pod} disappeared before becoming ready"),
                    ));
                }
                Ok(Err(err)) => {
                    return Err(StartupFailure::from_api(
                        BackupStage::Wait,
                        &format!("failed to read helper pod {namespace}/{pod}"),
                        &err,
                    ));
                }
                Err(_) => break,
            };

            last_phase = status.phase;
            if status.pending_hint.is_some() {
                last_hint = status.pending_hint.clone();
            }

            if let Some(reason) = status.waiting_reason.as_deref()
                && PERMANENT_WAITING_REASONS.contains(&reason)
            {
                return Err(StartupFailure::permanent(
                    BackupStage::Wait,
                    format!(
                        "helper pod {namespace}/{pod} cannot start: {}",
                        status.pending_hint.as_deref().unwrap_or(reason)
                    ),
                ));
            }

            match status.phase {
                PodPhase::Running if status.ready != Some(false) => {
                    debug!(namespace, pod, "helper pod is running");
                    return Ok(());
                }
                PodPhase::Failed | PodPhase::Succeeded => {
                    return Err(StartupFailure::transient(
                        BackupStage::Wait,
                        format!(
                            "helper pod {namespace}/{pod} entered unexpected phase {}",
                            status.phase
                        ),
                    ));
                }
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }

        let mut detail = format!("last observed phase={last_phase}");
        if let Some(hint) = last_hint {
            detail.push_str("; ");
            detail.push_str(&hint);
        }

        Err(StartupFailure::transient(
            BackupStage::Wait,
            format!(
                "helper pod {namespace}/{pod} did not become Running within {}s ({detail})",
                self.config.ready_timeout_secs
            ),
        ))
    }

    async fn exec(
        &self,
        namespace: &str,
        archive_path: &str,
        lease: &HelperLease,
    ) -> Result<ExecReport, StageFailure> {
        let Some(pod) = lease.pod_name() else {
            return Err(StageFailure::new(BackupStage::Exec, "no helper pod to run in"));
        };

        let command = archive_command(archive_path);
        let output = match tokio::time::timeout(
            self.config.exec_timeout(),
            self.client.exec(namespace, pod, &command),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(StageFailure::new(
                    BackupStage::Exec,
                    format!("failed to run the archive command in {namespace}/{pod}: {err}"),
                ));
            }
            Err(_) => {
                return Err(StageFailure::new(
                    BackupStage::Exec,
                    format!(
                        "the archive command in {namespace}/{pod} did not finish within {}s",
                        self.config.exec_timeout_secs
                    ),
                ));
            }
        };

        if output.exit_code != 0 {
            let detail = match output.stderr.trim() {
                "" => output.stdout.trim(),
                stderr => stderr,
            };
            return Err(StageFailure::new(
                BackupStage::Exec,
                format!(
                    "the archive command exited with status {}: {detail}",
                    output.exit_code
                ),
            ));
        }

        info!(namespace, pod, archive_path, "archive created in helper pod");

        Ok(ExecReport {
            pod_name: pod.to_owned(),
            archive_path: archive_path.to_owned(),
            expected_digest: parse_digest(&output.stdout),
        })
    }

    async fn after_startup_failure(
        &self,
        startup: StartupFailure,
        attempt: u32,
        lease: &mut HelperLease,
        journal: &mut StageJournal,
    ) -> Result<RunnerState, StageFailure> {
        journal.failed(&startup.failure);

        let retry = &self.config.startup_retry;
        if startup.transient && attempt < retry.max_attempts {
            let delay = retry.delay_for(attempt);
            warn!(
                stage = %startup.failure.stage,
                attempt,
                max_attempts = retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %startup.failure.message,
                "helper start-up failed, retrying with a fresh pod"
            );

            lease.discard().await;
            tokio::time::sleep(delay).await;

            return Ok(RunnerState::Create {
                attempt: attempt + 1,
            });
        }

        let mut failure = startup.failure;
        if startup.transient && retry.max_attempts > 1 {
            failure.message = format!("{} (after {attempt} attempts)", failure.message);
        }

        Err(failure)
    }

    /// Node of a running pod that already mounts the claim.
    ///
    /// Lookup failures only cost the placement hint.
    async fn consumer_node(&self, volume: &VolumeRecord) -> Option<String> {
        let pods = tokio::time::timeout(
            self.config.ready_timeout(),
            self.client.list_pods(Some(&volume.namespace)),
        )
        .await
        .ok()?
        .ok()?;

        pods.into_iter()
            .filter(|pod| pod.phase == PodPhase::Running && pod.mounts_claim(&volume.name))
            .find_map(|pod| pod.node_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> K8sError {
        K8sError::Api {
            code,
            reason: String::new(),
            message: String::new(),
        }
    }

    #[test]
    fn test_transient_classification() {
        for code in [409, 429, 500, 503] {
            assert!(is_transient(&api_error(code)), "{code} should be transient");
        }
        for code in [400, 401, 403, 404, 422] {
            assert!(!is_transient(&api_error(code)), "{code} should be permanent");
        }
        assert!(is_transient(&K8sError::Exec("connection reset".to_owned())));
    }
}
