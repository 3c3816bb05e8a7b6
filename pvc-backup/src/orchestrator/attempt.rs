use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::catalog::VolumeRecord;

/// A step of a backup attempt, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackupStage {
    Auth,
    Discovery,
    Create,
    Wait,
    Exec,
    Copy,
    Checksum,
    Upload,
    Cleanup,
}

impl BackupStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStage::Auth => "auth",
            BackupStage::Discovery => "discovery",
            BackupStage::Create => "create",
            BackupStage::Wait => "wait",
            BackupStage::Exec => "exec",
            BackupStage::Copy => "copy",
            BackupStage::Checksum => "checksum",
            BackupStage::Upload => "upload",
            BackupStage::Cleanup => "cleanup",
        }
    }

    /// Next step an operator should take when this stage fails.
    pub fn default_hint(&self) -> &'static str {
        match self {
            BackupStage::Auth => {
                "Re-authenticate and confirm the kubeconfig or service account token is still present."
            }
            BackupStage::Discovery => {
                "Refresh the volume list; the claim may have been deleted or recreated."
            }
            BackupStage::Create => {
                "Verify RBAC allows helper pod creation and the helper image can be pulled."
            }
            BackupStage::Wait => {
                "Inspect pod events and consider increasing the helper ready timeout for slow nodes."
            }
            BackupStage::Exec => {
                "Confirm the helper image has a shell and tar available and the claim mount is readable."
            }
            BackupStage::Copy => {
                "Check local kubectl availability and that the kubeconfig and context point to this cluster."
            }
            BackupStage::Checksum => {
                "Validate the local backup directory is writable and archive generation completed."
            }
            BackupStage::Upload => {
                "Validate the remote protocol, host, credentials and directory permissions."
            }
            BackupStage::Cleanup => {
                "Review permissions to delete helper pods in the namespace and remove leftovers manually."
            }
        }
    }
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown backup stage `{0}`")]
pub struct UnknownStage(String);

impl FromStr for BackupStage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stage = match s {
            "auth" => BackupStage::Auth,
            "discovery" => BackupStage::Discovery,
            "create" => BackupStage::Create,
            "wait" => BackupStage::Wait,
            "exec" => BackupStage::Exec,
            "copy" => BackupStage::Copy,
            "checksum" => BackupStage::Checksum,
            "upload" => BackupStage::Upload,
            "cleanup" => BackupStage::Cleanup,
            other => return Err(UnknownStage(other.to_owned())),
        };

        Ok(stage)
    }
}

/// Final outcome of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown attempt status `{0}`")]
pub struct UnknownStatus(String);

impl FromStr for AttemptStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AttemptStatus::Success),
            "failed" => Ok(AttemptStatus::Failed),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

/// A stage failed; the attempt outcome is attributed to `stage`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} stage failed: {message}")]
pub struct StageFailure {
    pub stage: BackupStage,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: BackupStage, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = match message.trim() {
            "" => "unknown error".to_owned(),
            trimmed => trimmed.to_owned(),
        };

        Self { stage, message }
    }

    /// Returns the next step for the operator.
    ///
    /// Well known causes found in the message take precedence over the stage
    /// default.
    pub fn remediation(&self) -> &'static str {
        let message = self.message.to_lowercase();

        if message.contains("not found in path") {
            "Install the missing binary on the machine running the backup or set its path in the configuration."
        } else if message.contains("exceeded quota") {
            "Raise the namespace resource quota or free capacity before retrying the backup."
        } else if message.contains("forbidden") || message.contains("status 403") {
            "Grant the backup identity the missing RBAC permission in this namespace."
        } else if message.contains("no space left on device") {
            "Free disk space in the backup directory or inside the helper pod's /tmp."
        } else {
            self.stage.default_hint()
        }
    }
}

/// How a journal entry ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    Failed(String),
}

/// One executed stage, including every retried start-up attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    pub stage: BackupStage,
    /// Helper start-up attempt the event belongs to, starting at 1.
    pub attempt: u32,
    pub outcome: StageOutcome,
    pub at: DateTime<Utc>,
}

/// Ordered record of the stages an attempt went through.
#[derive(Debug)]
pub struct StageJournal {
    events: Vec<StageEvent>,
    current: Option<BackupStage>,
    startup_attempt: u32,
}

impl StageJournal {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            current: None,
            startup_attempt: 1,
        }
    }

    /// Marks `stage` as in progress.
    pub fn begin(&mut self, stage: BackupStage) {
        self.current = Some(stage);
    }

    /// The stage that has begun but not yet finished.
    pub fn current_stage(&self) -> Option<BackupStage> {
        self.current
    }

    pub fn set_startup_attempt(&mut self, attempt: u32) {
        self.startup_attempt = attempt;
    }

    pub fn succeeded(&mut self, stage: BackupStage) {
        self.push(stage, StageOutcome::Succeeded);
    }

    pub fn failed(&mut self, failure: &StageFailure) {
        self.push(failure.stage, StageOutcome::Failed(failure.message.clone()));
    }

    /// Records the outcome of `stage` and passes `result` through.
    pub fn record<T>(
        &mut self,
        stage: BackupStage,
        result: Result<T, StageFailure>,
    ) -> Result<T, StageFailure> {
        match &result {
            Ok(_) => self.succeeded(stage),
            Err(failure) => self.failed(failure),
        }

        result
    }

    pub fn events(&self) -> &[StageEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<StageEvent> {
        self.events
    }

    fn push(&mut self, stage: BackupStage, outcome: StageOutcome) {
        if self.current == Some(stage) {
            self.current = None;
        }
        self.events.push(StageEvent {
            stage,
            attempt: self.startup_attempt,
            outcome,
            at: Utc::now(),
        });
    }
}

impl Default for StageJournal {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of backing up one volume.
#[derive(Debug, Clone)]
pub struct BackupAttempt {
    pub volume: VolumeRecord,
    /// The failing stage for failures, [`BackupStage::Cleanup`] for successes.
    pub stage: BackupStage,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub message: String,
    /// Local archive, when it was copied and still exists.
    pub archive_path: Option<PathBuf>,
    /// Remote reference, when the archive was uploaded.
    pub remote_path: Option<String>,
    /// SHA-256 of the archive, hex encoded.
    pub digest: Option<String>,
    pub remediation: Option<&'static str>,
    pub stages: Vec<StageEvent>,
}

impl BackupAttempt {
    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Success
    }

    /// Where the archive ended up: the remote reference, else the local path.
    pub fn artifact_location(&self) -> Option<String> {
        self.remote_path.clone().or_else(|| {
            self.archive_path
                .as_ref()
                .map(|path| path.display().to_string())
        })
    }
}
