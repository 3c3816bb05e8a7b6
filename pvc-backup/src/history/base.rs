use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::orchestrator::{AttemptStatus, BackupAttempt, BackupStage};

/// Latest successful backup per `(namespace, claim)`.
pub type LastSuccessMap = HashMap<(String, String), DateTime<Utc>>;

#[derive(Debug, Error)]
pub enum HistoryStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt history row: {0}")]
    Corrupt(String),
}

/// One persisted attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub namespace: String,
    pub claim_name: String,
    pub claim_uid: String,
    pub status: AttemptStatus,
    pub stage: BackupStage,
    /// Remote reference when uploaded, else the local archive path.
    pub archive_path: Option<String>,
    pub checksum: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&BackupAttempt> for HistoryRecord {
    fn from(attempt: &BackupAttempt) -> Self {
        Self {
            namespace: attempt.volume.namespace.clone(),
            claim_name: attempt.volume.name.clone(),
            claim_uid: attempt.volume.uid.clone(),
            status: attempt.status,
            stage: attempt.stage,
            archive_path: attempt.artifact_location(),
            checksum: attempt.digest.clone(),
            message: attempt.message.clone(),
            timestamp: attempt.ended_at,
        }
    }
}

/// Storage for [`HistoryRecord`]s.
///
/// Records are never updated or deleted. Implementations must be safe to use
/// from concurrent attempts.
pub trait HistoryStore {
    /// Appends `record`.
    fn record(
        &self,
        record: HistoryRecord,
    ) -> impl Future<Output = Result<(), HistoryStoreError>> + Send;

    /// Returns the newest successful timestamp for every claim with one.
    fn last_success_map(
        &self,
    ) -> impl Future<Output = Result<LastSuccessMap, HistoryStoreError>> + Send;

    /// Returns up to `limit` records, newest first.
    ///
    /// Records with equal timestamps are ordered by insertion, newest first.
    fn recent(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<HistoryRecord>, HistoryStoreError>> + Send;

    fn count(&self) -> impl Future<Output = Result<u64, HistoryStoreError>> + Send;
}
