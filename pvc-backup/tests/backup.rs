#![cfg(feature = "test-utils")]

use std::sync::Arc;
use std::time::Duration;

use pvc_backup::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use pvc_backup::history::{HistoryStore, MemoryHistoryStore, SqliteHistoryStore};
use pvc_backup::k8s::ExecOutput;
use pvc_backup::orchestrator::{
    AttemptStatus, BackupAttempt, BackupOrchestrator, BackupStage, StageOutcome,
};
use pvc_backup::test_utils::{
    FakeCopyTransport, FakeK8sClient, FakeUploader, claim, credentials, test_config, volume,
};
use pvc_backup::upload::RemoteUploader;
use pvc_backup_config::shared::BackupConfig;
use pvc_backup_telemetry::init_test_tracing;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

const ARCHIVE: &[u8] = b"pretend this is a gzip stream";

struct Harness {
    client: Arc<FakeK8sClient>,
    dir: TempDir,
    shutdown_tx: ShutdownTx,
}

impl Harness {
    /// A cluster holding `apps/data-pvc`.
    fn new() -> Self {
        let client = Arc::new(FakeK8sClient::new());
        client.add_claim(claim("apps", "data-pvc"));

        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            client,
            dir: tempfile::tempdir().unwrap(),
            shutdown_tx,
        }
    }

    fn config(&self) -> BackupConfig {
        test_config(self.dir.path())
    }

    fn shutdown_rx(&self) -> ShutdownRx {
        self.shutdown_tx.subscribe()
    }

    fn orchestrator_with(
        &self,
        config: &BackupConfig,
        transport: FakeCopyTransport,
    ) -> BackupOrchestrator<MemoryHistoryStore> {
        BackupOrchestrator::new(
            credentials(self.client.clone()),
            config,
            Arc::new(transport),
            MemoryHistoryStore::new(),
        )
    }

    fn orchestrator(&self) -> BackupOrchestrator<MemoryHistoryStore> {
        self.orchestrator_with(&self.config(), FakeCopyTransport::with_content(ARCHIVE))
    }

    fn archives(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.dir.path().join("backups")) else {
            return Vec::new();
        };
        entries
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn stage_trace(attempt: &BackupAttempt) -> Vec<(BackupStage, u32, bool)> {
    attempt
        .stages
        .iter()
        .map(|event| {
            (
                event.stage,
                event.attempt,
                event.outcome == StageOutcome::Succeeded,
            )
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_successful_backup_copies_verifies_and_cleans_up() {
    init_test_tracing();

    let harness = Harness::new();
    let orchestrator = harness.orchestrator();

    let attempt = orchestrator
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.status, AttemptStatus::Success);
    assert_eq!(attempt.stage, BackupStage::Cleanup);
    assert_eq!(attempt.remediation, None);
    assert_eq!(attempt.digest.as_deref(), Some(sha256_hex(ARCHIVE).as_str()));

    let archive_path = attempt.archive_path.clone().unwrap();
    assert_eq!(std::fs::read(&archive_path).unwrap(), ARCHIVE);
    assert!(
        archive_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("__apps__data-pvc.tar.gz")
    );
    assert_eq!(
        attempt.message,
        format!("Backup completed: {}", archive_path.display())
    );

    assert_eq!(
        stage_trace(&attempt),
        vec![
            (BackupStage::Auth, 1, true),
            (BackupStage::Discovery, 1, true),
            (BackupStage::Create, 1, true),
            (BackupStage::Wait, 1, true),
            (BackupStage::Exec, 1, true),
            (BackupStage::Copy, 1, true),
            (BackupStage::Checksum, 1, true),
            (BackupStage::Cleanup, 1, true),
        ]
    );

    let created = harness.client.created_pods();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].claim_name, "data-pvc");
    assert_eq!(created[0].node_name, None);
    assert_eq!(
        harness.client.deleted_pods(),
        vec![("apps".to_owned(), created[0].name.clone())]
    );

    let exec_calls = harness.client.exec_calls();
    assert_eq!(exec_calls.len(), 1);
    assert!(exec_calls[0].2[2].starts_with("tar -czf /tmp/"));

    assert_eq!(orchestrator.history().count().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_helper_is_pinned_next_to_the_consumer() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.add_pod(pvc_backup::test_utils::pod(
        "apps",
        "web-0",
        &["data-pvc"],
        None,
    ));

    let attempt = harness
        .orchestrator()
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert!(attempt.is_success());
    assert_eq!(
        harness.client.created_pods()[0].node_name.as_deref(),
        Some("node-a")
    );
}

#[tokio::test(start_paused = true)]
async fn test_quota_denial_fails_create_without_retry() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.fail_pod_creation(
        403,
        "pods \"helper\" is forbidden: exceeded quota: compute-quota",
    );

    let attempt = harness
        .orchestrator()
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.stage, BackupStage::Create);
    assert!(attempt.message.contains("exceeded quota"));
    assert!(!attempt.message.contains("attempts"));
    assert!(attempt.remediation.unwrap().contains("quota"));

    assert_eq!(harness.client.created_pods().len(), 1);
    assert!(harness.client.deleted_pods().is_empty());
    assert!(harness.archives().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_archive_command_still_deletes_the_helper() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.set_exec_output(ExecOutput {
        exit_code: 2,
        stdout: String::new(),
        stderr: "tar: ./secret: Cannot open: Permission denied".to_owned(),
    });
    let transport = Arc::new(FakeCopyTransport::with_content(ARCHIVE));
    let orchestrator = BackupOrchestrator::new(
        credentials(harness.client.clone()),
        &harness.config(),
        transport.clone(),
        MemoryHistoryStore::new(),
    );

    let attempt = orchestrator
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.stage, BackupStage::Exec);
    assert!(attempt.message.contains("exited with status 2"));
    assert!(attempt.message.contains("Permission denied"));
    assert_eq!(harness.client.deleted_pods().len(), 1);
    assert!(transport.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_zero_byte_archive_fails_checksum() {
    init_test_tracing();

    let harness = Harness::new();
    let orchestrator =
        harness.orchestrator_with(&harness.config(), FakeCopyTransport::with_content(Vec::new()));

    let attempt = orchestrator
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.stage, BackupStage::Checksum);
    assert!(attempt.message.contains("is empty"));
    assert_eq!(attempt.digest, None);
    assert_eq!(harness.client.deleted_pods().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_copy_leaves_no_partial_archive() {
    init_test_tracing();

    let harness = Harness::new();
    let orchestrator = harness.orchestrator_with(
        &harness.config(),
        FakeCopyTransport::failing("error: unable to upgrade connection"),
    );

    let attempt = orchestrator
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.stage, BackupStage::Copy);
    assert!(attempt.message.contains("unable to upgrade connection"));
    assert_eq!(attempt.archive_path, None);
    assert!(harness.archives().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_digest_reported_by_helper_must_match() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.set_exec_output(ExecOutput {
        exit_code: 0,
        stdout: format!("{}  /tmp/archive.tar.gz\n", "0".repeat(64)),
        stderr: String::new(),
    });

    let attempt = harness
        .orchestrator()
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.stage, BackupStage::Checksum);
    assert!(attempt.message.contains("digest mismatch"));
}

#[tokio::test(start_paused = true)]
async fn test_matching_digest_reported_by_helper_succeeds() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.set_exec_output(ExecOutput {
        exit_code: 0,
        stdout: format!("{}  /tmp/archive.tar.gz\n", sha256_hex(ARCHIVE).to_uppercase()),
        stderr: String::new(),
    });

    let attempt = harness
        .orchestrator()
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert!(attempt.is_success(), "{}", attempt.message);
}

#[tokio::test(start_paused = true)]
async fn test_unschedulable_helper_is_retried_with_fresh_pods() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.set_ready_after_creations(4);

    let attempt = harness
        .orchestrator()
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert!(attempt.is_success(), "{}", attempt.message);

    let trace = stage_trace(&attempt);
    let waits: Vec<_> = trace
        .iter()
        .filter(|(stage, _, _)| *stage == BackupStage::Wait)
        .collect();
    assert_eq!(
        waits,
        vec![
            &(BackupStage::Wait, 1, false),
            &(BackupStage::Wait, 2, false),
            &(BackupStage::Wait, 3, false),
            &(BackupStage::Wait, 4, true),
        ]
    );
    assert_eq!(
        trace.last(),
        Some(&(BackupStage::Cleanup, 4, true))
    );

    let created: Vec<String> = harness
        .client
        .created_pods()
        .into_iter()
        .map(|spec| spec.name)
        .collect();
    assert_eq!(created.len(), 4);
    let deleted: Vec<String> = harness
        .client
        .deleted_pods()
        .into_iter()
        .map(|(_, name)| name)
        .collect();
    assert_eq!(deleted, created);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_startup_retries_report_attempt_count() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.set_ready_after_creations(100);

    let attempt = harness
        .orchestrator()
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.stage, BackupStage::Wait);
    assert!(attempt.message.contains("did not become Running within 10s"));
    assert!(attempt.message.contains("last observed phase=Pending"));
    assert!(attempt.message.contains("Unschedulable"));
    assert!(attempt.message.ends_with("(after 4 attempts)"));

    let cleanups = attempt
        .stages
        .iter()
        .filter(|event| event.stage == BackupStage::Cleanup)
        .count();
    assert_eq!(cleanups, 1);
    assert_eq!(harness.client.created_pods().len(), 4);
    assert_eq!(harness.client.deleted_pods().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_image_fails_without_retry() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.set_waiting_reason("InvalidImageName");

    let attempt = harness
        .orchestrator()
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.stage, BackupStage::Wait);
    assert!(attempt.message.contains("InvalidImageName"));
    assert_eq!(harness.client.created_pods().len(), 1);
    assert_eq!(harness.client.deleted_pods().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recreated_claim_fails_discovery() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.remove_claim("apps", "data-pvc");
    let mut recreated = claim("apps", "data-pvc");
    recreated.uid = "uid-recreated".to_owned();
    harness.client.add_claim(recreated);

    let attempt = harness
        .orchestrator()
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.stage, BackupStage::Discovery);
    assert!(attempt.message.contains("recreated"));
    assert!(harness.client.created_pods().is_empty());
    assert_eq!(
        attempt.stages.last().map(|event| event.stage),
        Some(BackupStage::Cleanup)
    );
}

#[tokio::test(start_paused = true)]
async fn test_batch_isolates_failures() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.add_claim(claim("apps", "logs"));
    harness.client.add_claim(claim("db", "pg-data"));
    harness.client.remove_claim("apps", "logs");

    let mut config = harness.config();
    config.batch.max_concurrency = 2;
    let orchestrator =
        harness.orchestrator_with(&config, FakeCopyTransport::with_content(ARCHIVE));

    let volumes = [
        volume("apps", "data-pvc"),
        volume("apps", "logs"),
        volume("db", "pg-data"),
    ];
    let attempts = orchestrator
        .backup_batch(&volumes, harness.shutdown_rx())
        .await;

    assert_eq!(attempts.len(), 3);
    let failed: Vec<_> = attempts.iter().filter(|a| !a.is_success()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].volume.name, "logs");
    assert_eq!(failed[0].stage, BackupStage::Discovery);
    assert!(failed[0].message.contains("no longer exists"));

    assert_eq!(harness.client.created_pods().len(), 2);
    assert_eq!(harness.client.deleted_pods().len(), 2);
    assert_eq!(harness.archives().len(), 2);
    assert_eq!(orchestrator.history().count().await.unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_batch_budget_interrupts_and_cleans_up() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.set_ready_after_creations(100);

    let mut config = harness.config();
    config.batch.timeout_secs = Some(3);
    let orchestrator =
        harness.orchestrator_with(&config, FakeCopyTransport::with_content(ARCHIVE));

    let attempts = orchestrator
        .backup_batch(&[volume("apps", "data-pvc")], harness.shutdown_rx())
        .await;

    assert_eq!(attempts.len(), 1);
    let attempt = &attempts[0];
    assert_eq!(attempt.stage, BackupStage::Wait);
    assert_eq!(
        attempt.message,
        "interrupted: the batch time budget was exhausted"
    );

    let created = harness.client.created_pods();
    assert_eq!(created.len(), 1);
    assert_eq!(
        harness.client.deleted_pods(),
        vec![("apps".to_owned(), created[0].name.clone())]
    );
    assert_eq!(orchestrator.history().count().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_budget_during_retry_discard_still_deletes_pod() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.set_ready_after_creations(100);
    harness.client.set_delete_pod_delay(Duration::from_secs(2));

    // The first readiness wait ends at 10s, so the budget fires while the
    // timed out pod is being discarded.
    let mut config = harness.config();
    config.batch.timeout_secs = Some(11);
    let orchestrator =
        harness.orchestrator_with(&config, FakeCopyTransport::with_content(ARCHIVE));

    let attempts = orchestrator
        .backup_batch(&[volume("apps", "data-pvc")], harness.shutdown_rx())
        .await;

    let attempt = &attempts[0];
    assert_eq!(attempt.stage, BackupStage::Wait);
    assert_eq!(
        attempt.message,
        "interrupted: the batch time budget was exhausted"
    );

    let created = harness.client.created_pods();
    assert_eq!(created.len(), 1);
    assert_eq!(
        harness.client.deleted_pods(),
        vec![("apps".to_owned(), created[0].name.clone())]
    );
    assert!(harness.client.live_helper_pods().is_empty());
    assert_eq!(
        stage_trace(attempt).last(),
        Some(&(BackupStage::Cleanup, 1, true))
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_and_cleans_up() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.set_ready_after_creations(100);
    let orchestrator = harness.orchestrator();
    let volume = volume("apps", "data-pvc");

    let (attempt, ()) = tokio::join!(
        orchestrator.backup_one(&volume, harness.shutdown_rx()),
        async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            harness.shutdown_tx.shutdown().unwrap();
        }
    );

    assert_eq!(attempt.stage, BackupStage::Wait);
    assert_eq!(attempt.message, "interrupted: shutdown was requested");
    assert_eq!(harness.client.deleted_pods().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_failure_fails_an_otherwise_successful_attempt() {
    init_test_tracing();

    let harness = Harness::new();
    harness
        .client
        .fail_pod_deletion(403, "pods \"helper\" is forbidden: cannot delete");

    let attempt = harness
        .orchestrator()
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.stage, BackupStage::Cleanup);
    assert!(attempt.message.contains("failed to delete helper pod"));
    assert!(attempt.archive_path.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_failure_keeps_earlier_stage_failure() {
    init_test_tracing();

    let harness = Harness::new();
    harness.client.set_exec_output(ExecOutput {
        exit_code: 2,
        stdout: String::new(),
        stderr: "tar: ./secret: Cannot open: Permission denied".to_owned(),
    });
    harness
        .client
        .fail_pod_deletion(403, "pods \"helper\" is forbidden: cannot delete");

    let attempt = harness
        .orchestrator()
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.stage, BackupStage::Exec);
    assert!(attempt.message.contains("Permission denied"));
    assert!(attempt.message.contains("failed to delete helper pod"));
    assert!(matches!(
        attempt.stages.last().map(|event| (&event.stage, &event.outcome)),
        Some((BackupStage::Cleanup, StageOutcome::Failed(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_upload_replaces_local_archive() {
    init_test_tracing();

    let harness = Harness::new();
    let uploader = Arc::new(FakeUploader::new());
    let orchestrator = harness
        .orchestrator()
        .with_uploader(Some(uploader.clone() as Arc<dyn RemoteUploader>));

    let attempt = orchestrator
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert!(attempt.is_success(), "{}", attempt.message);
    assert_eq!(uploader.uploads().len(), 1);
    assert_eq!(attempt.archive_path, None);

    let remote = attempt.remote_path.clone().unwrap();
    assert!(remote.starts_with("scp://backup.example.com/archives/"));
    assert_eq!(attempt.message, format!("Backup completed: {remote}"));
    assert!(harness.archives().is_empty());

    let recent = orchestrator.history().recent(1).await.unwrap();
    assert_eq!(recent[0].archive_path.as_deref(), Some(remote.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_failed_upload_keeps_local_archive() {
    init_test_tracing();

    let harness = Harness::new();
    let orchestrator = harness
        .orchestrator()
        .with_uploader(Some(Arc::new(FakeUploader::failing("Permission denied (publickey,password)"))));

    let attempt = orchestrator
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;

    assert_eq!(attempt.stage, BackupStage::Upload);
    assert!(attempt.message.contains("Permission denied"));
    assert_eq!(harness.archives().len(), 1);
    assert!(attempt.digest.is_some());
}

#[tokio::test]
async fn test_history_is_persisted_in_sqlite() {
    init_test_tracing();

    let harness = Harness::new();
    let history = SqliteHistoryStore::in_memory().await.unwrap();
    history.initialize().await.unwrap();
    let orchestrator = BackupOrchestrator::new(
        credentials(harness.client.clone()),
        &harness.config(),
        Arc::new(FakeCopyTransport::with_content(ARCHIVE)),
        history,
    );

    let attempt = orchestrator
        .backup_one(&volume("apps", "data-pvc"), harness.shutdown_rx())
        .await;
    assert!(attempt.is_success(), "{}", attempt.message);

    let history = orchestrator.history();
    let last_success = history.last_success_map().await.unwrap();
    assert!(last_success.contains_key(&("apps".to_owned(), "data-pvc".to_owned())));

    let recent = history.recent(10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].status, AttemptStatus::Success);
    assert_eq!(recent[0].stage, BackupStage::Cleanup);
    assert_eq!(recent[0].claim_uid, "uid-apps-data-pvc");
    assert_eq!(recent[0].checksum.as_deref(), Some(sha256_hex(ARCHIVE).as_str()));
}
