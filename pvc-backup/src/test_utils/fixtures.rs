use std::path::Path;
use std::sync::Arc;

use pvc_backup_config::shared::{AuthMode, BackupConfig, RetryConfig};

use crate::auth::{CredentialContext, TransportSettings};
use crate::catalog::{OwnerResolution, VolumeRecord};
use crate::k8s::{ClaimInfo, K8sClient, OwnerReference, PodInfo, PodPhase};

/// A bound 1Gi claim with a deterministic uid.
pub fn claim(namespace: &str, name: &str) -> ClaimInfo {
    ClaimInfo {
        namespace: namespace.to_owned(),
        name: name.to_owned(),
        uid: format!("uid-{namespace}-{name}"),
        phase: "Bound".to_owned(),
        capacity: Some("1Gi".to_owned()),
        storage_class: Some("standard".to_owned()),
        access_modes: vec!["ReadWriteOnce".to_owned()],
        volume_name: Some(format!("pv-{namespace}-{name}")),
    }
}

/// A running pod on `node-a` mounting `claims`, controlled by `owner` when given.
pub fn pod(namespace: &str, name: &str, claims: &[&str], owner: Option<(&str, &str)>) -> PodInfo {
    PodInfo {
        namespace: namespace.to_owned(),
        name: name.to_owned(),
        phase: PodPhase::Running,
        node_name: Some("node-a".to_owned()),
        claim_names: claims.iter().map(|claim| (*claim).to_owned()).collect(),
        owner_references: owner
            .map(|(kind, name)| vec![controller(kind, name)])
            .unwrap_or_default(),
    }
}

pub fn controller(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        kind: kind.to_owned(),
        name: name.to_owned(),
        controller: true,
    }
}

/// The record discovery produces for [`claim`] with an unknown owner.
pub fn volume(namespace: &str, name: &str) -> VolumeRecord {
    VolumeRecord::from_claim(claim(namespace, name), OwnerResolution::Unknown)
}

/// A verified context around `client` without any files to re-check.
pub fn credentials(client: Arc<dyn K8sClient>) -> Arc<CredentialContext> {
    Arc::new(CredentialContext::for_client(
        client,
        AuthMode::KubeconfigPath,
        TransportSettings::default(),
    ))
}

/// Configuration writing into `dir` with short helper timeouts and fast retries.
pub fn test_config(dir: &Path) -> BackupConfig {
    let mut config = BackupConfig {
        backup_dir: dir.join("backups"),
        metadata_db_path: dir.join("data").join("backups.db"),
        ..BackupConfig::default()
    };
    config.helper.ready_timeout_secs = 10;
    config.helper.poll_interval_ms = 1_000;
    config.helper.exec_timeout_secs = 60;
    config.helper.cleanup_timeout_secs = 5;
    config.helper.startup_retry = RetryConfig {
        max_attempts: 4,
        initial_delay_ms: 100,
        max_delay_ms: 500,
        backoff_factor: 2.0,
    };
    config.discovery.timeout_secs = 5;

    config
}
