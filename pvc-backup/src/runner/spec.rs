use std::collections::BTreeMap;

use chrono::Utc;

use crate::catalog::VolumeRecord;
use crate::naming;

/// Mount point of the claim inside the helper container.
pub const HELPER_MOUNT_PATH: &str = "/data";

pub const HELPER_CONTAINER_NAME: &str = "backup-helper";

const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
const APP_NAME: &str = "pvc-backup";
const COMPONENT: &str = "backup-helper";

/// Keeps the helper container alive long enough for exec and copy.
const HELPER_SLEEP_SECS: u32 = 3600;

/// Everything needed to submit one helper pod.
///
/// A new spec, with a new name, is built for every start-up attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperWorkloadSpec {
    pub namespace: String,
    pub name: String,
    pub claim_name: String,
    pub image: String,
    pub container_name: String,
    pub mount_path: String,
    pub command: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// Node to pin the pod to, so a `ReadWriteOnce` claim can be attached.
    pub node_name: Option<String>,
}

impl HelperWorkloadSpec {
    pub fn for_volume(volume: &VolumeRecord, image: &str, node_name: Option<String>) -> Self {
        let labels = BTreeMap::from([
            (APP_NAME_LABEL.to_owned(), APP_NAME.to_owned()),
            (COMPONENT_LABEL.to_owned(), COMPONENT.to_owned()),
        ]);

        Self {
            namespace: volume.namespace.clone(),
            name: naming::helper_pod_name(&volume.namespace, &volume.name, Utc::now()),
            claim_name: volume.name.clone(),
            image: image.to_owned(),
            container_name: HELPER_CONTAINER_NAME.to_owned(),
            mount_path: HELPER_MOUNT_PATH.to_owned(),
            command: vec![
                "sh".to_owned(),
                "-c".to_owned(),
                format!("sleep {HELPER_SLEEP_SECS}"),
            ],
            labels,
            node_name,
        }
    }
}

/// Command archiving the mounted claim to `archive_path` and printing its digest.
///
/// The digest line is best effort: images without `sha256sum` still archive.
pub fn archive_command(archive_path: &str) -> Vec<String> {
    vec![
        "sh".to_owned(),
        "-c".to_owned(),
        format!(
            "tar -czf {archive_path} -C {HELPER_MOUNT_PATH} . && (sha256sum {archive_path} 2>/dev/null || true)"
        ),
    ]
}

/// Picks the hex digest out of `sha256sum` output.
pub fn parse_digest(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find(|token| token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use crate::catalog::OwnerResolution;

    use super::*;

    fn volume() -> VolumeRecord {
        VolumeRecord {
            namespace: "apps".to_owned(),
            name: "data-pvc".to_owned(),
            uid: "uid-1".to_owned(),
            phase: "Bound".to_owned(),
            capacity: None,
            storage_class: None,
            access_modes: vec!["ReadWriteOnce".to_owned()],
            bound_volume: None,
            owner: OwnerResolution::Unknown,
            last_successful_backup_at: None,
        }
    }

    #[test]
    fn test_spec_for_volume() {
        let spec = HelperWorkloadSpec::for_volume(&volume(), "alpine:3.20", Some("node-a".to_owned()));

        assert_eq!(spec.claim_name, "data-pvc");
        assert_eq!(spec.mount_path, "/data");
        assert_eq!(spec.command[2], "sleep 3600");
        assert_eq!(spec.labels["app.kubernetes.io/component"], "backup-helper");
        assert!(spec.name.starts_with("pvc-backup-apps-data-pvc-"));
    }

    #[test]
    fn test_parse_digest() {
        let digest = "a".repeat(64);
        assert_eq!(
            parse_digest(&format!("{digest}  /tmp/x.tar.gz\n")),
            Some(digest)
        );
        assert_eq!(parse_digest(""), None);
        assert_eq!(parse_digest("tar: removing leading '/'\n"), None);
    }

    #[test]
    fn test_archive_command_targets_mount() {
        let command = archive_command("/tmp/a.tar.gz");
        assert!(command[2].starts_with("tar -czf /tmp/a.tar.gz -C /data ."));
    }
}
