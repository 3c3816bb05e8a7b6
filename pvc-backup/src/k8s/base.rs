use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::runner::HelperWorkloadSpec;

/// Owner kinds whose objects the clients can fetch while walking an owner chain.
///
/// Any other kind terminates the walk and is reported as the owner itself.
pub const SUPPORTED_OWNER_KINDS: &[&str] = &[
    "ReplicaSet",
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "CronJob",
];

/// Errors emitted by the Kubernetes integration.
#[derive(Debug, Error)]
pub enum K8sError {
    /// The API server answered with a non-success status.
    #[error("API status {code} ({reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },
    /// Any other error returned by the [`kube`] client, e.g. a transport failure.
    #[error("An error occurred with kube when dealing with K8s: {0}")]
    Kube(#[source] kube::Error),
    /// A serialization error while building a resource.
    #[error("An error occurred in serde when dealing with K8s: {0}")]
    Serde(#[from] serde_json::Error),
    /// The kubeconfig could not be turned into a client configuration.
    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    /// Streaming the output of a command executed in a pod failed.
    #[error("exec failed: {0}")]
    Exec(String),
}

impl K8sError {
    /// Returns the HTTP status code when the API server rejected the request.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            K8sError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    pub fn is_forbidden(&self) -> bool {
        self.status_code() == Some(403)
    }
}

impl From<kube::Error> for K8sError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => K8sError::Api {
                code: response.code,
                reason: response.reason,
                message: response.message,
            },
            other => K8sError::Kube(other),
        }
    }
}

/// A simplified view of a pod phase.
///
/// Unrecognized values map to [`PodPhase::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for PodPhase {
    fn from(value: &str) -> Self {
        match value {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(phase)
    }
}

/// A persistent volume claim as seen by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimInfo {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    /// Claim phase as reported by the API server, `Unknown` when absent.
    pub phase: String,
    /// Provisioned storage, e.g. `10Gi`.
    pub capacity: Option<String>,
    pub storage_class: Option<String>,
    pub access_modes: Vec<String>,
    /// Name of the bound persistent volume.
    pub volume_name: Option<String>,
}

/// One entry of an object's `ownerReferences`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub controller: bool,
}

/// Returns the controlling reference, or the first reference when none is
/// marked as controller.
pub fn controller_reference(references: &[OwnerReference]) -> Option<&OwnerReference> {
    references
        .iter()
        .find(|reference| reference.controller)
        .or_else(|| references.first())
}

/// A pod as seen by discovery and helper placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub phase: PodPhase,
    pub node_name: Option<String>,
    /// Claims mounted through `persistentVolumeClaim` volumes.
    pub claim_names: Vec<String>,
    pub owner_references: Vec<OwnerReference>,
}

impl PodInfo {
    pub fn mounts_claim(&self, claim_name: &str) -> bool {
        self.claim_names.iter().any(|name| name == claim_name)
    }
}

/// Result of fetching an owner object during an owner walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerLookup {
    /// The object exists; these are its own owner references.
    Found(Vec<OwnerReference>),
    /// The object no longer exists.
    NotFound,
    /// The kind is not one of [`SUPPORTED_OWNER_KINDS`].
    Unsupported,
}

/// Readiness relevant state of a helper pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperPodStatus {
    pub phase: PodPhase,
    /// The `Ready` condition, when the API server reported one.
    pub ready: Option<bool>,
    /// Reason of the first waiting container, e.g. `ImagePullBackOff`.
    pub waiting_reason: Option<String>,
    /// Human readable explanation of why the pod is not running yet.
    pub pending_hint: Option<String>,
    /// `true` when the scheduler reported `PodScheduled=False`.
    pub unschedulable: bool,
}

/// Captured result of a command executed inside a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Client interface describing the Kubernetes operations used by the backup
/// pipeline.
#[async_trait]
pub trait K8sClient: Send + Sync {
    /// Returns the API server version. Used as a reachability probe.
    async fn server_version(&self) -> Result<String, K8sError>;

    /// Lists the names of all namespaces.
    async fn list_namespaces(&self) -> Result<Vec<String>, K8sError>;

    /// Lists claims in `namespace`, or in all namespaces when `None`.
    async fn list_claims(&self, namespace: Option<&str>) -> Result<Vec<ClaimInfo>, K8sError>;

    /// Fetches one claim, `None` when it does not exist.
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, K8sError>;

    /// Lists pods in `namespace`, or in all namespaces when `None`.
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodInfo>, K8sError>;

    /// Fetches the owner references of a workload object.
    async fn get_owner(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<OwnerLookup, K8sError>;

    /// Submits a helper pod.
    async fn create_pod(&self, spec: &HelperWorkloadSpec) -> Result<(), K8sError>;

    /// Returns the status of a helper pod, `None` when it does not exist.
    async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HelperPodStatus>, K8sError>;

    /// Runs `command` in the first container of a pod and waits for it to exit.
    async fn exec(
        &self,
        namespace: &str,
        name: &str,
        command: &[String],
    ) -> Result<ExecOutput, K8sError>;

    /// Deletes a pod with a zero grace period.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), K8sError>;
}
