use std::fmt::{self, Debug};

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::k8s::{
    ClaimInfo, ExecOutput, HelperPodStatus, K8sClient, K8sError, OwnerLookup, OwnerReference,
    PodInfo, PodPhase,
};
use crate::runner::HelperWorkloadSpec;

/// Name of the pod volume backed by the claim being archived.
const CLAIM_VOLUME_NAME: &str = "target";

/// HTTP-based implementation of [`K8sClient`].
///
/// The client talks to the API server using a [`kube::Client`].
#[derive(Clone)]
pub struct HttpK8sClient {
    client: Client,
}

impl fmt::Debug for HttpK8sClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpK8sClient")
            .field("default_namespace", &self.client.default_namespace())
            .finish_non_exhaustive()
    }
}

impl HttpK8sClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from a parsed kubeconfig, selecting `context` when given
    /// and `current-context` otherwise.
    pub async fn from_kubeconfig(
        kubeconfig: Kubeconfig,
        context: Option<&str>,
    ) -> Result<Self, K8sError> {
        let options = KubeConfigOptions {
            context: context.map(str::to_owned),
            ..Default::default()
        };
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?;
        let client = Client::try_from(config)?;

        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn owner_references_of<K>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<OwnerLookup, K8sError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let Some(object) = api.get_opt(name).await? else {
            return Ok(OwnerLookup::NotFound);
        };

        let references = object
            .owner_references()
            .iter()
            .map(|reference| OwnerReference {
                kind: reference.kind.clone(),
                name: reference.name.clone(),
                controller: reference.controller.unwrap_or(false),
            })
            .collect();

        Ok(OwnerLookup::Found(references))
    }
}

#[async_trait]
impl K8sClient for HttpK8sClient {
    async fn server_version(&self) -> Result<String, K8sError> {
        let info = self.client.apiserver_version().await?;

        Ok(info.git_version)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, K8sError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = api.list(&ListParams::default()).await?;

        Ok(namespaces.items.iter().map(|ns| ns.name_any()).collect())
    }

    async fn list_claims(&self, namespace: Option<&str>) -> Result<Vec<ClaimInfo>, K8sError> {
        let api: Api<PersistentVolumeClaim> = match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let claims = api.list(&ListParams::default()).await?;

        Ok(claims.items.iter().map(claim_info).collect())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, K8sError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let claim = api.get_opt(name).await?;

        Ok(claim.as_ref().map(claim_info))
    }

    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodInfo>, K8sError> {
        let api: Api<Pod> = match namespace {
            Some(namespace) => self.pods(namespace),
            None => Api::all(self.client.clone()),
        };
        let pods = api.list(&ListParams::default()).await?;

        Ok(pods.items.iter().map(pod_info).collect())
    }

    async fn get_owner(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<OwnerLookup, K8sError> {
        match kind {
            "ReplicaSet" => self.owner_references_of::<ReplicaSet>(namespace, name).await,
            "Deployment" => self.owner_references_of::<Deployment>(namespace, name).await,
            "StatefulSet" => self.owner_references_of::<StatefulSet>(namespace, name).await,
            "DaemonSet" => self.owner_references_of::<DaemonSet>(namespace, name).await,
            "Job" => self.owner_references_of::<Job>(namespace, name).await,
            "CronJob" => self.owner_references_of::<CronJob>(namespace, name).await,
            _ => Ok(OwnerLookup::Unsupported),
        }
    }

    async fn create_pod(&self, spec: &HelperWorkloadSpec) -> Result<(), K8sError> {
        let pod_json = json!({
          "apiVersion": "v1",
          "kind": "Pod",
          "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": spec.labels,
          },
          "spec": {
            "restartPolicy": "Never",
            "nodeName": spec.node_name,
            "containers": [{
              "name": spec.container_name,
              "image": spec.image,
              "command": spec.command,
              "volumeMounts": [{
                "name": CLAIM_VOLUME_NAME,
                "mountPath": spec.mount_path,
                "readOnly": true,
              }],
            }],
            "volumes": [{
              "name": CLAIM_VOLUME_NAME,
              "persistentVolumeClaim": {
                "claimName": spec.claim_name,
                "readOnly": true,
              },
            }],
          }
        });

        let pod: Pod = serde_json::from_value(pod_json)?;
        self.pods(&spec.namespace)
            .create(&PostParams::default(), &pod)
            .await?;

        debug!(namespace = %spec.namespace, pod = %spec.name, "helper pod submitted");

        Ok(())
    }

    async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HelperPodStatus>, K8sError> {
        let pod = self.pods(namespace).get_opt(name).await?;

        Ok(pod.as_ref().map(helper_pod_status))
    }

    async fn exec(
        &self,
        namespace: &str,
        name: &str,
        command: &[String],
    ) -> Result<ExecOutput, K8sError> {
        let params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut process = self.pods(namespace).exec(name, command.to_vec(), &params).await?;

        let status = process.take_status();
        let stdout = process.stdout();
        let stderr = process.stderr();
        let (stdout, stderr) = tokio::try_join!(read_stream(stdout), read_stream(stderr))
            .map_err(|err| K8sError::Exec(err.to_string()))?;

        let Some(status) = status else {
            return Err(K8sError::Exec("the exec stream carried no status channel".to_owned()));
        };
        let Some(status) = status.await else {
            return Err(K8sError::Exec("the exec stream closed without an exit status".to_owned()));
        };

        Ok(ExecOutput {
            exit_code: exit_code(&status),
            stdout,
            stderr,
        })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), K8sError> {
        let params = DeleteParams::default().grace_period(0);
        self.pods(namespace).delete(name, &params).await?;

        Ok(())
    }
}

async fn read_stream<R>(reader: Option<R>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buffer).await?;
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Extracts the process exit code from the status sent on the exec error channel.
fn exit_code(status: &Status) -> i32 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }

    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.trim().parse().ok())
        .unwrap_or(1)
}

fn claim_info(claim: &PersistentVolumeClaim) -> ClaimInfo {
    let spec = claim.spec.as_ref();
    let status = claim.status.as_ref();

    ClaimInfo {
        namespace: claim.namespace().unwrap_or_default(),
        name: claim.name_any(),
        uid: claim.uid().unwrap_or_default(),
        phase: status
            .and_then(|status| status.phase.clone())
            .unwrap_or_else(|| "Unknown".to_owned()),
        capacity: status
            .and_then(|status| status.capacity.as_ref())
            .and_then(|capacity| capacity.get("storage"))
            .map(|quantity| quantity.0.clone()),
        storage_class: spec.and_then(|spec| spec.storage_class_name.clone()),
        access_modes: spec
            .and_then(|spec| spec.access_modes.clone())
            .unwrap_or_default(),
        volume_name: spec.and_then(|spec| spec.volume_name.clone()),
    }
}

fn pod_info(pod: &Pod) -> PodInfo {
    let spec = pod.spec.as_ref();

    let claim_names = spec
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|volume| volume.persistent_volume_claim.as_ref())
                .map(|source| source.claim_name.clone())
                .collect()
        })
        .unwrap_or_default();

    let owner_references = pod
        .owner_references()
        .iter()
        .map(|reference| OwnerReference {
            kind: reference.kind.clone(),
            name: reference.name.clone(),
            controller: reference.controller.unwrap_or(false),
        })
        .collect();

    PodInfo {
        namespace: pod.namespace().unwrap_or_default(),
        name: pod.name_any(),
        phase: pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map(PodPhase::from)
            .unwrap_or(PodPhase::Unknown),
        node_name: spec.and_then(|spec| spec.node_name.clone()),
        claim_names,
        owner_references,
    }
}

fn helper_pod_status(pod: &Pod) -> HelperPodStatus {
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|status| status.phase.as_deref())
        .map(PodPhase::from)
        .unwrap_or(PodPhase::Unknown);
    let conditions = status
        .and_then(|status| status.conditions.as_deref())
        .unwrap_or_default();

    let ready = conditions
        .iter()
        .find(|condition| condition.type_ == "Ready")
        .map(|condition| condition.status == "True");

    let unschedulable = conditions
        .iter()
        .find(|condition| condition.type_ == "PodScheduled" && condition.status == "False");

    let waiting = status
        .into_iter()
        .flat_map(|status| {
            let init = status.init_container_statuses.as_deref().unwrap_or_default();
            let main = status.container_statuses.as_deref().unwrap_or_default();
            init.iter().chain(main.iter())
        })
        .find_map(|container| container.state.as_ref()?.waiting.as_ref());

    let waiting_reason = waiting.map(|waiting| {
        waiting
            .reason
            .clone()
            .unwrap_or_else(|| "ContainerWaiting".to_owned())
    });

    let pending_hint = match (unschedulable, waiting) {
        (Some(condition), _) => {
            let reason = condition.reason.as_deref().unwrap_or("Unschedulable");
            Some(describe("pod unschedulable", reason, condition.message.as_deref()))
        }
        (None, Some(waiting)) => {
            let reason = waiting.reason.as_deref().unwrap_or("ContainerWaiting");
            Some(describe("container waiting", reason, waiting.message.as_deref()))
        }
        (None, None) => None,
    };

    HelperPodStatus {
        phase,
        ready,
        waiting_reason,
        pending_hint,
        unschedulable: unschedulable.is_some(),
    }
}

fn describe(prefix: &str, reason: &str, message: Option<&str>) -> String {
    match message.map(str::trim).filter(|message| !message.is_empty()) {
        Some(message) => format!("{prefix} ({reason}: {message})"),
        None => format!("{prefix} ({reason})"),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    use super::*;

    fn pod_from(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_exit_code_from_status() {
        let success = Status {
            status: Some("Success".to_owned()),
            ..Default::default()
        };
        assert_eq!(exit_code(&success), 0);

        let failure = Status {
            status: Some("Failure".to_owned()),
            reason: Some("NonZeroExitCode".to_owned()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_owned()),
                    message: Some("2".to_owned()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code(&failure), 2);
    }

    #[test]
    fn test_pod_info_collects_claims_and_owners() {
        let pod = pod_from(json!({
            "metadata": {
                "name": "web-5d9c-x2",
                "namespace": "apps",
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "ReplicaSet",
                    "name": "web-5d9c",
                    "uid": "1",
                    "controller": true,
                }],
            },
            "spec": {
                "nodeName": "node-a",
                "containers": [{ "name": "web" }],
                "volumes": [
                    { "name": "data", "persistentVolumeClaim": { "claimName": "data-pvc" } },
                    { "name": "tmp", "emptyDir": {} },
                ],
            },
            "status": { "phase": "Running" },
        }));

        let info = pod_info(&pod);
        assert_eq!(info.claim_names, vec!["data-pvc".to_owned()]);
        assert_eq!(info.phase, PodPhase::Running);
        assert_eq!(info.node_name.as_deref(), Some("node-a"));
        assert!(info.owner_references[0].controller);
    }

    #[test]
    fn test_helper_status_reports_unschedulable_hint() {
        let pod = pod_from(json!({
            "metadata": { "name": "helper" },
            "status": {
                "phase": "Pending",
                "conditions": [{
                    "type": "PodScheduled",
                    "status": "False",
                    "reason": "Unschedulable",
                    "message": "0/3 nodes are available",
                }],
            },
        }));

        let status = helper_pod_status(&pod);
        assert!(status.unschedulable);
        assert_eq!(
            status.pending_hint.as_deref(),
            Some("pod unschedulable (Unschedulable: 0/3 nodes are available)")
        );
    }

    #[test]
    fn test_helper_status_reports_waiting_reason() {
        let pod = pod_from(json!({
            "metadata": { "name": "helper" },
            "status": {
                "phase": "Pending",
                "containerStatuses": [{
                    "name": "backup-helper",
                    "image": "alpine:3.20",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": { "waiting": { "reason": "ImagePullBackOff" } },
                }],
            },
        }));

        let status = helper_pod_status(&pod);
        assert_eq!(status.waiting_reason.as_deref(), Some("ImagePullBackOff"));
        assert_eq!(
            status.pending_hint.as_deref(),
            Some("container waiting (ImagePullBackOff)")
        );
        assert!(!status.unschedulable);
    }
}
