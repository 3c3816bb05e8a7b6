use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::k8s::{
    ClaimInfo, ExecOutput, HelperPodStatus, K8sClient, K8sError, OwnerLookup, OwnerReference,
    PodInfo, PodPhase, SUPPORTED_OWNER_KINDS,
};
use crate::runner::HelperWorkloadSpec;

fn api_error(code: u16, message: &str) -> K8sError {
    let reason = match code {
        403 => "Forbidden",
        404 => "NotFound",
        409 => "AlreadyExists",
        500 => "InternalError",
        _ => "Failure",
    };

    K8sError::Api {
        code,
        reason: reason.to_owned(),
        message: message.to_owned(),
    }
}

#[derive(Debug, Default)]
struct Inner {
    namespaces: Vec<String>,
    claims: Vec<ClaimInfo>,
    pods: Vec<PodInfo>,
    owners: HashMap<(String, String, String), Vec<OwnerReference>>,
    owner_errors: HashMap<(String, String), (u16, String)>,

    create_error: Option<(u16, String)>,
    ready_after_creations: u32,
    waiting_reason: Option<String>,
    exec_output: Option<ExecOutput>,
    delete_error: Option<(u16, String)>,
    delete_pod_delay: Option<Duration>,
    list_pods_delay: Option<Duration>,
    server_version_delay: Option<Duration>,

    created: Vec<HelperWorkloadSpec>,
    live_helpers: HashSet<(String, String)>,
    deleted: Vec<(String, String)>,
    exec_calls: Vec<(String, String, Vec<String>)>,
    server_version_calls: u32,
}

/// In-memory cluster with failure injection and call recording.
///
/// Helper pods become `Running` immediately unless
/// [`FakeK8sClient::set_ready_after_creations`] says otherwise, and the
/// archive command exits with status 0 unless an output is programmed.
#[derive(Debug, Default)]
pub struct FakeK8sClient {
    inner: Mutex<Inner>,
}

impl FakeK8sClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn add_namespace(&self, namespace: &str) {
        let mut inner = self.lock();
        if !inner.namespaces.iter().any(|ns| ns == namespace) {
            inner.namespaces.push(namespace.to_owned());
        }
    }

    /// Adds a claim, registering its namespace.
    pub fn add_claim(&self, claim: ClaimInfo) {
        self.add_namespace(&claim.namespace);
        self.lock().claims.push(claim);
    }

    pub fn remove_claim(&self, namespace: &str, name: &str) {
        self.lock()
            .claims
            .retain(|claim| !(claim.namespace == namespace && claim.name == name));
    }

    pub fn add_pod(&self, pod: PodInfo) {
        self.add_namespace(&pod.namespace);
        self.lock().pods.push(pod);
    }

    /// Registers an owner object with the given owner references.
    pub fn add_owner(&self, namespace: &str, kind: &str, name: &str, references: Vec<OwnerReference>) {
        self.lock().owners.insert(
            (namespace.to_owned(), kind.to_owned(), name.to_owned()),
            references,
        );
    }

    /// Makes fetching the owner `kind/name` fail with an API status.
    pub fn fail_owner_fetch(&self, kind: &str, name: &str, code: u16) {
        self.lock().owner_errors.insert(
            (kind.to_owned(), name.to_owned()),
            (code, format!("{kind} {name} cannot be read")),
        );
    }

    /// Makes every pod creation fail with an API status.
    pub fn fail_pod_creation(&self, code: u16, message: &str) {
        self.lock().create_error = Some((code, message.to_owned()));
    }

    /// Only the `n`-th and later created helper pods become ready; earlier ones
    /// stay `Pending` forever.
    pub fn set_ready_after_creations(&self, n: u32) {
        self.lock().ready_after_creations = n;
    }

    /// Keeps helper containers waiting with `reason`.
    pub fn set_waiting_reason(&self, reason: &str) {
        self.lock().waiting_reason = Some(reason.to_owned());
    }

    pub fn set_exec_output(&self, output: ExecOutput) {
        self.lock().exec_output = Some(output);
    }

    pub fn fail_pod_deletion(&self, code: u16, message: &str) {
        self.lock().delete_error = Some((code, message.to_owned()));
    }

    pub fn allow_pod_deletion(&self) {
        self.lock().delete_error = None;
    }

    pub fn set_delete_pod_delay(&self, delay: Duration) {
        self.lock().delete_pod_delay = Some(delay);
    }

    pub fn set_list_pods_delay(&self, delay: Duration) {
        self.lock().list_pods_delay = Some(delay);
    }

    pub fn set_server_version_delay(&self, delay: Duration) {
        self.lock().server_version_delay = Some(delay);
    }

    /// Every helper pod spec submitted, in order.
    pub fn created_pods(&self) -> Vec<HelperWorkloadSpec> {
        self.lock().created.clone()
    }

    /// Every successful deletion as `(namespace, name)`, in order.
    pub fn deleted_pods(&self) -> Vec<(String, String)> {
        self.lock().deleted.clone()
    }

    /// Helper pods created and not yet deleted, sorted by name.
    pub fn live_helper_pods(&self) -> Vec<String> {
        let mut pods: Vec<String> = self
            .lock()
            .live_helpers
            .iter()
            .map(|(_, name)| name.clone())
            .collect();
        pods.sort();
        pods
    }

    pub fn exec_calls(&self) -> Vec<(String, String, Vec<String>)> {
        self.lock().exec_calls.clone()
    }

    pub fn server_version_calls(&self) -> u32 {
        self.lock().server_version_calls
    }
}

#[async_trait]
impl K8sClient for FakeK8sClient {
    async fn server_version(&self) -> Result<String, K8sError> {
        let delay = {
            let mut inner = self.lock();
            inner.server_version_calls += 1;
            inner.server_version_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok("v1.30.0".to_owned())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, K8sError> {
        Ok(self.lock().namespaces.clone())
    }

    async fn list_claims(&self, namespace: Option<&str>) -> Result<Vec<ClaimInfo>, K8sError> {
        Ok(self
            .lock()
            .claims
            .iter()
            .filter(|claim| namespace.is_none_or(|ns| claim.namespace == ns))
            .cloned()
            .collect())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, K8sError> {
        Ok(self
            .lock()
            .claims
            .iter()
            .find(|claim| claim.namespace == namespace && claim.name == name)
            .cloned())
    }

    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodInfo>, K8sError> {
        let delay = self.lock().list_pods_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|pod| namespace.is_none_or(|ns| pod.namespace == ns))
            .cloned()
            .collect())
    }

    async fn get_owner(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<OwnerLookup, K8sError> {
        let inner = self.lock();
        if let Some((code, message)) = inner.owner_errors.get(&(kind.to_owned(), name.to_owned())) {
            return Err(api_error(*code, message));
        }
        if !SUPPORTED_OWNER_KINDS.contains(&kind) {
            return Ok(OwnerLookup::Unsupported);
        }

        let key = (namespace.to_owned(), kind.to_owned(), name.to_owned());
        Ok(match inner.owners.get(&key) {
            Some(references) => OwnerLookup::Found(references.clone()),
            None => OwnerLookup::NotFound,
        })
    }

    async fn create_pod(&self, spec: &HelperWorkloadSpec) -> Result<(), K8sError> {
        let mut inner = self.lock();
        inner.created.push(spec.clone());
        if let Some((code, message)) = &inner.create_error {
            return Err(api_error(*code, message));
        }
        inner
            .live_helpers
            .insert((spec.namespace.clone(), spec.name.clone()));

        Ok(())
    }

    async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HelperPodStatus>, K8sError> {
        let inner = self.lock();
        if !inner
            .live_helpers
            .contains(&(namespace.to_owned(), name.to_owned()))
        {
            return Ok(None);
        }

        let creation = inner
            .created
            .iter()
            .position(|spec| spec.namespace == namespace && spec.name == name)
            .map_or(0, |index| index as u32 + 1);

        if let Some(reason) = &inner.waiting_reason {
            return Ok(Some(HelperPodStatus {
                phase: PodPhase::Pending,
                ready: Some(false),
                waiting_reason: Some(reason.clone()),
                pending_hint: Some(format!("container waiting ({reason})")),
                unschedulable: false,
            }));
        }

        if creation < inner.ready_after_creations {
            return Ok(Some(HelperPodStatus {
                phase: PodPhase::Pending,
                ready: None,
                waiting_reason: None,
                pending_hint: Some(
                    "pod unschedulable (Unschedulable: 0/3 nodes are available)".to_owned(),
                ),
                unschedulable: true,
            }));
        }

        Ok(Some(HelperPodStatus {
            phase: PodPhase::Running,
            ready: Some(true),
            waiting_reason: None,
            pending_hint: None,
            unschedulable: false,
        }))
    }

    async fn exec(
        &self,
        namespace: &str,
        name: &str,
        command: &[String],
    ) -> Result<ExecOutput, K8sError> {
        let mut inner = self.lock();
        inner
            .exec_calls
            .push((namespace.to_owned(), name.to_owned(), command.to_vec()));

        Ok(inner.exec_output.clone().unwrap_or(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), K8sError> {
        let delay = self.lock().delete_pod_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if let Some((code, message)) = &inner.delete_error {
            return Err(api_error(*code, message));
        }

        let key = (namespace.to_owned(), name.to_owned());
        if !inner.live_helpers.remove(&key) {
            return Err(api_error(404, &format!("pods \"{name}\" not found")));
        }
        inner.deleted.push(key);

        Ok(())
    }
}
