use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::k8s::K8sClient;
use crate::orchestrator::{BackupStage, StageFailure};

/// What releasing a lease did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// No pod was ever created.
    Noop,
    Deleted(String),
    /// The pod was already gone.
    AlreadyGone(String),
}

/// Ownership of the helper pods created for one attempt.
///
/// The orchestrator always calls [`HelperLease::release`] once the attempt is
/// over. If the attempt future is dropped before that, for example because the
/// whole batch was aborted, `Drop` spawns a best-effort deletion instead.
///
/// A pod stays tracked until its deletion is confirmed, so an interrupted or
/// failed deletion is retried by `release` or `Drop`.
pub struct HelperLease {
    client: Arc<dyn K8sClient>,
    namespace: String,
    pod: Option<String>,
    /// Pods from earlier start-up attempts whose deletion did not finish.
    discarded: Vec<String>,
    cleanup_timeout: Duration,
}

impl HelperLease {
    pub fn new(client: Arc<dyn K8sClient>, namespace: &str, cleanup_timeout: Duration) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
            pod: None,
            discarded: Vec::new(),
            cleanup_timeout,
        }
    }

    /// The pod currently held, if any.
    pub fn pod_name(&self) -> Option<&str> {
        self.pod.as_deref()
    }

    pub(crate) fn track(&mut self, pod: String) {
        if let Some(previous) = self.pod.replace(pod) {
            self.discarded.push(previous);
        }
    }

    /// Deletes the held pod between start-up attempts.
    ///
    /// A failed deletion is logged and the pod is kept for [`HelperLease::release`].
    pub(crate) async fn discard(&mut self) {
        let Some(pod) = self.pod.clone() else {
            return;
        };

        match self.delete(&pod).await {
            Ok(_) => self.pod = None,
            Err(message) => {
                warn!(namespace = %self.namespace, pod = %pod, error = %message, "failed to discard helper pod");
                self.discarded.extend(self.pod.take());
            }
        }
    }

    /// Deletes every pod still held with a zero grace period.
    ///
    /// A pod that is already gone counts as deleted. Without a pod this is a
    /// no-op. The outcome reports the most recent pod; the first failure wins.
    pub async fn release(&mut self) -> Result<CleanupOutcome, StageFailure> {
        let pods: Vec<String> = self
            .discarded
            .iter()
            .cloned()
            .chain(self.pod.clone())
            .collect();

        let mut outcome = CleanupOutcome::Noop;
        let mut failure = None;
        for pod in pods {
            match self.delete(&pod).await {
                Ok(true) => {
                    info!(namespace = %self.namespace, pod = %pod, "helper pod deleted");
                    self.forget(&pod);
                    outcome = CleanupOutcome::Deleted(pod);
                }
                Ok(false) => {
                    self.forget(&pod);
                    outcome = CleanupOutcome::AlreadyGone(pod);
                }
                Err(message) => {
                    failure.get_or_insert(message);
                }
            }
        }

        match failure {
            Some(message) => Err(StageFailure::new(BackupStage::Cleanup, message)),
            None => Ok(outcome),
        }
    }

    /// Deletes `pod`, returning `false` when it was already gone.
    async fn delete(&self, pod: &str) -> Result<bool, String> {
        let deletion = self.client.delete_pod(&self.namespace, pod);
        match tokio::time::timeout(self.cleanup_timeout, deletion).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(err)) if err.is_not_found() => Ok(false),
            Ok(Err(err)) => Err(format!(
                "failed to delete helper pod {}/{pod}: {err}",
                self.namespace
            )),
            Err(_) => Err(format!(
                "deleting helper pod {}/{pod} did not finish within {}s",
                self.namespace,
                self.cleanup_timeout.as_secs()
            )),
        }
    }

    fn forget(&mut self, pod: &str) {
        if self.pod.as_deref() == Some(pod) {
            self.pod = None;
        }
        self.discarded.retain(|discarded| discarded != pod);
    }
}

impl Drop for HelperLease {
    fn drop(&mut self) {
        let mut pods = std::mem::take(&mut self.discarded);
        pods.extend(self.pod.take());
        if pods.is_empty() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(namespace = %self.namespace, pods = ?pods, "no runtime to delete abandoned helper pods");
            return;
        };

        warn!(namespace = %self.namespace, pods = ?pods, "helper lease dropped before release, deleting pods in background");

        let client = self.client.clone();
        let namespace = self.namespace.clone();
        let timeout = self.cleanup_timeout;
        handle.spawn(async move {
            for pod in pods {
                let deletion = client.delete_pod(&namespace, &pod);
                if let Ok(Err(err)) = tokio::time::timeout(timeout, deletion).await
                    && !err.is_not_found()
                {
                    warn!(namespace = %namespace, pod = %pod, error = %err, "background helper pod deletion failed");
                }
            }
        });
    }
}
