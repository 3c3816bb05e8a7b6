//! Volume discovery with owner resolution.

mod owner;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::k8s::{ClaimInfo, K8sClient, K8sError, OwnerReference, PodInfo};

pub use owner::MAX_OWNER_DEPTH;
use owner::{OwnerResolver, PodOwner, combine_owners};

/// The API call a discovery error or timeout happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStage {
    NamespaceList,
    ClaimList,
    PodList,
    OwnerFetch,
}

impl DiscoveryStage {
    fn hint(&self) -> &'static str {
        match self {
            DiscoveryStage::NamespaceList => {
                "Confirm cluster connectivity and RBAC verbs for namespaces."
            }
            DiscoveryStage::ClaimList => {
                "Check namespace spelling, API reachability and RBAC verbs for persistentvolumeclaims."
            }
            DiscoveryStage::PodList => {
                "Check RBAC verbs for pods and confirm the namespace still exists."
            }
            DiscoveryStage::OwnerFetch => {
                "Verify RBAC allows get on the owning controllers and retry discovery."
            }
        }
    }
}

impl fmt::Display for DiscoveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            DiscoveryStage::NamespaceList => "namespace list",
            DiscoveryStage::ClaimList => "claim list",
            DiscoveryStage::PodList => "pod list",
            DiscoveryStage::OwnerFetch => "owner fetch",
        };
        f.write_str(stage)
    }
}

/// Errors that abort a discovery call. No partial result is returned.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery exceeded its time budget during {stage}")]
    Timeout { stage: DiscoveryStage },

    #[error("discovery failed during {stage}: {source}. {hint}")]
    Api {
        stage: DiscoveryStage,
        hint: &'static str,
        #[source]
        source: K8sError,
    },

    #[error(
        "discovery would scan {requested} namespaces, which exceeds the configured limit of {limit}. Apply a namespace filter or increase the limit"
    )]
    ScanLimitExceeded { requested: usize, limit: usize },
}

impl DiscoveryError {
    /// The API call the error happened in, when there was one.
    pub fn stage(&self) -> Option<DiscoveryStage> {
        match self {
            DiscoveryError::Timeout { stage } | DiscoveryError::Api { stage, .. } => Some(*stage),
            DiscoveryError::ScanLimitExceeded { .. } => None,
        }
    }
}

/// Runs one discovery API call against the shared deadline.
pub(crate) async fn call_before<T, F>(
    deadline: Instant,
    stage: DiscoveryStage,
    call: F,
) -> Result<T, DiscoveryError>
where
    F: Future<Output = Result<T, K8sError>>,
{
    match tokio::time::timeout_at(deadline, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(DiscoveryError::Api {
            stage,
            hint: stage.hint(),
            source,
        }),
        Err(_) => Err(DiscoveryError::Timeout { stage }),
    }
}

/// A workload a claim belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerCandidate {
    pub kind: String,
    pub name: String,
}

impl OwnerCandidate {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl From<&OwnerReference> for OwnerCandidate {
    fn from(reference: &OwnerReference) -> Self {
        Self::new(&reference.kind, &reference.name)
    }
}

impl fmt::Display for OwnerCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Which workload a claim belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerResolution {
    Resolved(OwnerCandidate),
    /// No pod mounts the claim, or every owner chain was truncated.
    Unknown,
    /// Pods mounting the claim belong to different workloads, listed once each
    /// and sorted by kind then name.
    Ambiguous(Vec<OwnerCandidate>),
}

impl fmt::Display for OwnerResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerResolution::Resolved(candidate) => write!(f, "{candidate}"),
            OwnerResolution::Unknown => f.write_str("Unknown"),
            OwnerResolution::Ambiguous(candidates) => {
                let names: Vec<String> = candidates.iter().map(ToString::to_string).collect();
                write!(f, "Multiple[{}]", names.join(", "))
            }
        }
    }
}

/// A claim together with its resolved owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub phase: String,
    pub capacity: Option<String>,
    pub storage_class: Option<String>,
    pub access_modes: Vec<String>,
    pub bound_volume: Option<String>,
    pub owner: OwnerResolution,
    pub last_successful_backup_at: Option<DateTime<Utc>>,
}

impl VolumeRecord {
    pub fn from_claim(claim: ClaimInfo, owner: OwnerResolution) -> Self {
        Self {
            namespace: claim.namespace,
            name: claim.name,
            uid: claim.uid,
            phase: claim.phase,
            capacity: claim.capacity,
            storage_class: claim.storage_class,
            access_modes: claim.access_modes,
            bound_volume: claim.volume_name,
            owner,
            last_successful_backup_at: None,
        }
    }

    /// `namespace/name`, used in logs and listings.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Which namespaces a discovery call covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryScope {
    AllNamespaces,
    Namespaces(Vec<String>),
}

impl DiscoveryScope {
    /// Builds a scope from a possibly empty namespace filter.
    ///
    /// Blank entries are dropped and duplicates removed; an empty filter means
    /// every namespace.
    pub fn from_filter<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let namespaces: BTreeSet<String> = namespaces
            .into_iter()
            .map(|namespace| namespace.as_ref().trim().to_owned())
            .filter(|namespace| !namespace.is_empty())
            .collect();

        if namespaces.is_empty() {
            DiscoveryScope::AllNamespaces
        } else {
            DiscoveryScope::Namespaces(namespaces.into_iter().collect())
        }
    }
}

/// Object counts for a cluster overview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSummary {
    pub namespaces: usize,
    pub pods: usize,
    pub claims: usize,
}

/// Lists claims and resolves which workload owns each of them.
#[derive(Clone)]
pub struct VolumeCatalog {
    client: Arc<dyn K8sClient>,
    max_namespace_scan: usize,
}

impl VolumeCatalog {
    pub fn new(client: Arc<dyn K8sClient>, max_namespace_scan: usize) -> Self {
        Self {
            client,
            max_namespace_scan,
        }
    }

    /// Discovers the claims in `scope`, sorted by namespace then name.
    ///
    /// Every API call, owner lookups included, runs against one deadline
    /// `budget` from now.
    pub async fn discover(
        &self,
        scope: DiscoveryScope,
        budget: Duration,
    ) -> Result<Vec<VolumeRecord>, DiscoveryError> {
        let deadline = Instant::now() + budget;
        let client = self.client.as_ref();

        let (claims, pods) = match &scope {
            DiscoveryScope::AllNamespaces => {
                let namespaces =
                    call_before(deadline, DiscoveryStage::NamespaceList, client.list_namespaces())
                        .await?;
                self.check_scan_limit(namespaces.len())?;

                let claims =
                    call_before(deadline, DiscoveryStage::ClaimList, client.list_claims(None))
                        .await?;
                let pods =
                    call_before(deadline, DiscoveryStage::PodList, client.list_pods(None)).await?;
                (claims, pods)
            }
            DiscoveryScope::Namespaces(namespaces) => {
                self.check_scan_limit(namespaces.len())?;

                let mut claims = Vec::new();
                let mut pods = Vec::new();
                for namespace in namespaces {
                    claims.extend(
                        call_before(
                            deadline,
                            DiscoveryStage::ClaimList,
                            client.list_claims(Some(namespace.as_str())),
                        )
                        .await?,
                    );
                    pods.extend(
                        call_before(
                            deadline,
                            DiscoveryStage::PodList,
                            client.list_pods(Some(namespace.as_str())),
                        )
                        .await?,
                    );
                }
                (claims, pods)
            }
        };

        let mut records = self.resolve_owners(claims, &pods, deadline).await?;
        records.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

        info!(
            scope = ?scope,
            claims = records.len(),
            pods = pods.len(),
            "volume discovery finished"
        );

        Ok(records)
    }

    /// Counts namespaces, pods and claims in the cluster.
    pub async fn summary(&self, budget: Duration) -> Result<ClusterSummary, DiscoveryError> {
        let deadline = Instant::now() + budget;
        let client = self.client.as_ref();

        let namespaces =
            call_before(deadline, DiscoveryStage::NamespaceList, client.list_namespaces()).await?;
        let pods = call_before(deadline, DiscoveryStage::PodList, client.list_pods(None)).await?;
        let claims =
            call_before(deadline, DiscoveryStage::ClaimList, client.list_claims(None)).await?;

        Ok(ClusterSummary {
            namespaces: namespaces.len(),
            pods: pods.len(),
            claims: claims.len(),
        })
    }

    fn check_scan_limit(&self, requested: usize) -> Result<(), DiscoveryError> {
        if requested > self.max_namespace_scan {
            warn!(
                requested,
                limit = self.max_namespace_scan,
                "namespace scan limit exceeded"
            );
            return Err(DiscoveryError::ScanLimitExceeded {
                requested,
                limit: self.max_namespace_scan,
            });
        }

        Ok(())
    }

    async fn resolve_owners(
        &self,
        claims: Vec<ClaimInfo>,
        pods: &[PodInfo],
        deadline: Instant,
    ) -> Result<Vec<VolumeRecord>, DiscoveryError> {
        // Claim → indices of the pods mounting it.
        let mut consumers: HashMap<(&str, &str), Vec<usize>> = HashMap::new();
        for (index, pod) in pods.iter().enumerate() {
            for claim_name in &pod.claim_names {
                consumers
                    .entry((pod.namespace.as_str(), claim_name.as_str()))
                    .or_default()
                    .push(index);
            }
        }

        let mut resolver = OwnerResolver::new(self.client.as_ref(), deadline);
        let mut pod_owners: HashMap<usize, PodOwner> = HashMap::new();
        let mut records = Vec::with_capacity(claims.len());

        for claim in claims {
            let pod_indices = consumers
                .get(&(claim.namespace.as_str(), claim.name.as_str()))
                .cloned()
                .unwrap_or_default();

            let mut owners = Vec::with_capacity(pod_indices.len());
            for index in pod_indices {
                let owner = match pod_owners.get(&index) {
                    Some(owner) => owner.clone(),
                    None => {
                        let owner = resolver.resolve_pod(&pods[index]).await?;
                        pod_owners.insert(index, owner.clone());
                        owner
                    }
                };
                owners.push(owner);
            }

            records.push(VolumeRecord::from_claim(claim, combine_owners(&owners)));
        }

        Ok(records)
    }
}

/// Fills `last_successful_backup_at` from a history lookup keyed by
/// `(namespace, claim name)`.
pub fn annotate_last_success(
    records: &mut [VolumeRecord],
    last_success: &HashMap<(String, String), DateTime<Utc>>,
) {
    for record in records {
        record.last_successful_backup_at = last_success
            .get(&(record.namespace.clone(), record.name.clone()))
            .copied();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_from_filter() {
        assert_eq!(
            DiscoveryScope::from_filter(Vec::<String>::new()),
            DiscoveryScope::AllNamespaces
        );
        assert_eq!(
            DiscoveryScope::from_filter([" apps ", "", "db", "apps"]),
            DiscoveryScope::Namespaces(vec!["apps".to_owned(), "db".to_owned()])
        );
    }

    #[test]
    fn test_owner_resolution_display() {
        let ambiguous = OwnerResolution::Ambiguous(vec![
            OwnerCandidate::new("Deployment", "web"),
            OwnerCandidate::new("StatefulSet", "db"),
        ]);
        assert_eq!(
            ambiguous.to_string(),
            "Multiple[Deployment/web, StatefulSet/db]"
        );
        assert_eq!(OwnerResolution::Unknown.to_string(), "Unknown");
    }
}
