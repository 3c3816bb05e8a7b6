use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;
use tracing::debug;

use crate::catalog::{
    DiscoveryError, DiscoveryStage, OwnerCandidate, OwnerResolution, call_before,
};
use crate::k8s::{K8sClient, OwnerLookup, OwnerReference, PodInfo, controller_reference};

/// Maximum number of owner objects fetched while walking up from one pod.
pub const MAX_OWNER_DEPTH: usize = 5;

/// Where the owner walk for a single pod ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PodOwner {
    Resolved(OwnerCandidate),
    /// An intermediate object was missing or the depth limit was reached.
    Truncated,
}

/// Walks owner references from pods up to their top-level controller.
///
/// Owner objects are cached by `(namespace, kind, name)` for the lifetime of
/// the resolver, which is one discovery call.
pub(crate) struct OwnerResolver<'a> {
    client: &'a dyn K8sClient,
    deadline: Instant,
    cache: HashMap<(String, String, String), OwnerLookup>,
}

impl<'a> OwnerResolver<'a> {
    pub(crate) fn new(client: &'a dyn K8sClient, deadline: Instant) -> Self {
        Self {
            client,
            deadline,
            cache: HashMap::new(),
        }
    }

    /// Resolves the top-level owner of `pod`.
    ///
    /// A pod without owner references is its own owner. The walk stops at the
    /// first object with no owner references or whose kind cannot be fetched,
    /// and that object is the owner.
    pub(crate) async fn resolve_pod(&mut self, pod: &PodInfo) -> Result<PodOwner, DiscoveryError> {
        let Some(first) = controller_reference(&pod.owner_references) else {
            return Ok(PodOwner::Resolved(OwnerCandidate::new("Pod", &pod.name)));
        };

        let mut current = first.clone();
        for _ in 0..MAX_OWNER_DEPTH {
            match self.lookup(&pod.namespace, &current).await? {
                OwnerLookup::NotFound => {
                    debug!(
                        namespace = %pod.namespace,
                        pod = %pod.name,
                        kind = %current.kind,
                        name = %current.name,
                        "owner object is gone, truncating the owner chain"
                    );
                    return Ok(PodOwner::Truncated);
                }
                OwnerLookup::Unsupported => {
                    return Ok(PodOwner::Resolved(OwnerCandidate::from(&current)));
                }
                OwnerLookup::Found(references) => match controller_reference(&references) {
                    Some(parent) => current = parent.clone(),
                    None => return Ok(PodOwner::Resolved(OwnerCandidate::from(&current))),
                },
            }
        }

        debug!(
            namespace = %pod.namespace,
            pod = %pod.name,
            max_depth = MAX_OWNER_DEPTH,
            "owner chain exceeded the maximum depth"
        );

        Ok(PodOwner::Truncated)
    }

    async fn lookup(
        &mut self,
        namespace: &str,
        reference: &OwnerReference,
    ) -> Result<OwnerLookup, DiscoveryError> {
        let key = (
            namespace.to_owned(),
            reference.kind.clone(),
            reference.name.clone(),
        );
        if let Some(lookup) = self.cache.get(&key) {
            return Ok(lookup.clone());
        }

        let lookup = call_before(
            self.deadline,
            DiscoveryStage::OwnerFetch,
            self.client
                .get_owner(namespace, &reference.kind, &reference.name),
        )
        .await?;
        self.cache.insert(key, lookup.clone());

        Ok(lookup)
    }
}

/// Combines the owners of every pod mounting one claim.
///
/// Truncated pod resolutions only count when no pod resolved.
///
/// A chain cut short by a missing owner or the depth limit names no
/// controller, so it is not treated as a second candidate: one resolved pod
/// plus one truncated pod gives `Resolved`, not `Ambiguous`.
pub(crate) fn combine_owners(owners: &[PodOwner]) -> OwnerResolution {
    let resolved: BTreeSet<&OwnerCandidate> = owners
        .iter()
        .filter_map(|owner| match owner {
            PodOwner::Resolved(candidate) => Some(candidate),
            PodOwner::Truncated => None,
        })
        .collect();

    let mut candidates = resolved.into_iter().cloned();
    match (candidates.next(), candidates.next()) {
        (None, _) => OwnerResolution::Unknown,
        (Some(only), None) => OwnerResolution::Resolved(only),
        (Some(first), Some(second)) => {
            let mut all = vec![first, second];
            all.extend(candidates);
            OwnerResolution::Ambiguous(all)
        }
    }
}
