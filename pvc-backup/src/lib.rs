//! Point-in-time backups of Kubernetes persistent volume claims.
//!
//! The crate inventories claims in a cluster, resolves which workload owns each
//! of them and archives a claim by running a short-lived helper pod that mounts
//! it read-only. The archive is copied out of the pod, verified with SHA-256 and
//! optionally pushed to a remote host.
//!
//! The main entry points are:
//!
//! - [`auth::AuthResolver`] turns operator supplied credentials into a shared
//!   [`auth::CredentialContext`].
//! - [`catalog::VolumeCatalog`] lists claims and their owners.
//! - [`orchestrator::BackupOrchestrator`] runs one [`orchestrator::BackupAttempt`]
//!   per volume, sequentially or with a bounded worker pool.
//!
//! All cluster access goes through the [`k8s::K8sClient`] trait so every stage
//! can be exercised against the in-memory fakes in `test_utils`.

pub mod auth;
pub mod catalog;
pub mod concurrency;
pub mod history;
pub mod k8s;
pub mod naming;
pub mod orchestrator;
pub mod runner;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transfer;
pub mod upload;
