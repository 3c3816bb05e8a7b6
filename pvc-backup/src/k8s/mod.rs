//! Kubernetes integration for the backup pipeline.
//!
//! Every cluster call made by the crate goes through the [`K8sClient`] trait,
//! which speaks in the small typed records defined in [`base`] rather than raw
//! API objects. Loosely typed fields (phases, owner references, container
//! states) are interpreted once at this boundary so the rest of the crate never
//! inspects untyped API payloads.
//!
//! The production client, [`http::HttpK8sClient`], is backed by the [`kube`]
//! crate. Tests use the fake in `test_utils`.

mod base;
pub mod http;

pub use base::*;
