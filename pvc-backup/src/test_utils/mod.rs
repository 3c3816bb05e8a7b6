//! Fakes and fixtures shared by unit and integration tests.
//!
//! Nothing here talks to a real cluster or spawns processes. The fakes record
//! every call so tests can assert on side effects such as pod deletions.

pub mod fixtures;
pub mod k8s;
pub mod transfer;

pub use fixtures::*;
pub use k8s::FakeK8sClient;
pub use transfer::{FakeCopyTransport, FakeUploader};
