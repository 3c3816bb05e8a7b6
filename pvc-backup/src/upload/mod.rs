//! Pushing finished archives to a remote destination.

mod ssh;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pvc_backup_config::shared::DestinationConfig;
use thiserror::Error;

pub use ssh::{SshUploader, normalize_remote_directory, remote_reference};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{binary} is required for remote uploads but was not found in PATH")]
    BinaryNotFound { binary: String },

    #[error("archive path {} has no file name", .0.display())]
    InvalidPath(PathBuf),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed: {message}")]
    Failed { program: String, message: String },

    #[error("upload did not finish within {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Pushes a local archive somewhere else and returns where it landed.
#[async_trait]
pub trait RemoteUploader: Send + Sync {
    /// Uploads `local_path` and returns a `<protocol>://<host><dir>/<file>` reference.
    async fn upload(&self, local_path: &Path) -> Result<String, UploadError>;

    /// Whether the local archive should be kept after a successful upload.
    fn keep_local_copy(&self) -> bool {
        false
    }
}

/// Builds the uploader for `destination`, or `None` for local-only backups.
pub fn uploader_from_config(destination: &DestinationConfig) -> Option<Arc<dyn RemoteUploader>> {
    match destination {
        DestinationConfig::Local => None,
        DestinationConfig::Remote(remote) => Some(Arc::new(SshUploader::new(remote.clone()))),
    }
}
