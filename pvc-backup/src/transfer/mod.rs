//! Moving the archive out of the helper pod and verifying it.

mod kubectl;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

pub use kubectl::{KubectlCopyTransport, kubectl_cp_args};

/// Read buffer size used while hashing archives.
const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{binary} not found in PATH")]
    BinaryNotFound { binary: String },

    #[error("failed to start the copy process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("copy process exited with {}: {stderr}", exit_description(.code))]
    Failed { code: Option<i32>, stderr: String },

    #[error("copy did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive {} does not exist", .0.display())]
    MissingArchive(PathBuf),

    #[error("archive {} is empty", .0.display())]
    EmptyArchive(PathBuf),

    #[error("digest mismatch: helper reported {expected}, local copy is {actual}")]
    DigestMismatch { expected: String, actual: String },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_owned(),
    }
}

/// Copies a file out of a running pod onto the local filesystem.
#[async_trait]
pub trait CopyTransport: Send + Sync {
    async fn copy_from_pod(
        &self,
        namespace: &str,
        pod: &str,
        in_pod_path: &str,
        local_path: &Path,
    ) -> Result<(), TransferError>;
}

/// Copies archives into the backup directory and computes their digests.
#[derive(Clone)]
pub struct ArchiveTransferer {
    transport: Arc<dyn CopyTransport>,
    backup_dir: PathBuf,
    copy_timeout: Duration,
}

impl ArchiveTransferer {
    pub fn new(transport: Arc<dyn CopyTransport>, backup_dir: PathBuf, copy_timeout: Duration) -> Self {
        Self {
            transport,
            backup_dir,
            copy_timeout,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Copies `in_pod_path` from `pod` to `<backup_dir>/<archive_name>`.
    ///
    /// A partially written file is removed when the copy fails.
    pub async fn copy(
        &self,
        namespace: &str,
        pod: &str,
        in_pod_path: &str,
        archive_name: &str,
    ) -> Result<PathBuf, TransferError> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let local_path = self.backup_dir.join(archive_name);

        debug!(namespace, pod, in_pod_path, local_path = %local_path.display(), "copying archive");

        let copy = self
            .transport
            .copy_from_pod(namespace, pod, in_pod_path, &local_path);
        let result = match tokio::time::timeout(self.copy_timeout, copy).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(self.copy_timeout)),
        };

        if let Err(err) = result {
            if let Err(remove_err) = tokio::fs::remove_file(&local_path).await
                && remove_err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %local_path.display(), error = %remove_err, "failed to remove partial archive");
            }
            return Err(err);
        }

        info!(namespace, pod, path = %local_path.display(), "archive copied");

        Ok(local_path)
    }

    /// Streams the file at `path` through SHA-256 and returns the hex digest.
    ///
    /// Missing and zero-byte files are rejected, as is a digest differing from
    /// `expected`.
    pub async fn digest(&self, path: &Path, expected: Option<&str>) -> Result<String, TransferError> {
        let actual = file_digest(path).await?;

        if let Some(expected) = expected
            && !expected.eq_ignore_ascii_case(&actual)
        {
            return Err(TransferError::DigestMismatch {
                expected: expected.to_owned(),
                actual,
            });
        }

        Ok(actual)
    }
}

/// Hex encoded SHA-256 of a non-empty file.
pub async fn file_digest(path: &Path) -> Result<String, TransferError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransferError::MissingArchive(path.to_owned()));
        }
        Err(err) => return Err(err.into()),
    };
    if !metadata.is_file() {
        return Err(TransferError::MissingArchive(path.to_owned()));
    }
    if metadata.len() == 0 {
        return Err(TransferError::EmptyArchive(path.to_owned()));
    }

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DIGEST_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
