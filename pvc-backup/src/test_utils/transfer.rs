use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::transfer::{CopyTransport, TransferError};
use crate::upload::{RemoteUploader, UploadError};

/// Writes fixed bytes to the local path instead of running `kubectl cp`.
#[derive(Debug)]
pub struct FakeCopyTransport {
    content: Vec<u8>,
    failure: Option<String>,
    calls: Mutex<Vec<(String, String, String, PathBuf)>>,
}

impl FakeCopyTransport {
    pub fn with_content(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            failure: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A transport whose copy process always fails with `stderr`.
    pub fn failing(stderr: &str) -> Self {
        Self {
            content: Vec::new(),
            failure: Some(stderr.to_owned()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(namespace, pod, in_pod_path, local_path)` per call.
    pub fn calls(&self) -> Vec<(String, String, String, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CopyTransport for FakeCopyTransport {
    async fn copy_from_pod(
        &self,
        namespace: &str,
        pod: &str,
        in_pod_path: &str,
        local_path: &Path,
    ) -> Result<(), TransferError> {
        self.calls.lock().unwrap().push((
            namespace.to_owned(),
            pod.to_owned(),
            in_pod_path.to_owned(),
            local_path.to_owned(),
        ));

        if let Some(stderr) = &self.failure {
            return Err(TransferError::Failed {
                code: Some(1),
                stderr: stderr.clone(),
            });
        }

        tokio::fs::write(local_path, &self.content).await?;

        Ok(())
    }
}

/// Pretends to push archives to `scp://backup.example.com/archives`.
#[derive(Debug, Default)]
pub struct FakeUploader {
    keep_local_copy: bool,
    failure: Option<String>,
    uploads: Mutex<Vec<PathBuf>>,
}

impl FakeUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keeping_local_copy() -> Self {
        Self {
            keep_local_copy: true,
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_owned()),
            ..Self::default()
        }
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteUploader for FakeUploader {
    async fn upload(&self, local_path: &Path) -> Result<String, UploadError> {
        self.uploads.lock().unwrap().push(local_path.to_owned());

        if let Some(message) = &self.failure {
            return Err(UploadError::Failed {
                program: "scp".to_owned(),
                message: message.clone(),
            });
        }

        let name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::InvalidPath(local_path.to_owned()))?;

        Ok(format!("scp://backup.example.com/archives/{name}"))
    }

    fn keep_local_copy(&self) -> bool {
        self.keep_local_copy
    }
}
