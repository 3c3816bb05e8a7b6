use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::auth::TransportSettings;
use crate::transfer::{CopyTransport, TransferError};

/// Copies files out of pods with `kubectl cp`.
///
/// The kubeconfig and context come from the credential context, so the copy
/// talks to the same cluster as the API client whatever the auth mode.
#[derive(Debug, Clone)]
pub struct KubectlCopyTransport {
    binary: String,
    settings: TransportSettings,
}

impl KubectlCopyTransport {
    pub fn new(binary: impl Into<String>, settings: TransportSettings) -> Self {
        Self {
            binary: binary.into(),
            settings,
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf, TransferError> {
        which::which(&self.binary).map_err(|_| TransferError::BinaryNotFound {
            binary: self.binary.clone(),
        })
    }
}

#[async_trait]
impl CopyTransport for KubectlCopyTransport {
    async fn copy_from_pod(
        &self,
        namespace: &str,
        pod: &str,
        in_pod_path: &str,
        local_path: &Path,
    ) -> Result<(), TransferError> {
        let binary = self.resolve_binary()?;
        let args = kubectl_cp_args(&self.settings, namespace, pod, in_pod_path, local_path);

        debug!(binary = %binary.display(), ?args, "running kubectl cp");

        let output = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(TransferError::Spawn)?;

        if !output.status.success() {
            return Err(TransferError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(())
    }
}

/// Arguments for `kubectl cp` copying `pod:in_pod_path` to `local_path`.
pub fn kubectl_cp_args(
    settings: &TransportSettings,
    namespace: &str,
    pod: &str,
    in_pod_path: &str,
    local_path: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if let Some(kubeconfig) = &settings.kubeconfig_path {
        args.push("--kubeconfig".into());
        args.push(kubeconfig.as_os_str().to_owned());
    }
    if let Some(context) = &settings.context {
        args.push("--context".into());
        args.push(context.into());
    }
    args.push("-n".into());
    args.push(namespace.into());
    args.push("cp".into());
    args.push(format!("{pod}:{in_pod_path}").into());
    args.push(local_path.as_os_str().to_owned());

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_include_kubeconfig_and_context() {
        let settings = TransportSettings {
            kubeconfig_path: Some(PathBuf::from("/tmp/kubeconfig")),
            context: Some("prod".to_owned()),
        };

        let args = kubectl_cp_args(
            &settings,
            "apps",
            "helper-1",
            "/tmp/a.tar.gz",
            Path::new("/backups/a.tar.gz"),
        );

        assert_eq!(
            args,
            [
                "--kubeconfig",
                "/tmp/kubeconfig",
                "--context",
                "prod",
                "-n",
                "apps",
                "cp",
                "helper-1:/tmp/a.tar.gz",
                "/backups/a.tar.gz",
            ]
            .map(OsString::from)
        );
    }

    #[test]
    fn test_args_without_settings() {
        let args = kubectl_cp_args(
            &TransportSettings::default(),
            "apps",
            "helper-1",
            "/tmp/a.tar.gz",
            Path::new("a.tar.gz"),
        );

        assert_eq!(args[0], "-n");
        assert_eq!(args.len(), 5);
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let transport = KubectlCopyTransport::new(
            "definitely-not-a-kubectl-binary",
            TransportSettings::default(),
        );

        let err = transport
            .copy_from_pod("apps", "helper", "/tmp/a", Path::new("/tmp/a"))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::BinaryNotFound { .. }));
    }
}
