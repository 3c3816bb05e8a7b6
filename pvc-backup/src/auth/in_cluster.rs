use std::path::PathBuf;

use serde_json::json;

use crate::auth::AuthError;

/// Where Kubernetes mounts the pod's service account credentials.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const IN_CLUSTER_NAME: &str = "in-cluster";
const SERVICE_ACCOUNT_USER: &str = "service-account";

/// The service account artifacts and API endpoint visible to this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InClusterEnvironment {
    pub token_path: PathBuf,
    pub ca_path: PathBuf,
    pub service_host: Option<String>,
    pub service_port: Option<String>,
}

impl InClusterEnvironment {
    /// Reads the standard mount paths and `KUBERNETES_SERVICE_*` variables.
    pub fn from_process() -> Self {
        let non_empty = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        Self {
            token_path: PathBuf::from(SERVICE_ACCOUNT_DIR).join("token"),
            ca_path: PathBuf::from(SERVICE_ACCOUNT_DIR).join("ca.crt"),
            service_host: non_empty("KUBERNETES_SERVICE_HOST"),
            service_port: non_empty("KUBERNETES_SERVICE_PORT_HTTPS")
                .or_else(|| non_empty("KUBERNETES_SERVICE_PORT")),
        }
    }

    /// Whether this process looks like it runs inside a pod.
    pub fn is_available(&self) -> bool {
        self.service_host.is_some() && self.token_path.is_file()
    }

    /// `https://<host>:<port>`, bracketing IPv6 hosts.
    pub fn server_url(&self) -> Result<String, AuthError> {
        let host = self.service_host.as_deref().ok_or_else(|| {
            AuthError::MissingCredential(
                "KUBERNETES_SERVICE_HOST is not set; in-cluster auth only works inside a pod"
                    .to_owned(),
            )
        })?;
        let port = self.service_port.as_deref().unwrap_or("443");

        if host.contains(':') && !host.starts_with('[') {
            Ok(format!("https://[{host}]:{port}"))
        } else {
            Ok(format!("https://{host}:{port}"))
        }
    }

    /// Synthesizes a kubeconfig referencing the mounted token and CA bundle.
    ///
    /// The token is referenced by path so that kubelet rotations are picked
    /// up without rebuilding the client.
    pub fn kubeconfig(&self) -> Result<String, AuthError> {
        if !self.token_path.is_file() {
            return Err(AuthError::MissingCredential(format!(
                "service account token not found at {}",
                self.token_path.display()
            )));
        }
        if !self.ca_path.is_file() {
            return Err(AuthError::MissingCredential(format!(
                "service account CA bundle not found at {}",
                self.ca_path.display()
            )));
        }
        let server = self.server_url()?;

        let document = json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": IN_CLUSTER_NAME,
                "cluster": {
                    "server": server,
                    "certificate-authority": self.ca_path.display().to_string(),
                },
            }],
            "users": [{
                "name": SERVICE_ACCOUNT_USER,
                "user": {
                    "tokenFile": self.token_path.display().to_string(),
                },
            }],
            "contexts": [{
                "name": IN_CLUSTER_NAME,
                "context": {
                    "cluster": IN_CLUSTER_NAME,
                    "user": SERVICE_ACCOUNT_USER,
                },
            }],
            "current-context": IN_CLUSTER_NAME,
        });

        serde_yaml::to_string(&document).map_err(|err| {
            AuthError::MalformedConfig(format!("failed to render in-cluster kubeconfig: {err}"))
        })
    }
}
