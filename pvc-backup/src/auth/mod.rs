//! Turning operator supplied credentials into a verified cluster client.
//!
//! Three modes are supported: the pod's own service account (`in-cluster`), a
//! kubeconfig file on disk (`kubeconfig-path`) and kubeconfig content handed
//! over directly (`pasted-kubeconfig`). Every mode is validated locally before
//! the API server is contacted, and the resulting [`CredentialContext`] is only
//! returned once a version request succeeded.

pub mod in_cluster;
pub mod kubeconfig;

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kube::config::Kubeconfig;
use pvc_backup_config::shared::{AuthConfig, AuthMode};
use secrecy::{ExposeSecret, SecretString};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::k8s::http::HttpK8sClient;
use crate::k8s::{K8sClient, K8sError};

pub use in_cluster::InClusterEnvironment;
pub use kubeconfig::{
    ValidatedKubeconfig, context_names, default_kubeconfig_path, expand_home,
    read_kubeconfig_file, validate_kubeconfig,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("malformed config: {0}")]
    MalformedConfig(String),

    #[error("unreachable endpoint: {0}")]
    UnreachableEndpoint(String),
}

impl AuthError {
    pub fn remediation(&self) -> &'static str {
        match self {
            AuthError::MissingCredential(_) => {
                "Provide the kubeconfig path or content, or run inside a pod with a mounted service account."
            }
            AuthError::MalformedConfig(_) => {
                "Fix the kubeconfig: it needs apiVersion, clusters, contexts, users and a selectable context."
            }
            AuthError::UnreachableEndpoint(_) => {
                "Check network access to the API server and that the selected context points at a running cluster."
            }
        }
    }
}

/// What the operator asked for.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub mode: AuthMode,
    pub kubeconfig_path: Option<String>,
    pub kubeconfig_content: Option<SecretString>,
    pub context: Option<String>,
}

impl AuthRequest {
    pub fn new(mode: AuthMode) -> Self {
        Self {
            mode,
            kubeconfig_path: None,
            kubeconfig_content: None,
            context: None,
        }
    }
}

/// How the copy utility reaches the cluster the client talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSettings {
    pub kubeconfig_path: Option<PathBuf>,
    pub context: Option<String>,
}

/// An authenticated, verified cluster connection.
///
/// Immutable once built and shared read-only between concurrent attempts. A
/// kubeconfig materialized for pasted content or in-cluster auth lives exactly
/// as long as the context.
pub struct CredentialContext {
    client: Arc<dyn K8sClient>,
    transport: TransportSettings,
    mode: AuthMode,
    token_path: Option<PathBuf>,
    _materialized: Option<NamedTempFile>,
}

impl fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialContext")
            .field("mode", &self.mode)
            .field("transport", &self.transport)
            .field("token_path", &self.token_path)
            .finish_non_exhaustive()
    }
}

impl CredentialContext {
    /// Wraps an already verified client.
    pub fn for_client(
        client: Arc<dyn K8sClient>,
        mode: AuthMode,
        transport: TransportSettings,
    ) -> Self {
        Self {
            client,
            transport,
            mode,
            token_path: None,
            _materialized: None,
        }
    }

    pub fn client(&self) -> Arc<dyn K8sClient> {
        self.client.clone()
    }

    pub fn transport(&self) -> &TransportSettings {
        &self.transport
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Checks that the files the context depends on are still present.
    pub async fn ensure_valid(&self) -> Result<(), AuthError> {
        if let Some(path) = &self.transport.kubeconfig_path
            && !path_exists(path).await
        {
            return Err(AuthError::MissingCredential(format!(
                "kubeconfig {} no longer exists",
                path.display()
            )));
        }
        if let Some(path) = &self.token_path
            && !path_exists(path).await
        {
            return Err(AuthError::MissingCredential(format!(
                "service account token {} no longer exists",
                path.display()
            )));
        }

        Ok(())
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Builds a cluster client out of a validated kubeconfig.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(
        &self,
        kubeconfig: Kubeconfig,
        context: &str,
    ) -> Result<Arc<dyn K8sClient>, K8sError>;
}

/// [`ClientFactory`] backed by [`HttpK8sClient`].
#[derive(Debug, Clone, Default)]
pub struct KubeClientFactory;

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn connect(
        &self,
        kubeconfig: Kubeconfig,
        context: &str,
    ) -> Result<Arc<dyn K8sClient>, K8sError> {
        let client = HttpK8sClient::from_kubeconfig(kubeconfig, Some(context)).await?;

        Ok(Arc::new(client))
    }
}

/// Picks the mode used when the operator does not name one.
///
/// A configured default wins. Otherwise a visible service account selects
/// `in-cluster`, and everything else falls back to `kubeconfig-path`.
pub fn default_mode(config: &AuthConfig, environment: &InClusterEnvironment) -> AuthMode {
    match config.default_mode {
        Some(mode) => mode,
        None if environment.is_available() => AuthMode::InCluster,
        None => AuthMode::KubeconfigPath,
    }
}

/// Context names in the kubeconfig at `path`, or at the default location.
pub fn list_context_names(path: Option<&str>) -> Result<Vec<String>, AuthError> {
    let path = resolve_kubeconfig_path(path)?;
    let content = read_kubeconfig_file(&path)?;

    context_names(&content, &format!("kubeconfig {}", path.display()))
}

fn resolve_kubeconfig_path(path: Option<&str>) -> Result<PathBuf, AuthError> {
    match path.map(str::trim).filter(|path| !path.is_empty()) {
        Some(path) => Ok(expand_home(path)),
        None => default_kubeconfig_path().ok_or_else(|| {
            AuthError::MissingCredential(
                "no kubeconfig path given and neither KUBECONFIG nor HOME is set".to_owned(),
            )
        }),
    }
}

fn materialize(content: &str) -> Result<NamedTempFile, AuthError> {
    let write = || -> std::io::Result<NamedTempFile> {
        // Temp files are created with mode 0600.
        let mut file = tempfile::Builder::new()
            .prefix("pvc-backup-kubeconfig-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(content.as_bytes())?;
        file.flush()?;
        Ok(file)
    };

    write().map_err(|err| {
        AuthError::MissingCredential(format!("failed to write a temporary kubeconfig: {err}"))
    })
}

/// Resolves [`AuthRequest`]s into [`CredentialContext`]s.
pub struct AuthResolver {
    config: AuthConfig,
    environment: InClusterEnvironment,
    factory: Arc<dyn ClientFactory>,
}

impl AuthResolver {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            config: config.clone(),
            environment: InClusterEnvironment::from_process(),
            factory: Arc::new(KubeClientFactory),
        }
    }

    pub fn with_in_cluster_environment(mut self, environment: InClusterEnvironment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn default_mode(&self) -> AuthMode {
        default_mode(&self.config, &self.environment)
    }

    /// Validates the request, builds a client and probes the API server.
    pub async fn resolve(&self, request: AuthRequest) -> Result<CredentialContext, AuthError> {
        let requested_context = request
            .context
            .clone()
            .or_else(|| self.config.context.clone());

        let (validated, kubeconfig_path, materialized, token_path) = match request.mode {
            AuthMode::InCluster => {
                let content = self.environment.kubeconfig()?;
                let validated = validate_kubeconfig(&content, None, "in-cluster kubeconfig")?;
                let file = materialize(&content)?;
                let path = file.path().to_owned();
                (
                    validated,
                    path,
                    Some(file),
                    Some(self.environment.token_path.clone()),
                )
            }
            AuthMode::KubeconfigPath => {
                let path = resolve_kubeconfig_path(
                    request
                        .kubeconfig_path
                        .as_deref()
                        .or(self.config.kubeconfig_path.as_deref()),
                )?;
                let content = read_kubeconfig_file(&path)?;
                let validated = validate_kubeconfig(
                    &content,
                    requested_context.as_deref(),
                    &format!("kubeconfig {}", path.display()),
                )?;
                (validated, path, None, None)
            }
            AuthMode::PastedKubeconfig => {
                let Some(content) = request.kubeconfig_content.as_ref() else {
                    return Err(AuthError::MissingCredential(
                        "no kubeconfig content was provided".to_owned(),
                    ));
                };
                let content = content.expose_secret();
                let validated = validate_kubeconfig(
                    content,
                    requested_context.as_deref(),
                    "pasted kubeconfig",
                )?;
                let file = materialize(content)?;
                let path = file.path().to_owned();
                (validated, path, Some(file), None)
            }
        };

        debug!(mode = %request.mode, context = %validated.context, "kubeconfig validated");

        let context = validated.context.clone();
        let client = self
            .factory
            .connect(validated.kubeconfig, &context)
            .await
            .map_err(|err| {
                AuthError::MalformedConfig(format!(
                    "cannot build a client for context `{context}`: {err}"
                ))
            })?;

        let timeout = self.config.connect_timeout();
        let version = match tokio::time::timeout(timeout, client.server_version()).await {
            Ok(Ok(version)) => version,
            Ok(Err(err)) if err.status_code() == Some(401) => {
                return Err(AuthError::MissingCredential(format!(
                    "the API server rejected the credentials of context `{context}`: {err}"
                )));
            }
            Ok(Err(err)) => {
                return Err(AuthError::UnreachableEndpoint(format!(
                    "the API server for context `{context}` could not be reached: {err}"
                )));
            }
            Err(_) => {
                return Err(AuthError::UnreachableEndpoint(format!(
                    "the API server for context `{context}` did not answer within {}s",
                    timeout.as_secs()
                )));
            }
        };

        info!(mode = %request.mode, context = %context, version = %version, "authenticated against cluster");

        Ok(CredentialContext {
            client,
            transport: TransportSettings {
                kubeconfig_path: Some(kubeconfig_path),
                context: Some(context),
            },
            mode: request.mode,
            token_path,
            _materialized: materialized,
        })
    }
}
