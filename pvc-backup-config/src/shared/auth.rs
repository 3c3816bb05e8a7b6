use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// How the tool authenticates against the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Service account token and CA bundle mounted into the running pod.
    #[serde(alias = "in_cluster", alias = "serviceaccount", alias = "service-account")]
    InCluster,
    /// A kubeconfig file on disk.
    #[serde(alias = "kubeconfig", alias = "kubeconfig_path", alias = "path")]
    KubeconfigPath,
    /// Kubeconfig content supplied directly, e.g. pasted or piped on stdin.
    #[serde(alias = "paste", alias = "pasted", alias = "kubeconfig_text")]
    PastedKubeconfig,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::InCluster => "in-cluster",
            AuthMode::KubeconfigPath => "kubeconfig-path",
            AuthMode::PastedKubeconfig => "pasted-kubeconfig",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The string did not name a known [`AuthMode`].
#[derive(Debug, thiserror::Error)]
#[error("unknown auth mode `{0}`, expected `in-cluster`, `kubeconfig-path` or `pasted-kubeconfig`")]
pub struct UnknownAuthMode(String);

impl FromStr for AuthMode {
    type Err = UnknownAuthMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "in-cluster" | "in_cluster" | "serviceaccount" | "service-account" => {
                Ok(AuthMode::InCluster)
            }
            "kubeconfig-path" | "kubeconfig" | "kubeconfig_path" | "path" => {
                Ok(AuthMode::KubeconfigPath)
            }
            "pasted-kubeconfig" | "paste" | "pasted" | "kubeconfig_text" => {
                Ok(AuthMode::PastedKubeconfig)
            }
            _ => Err(UnknownAuthMode(s.to_owned())),
        }
    }
}

/// Authentication defaults supplied at process start.
///
/// The default mode is resolved once at start-up from this struct and the
/// probed runtime environment and then passed explicitly to whoever builds an
/// auth request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Preferred mode. When unset, in-cluster mode is chosen if the service
    /// account environment is present, kubeconfig-path otherwise.
    pub default_mode: Option<AuthMode>,
    /// Kubeconfig file used by the kubeconfig-path mode.
    pub kubeconfig_path: Option<String>,
    /// Context to select instead of `current-context`.
    pub context: Option<String>,
    /// Upper bound for the reachability probe made after building the client.
    pub connect_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_mode: None,
            kubeconfig_path: None,
            context: None,
            connect_timeout_secs: 10,
        }
    }
}

impl AuthConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.connect_timeout_secs == 0 {
            return Err(ValidationError::ZeroDuration("auth.connect_timeout_secs"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_mode_accepts_legacy_aliases() {
        assert_eq!("service-account".parse::<AuthMode>().unwrap(), AuthMode::InCluster);
        assert_eq!("path".parse::<AuthMode>().unwrap(), AuthMode::KubeconfigPath);
        assert_eq!("Pasted".parse::<AuthMode>().unwrap(), AuthMode::PastedKubeconfig);
        assert!("token".parse::<AuthMode>().is_err());
    }

    #[test]
    fn test_auth_mode_display_round_trips_through_from_str() {
        for mode in [
            AuthMode::InCluster,
            AuthMode::KubeconfigPath,
            AuthMode::PastedKubeconfig,
        ] {
            assert_eq!(mode.to_string().parse::<AuthMode>().unwrap(), mode);
        }
    }
}
