use std::path::{Path, PathBuf};

use kube::config::Kubeconfig;
use serde::Deserialize;

use crate::auth::AuthError;

/// The fields checked before a kubeconfig is handed to `kube`.
///
/// Everything is optional so that each missing piece gets its own message
/// instead of a generic deserialization error.
#[derive(Debug, Default, Deserialize)]
struct KubeconfigOutline {
    #[serde(rename = "apiVersion")]
    api_version: Option<String>,
    clusters: Option<Vec<NamedEntry>>,
    contexts: Option<Vec<NamedEntry>>,
    users: Option<Vec<NamedEntry>>,
    #[serde(rename = "current-context")]
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedEntry {
    name: Option<String>,
}

fn names(entries: &Option<Vec<NamedEntry>>) -> Vec<String> {
    entries
        .iter()
        .flatten()
        .filter_map(|entry| entry.name.clone())
        .collect()
}

/// A kubeconfig that passed validation together with the selected context.
#[derive(Debug, Clone)]
pub struct ValidatedKubeconfig {
    pub kubeconfig: Kubeconfig,
    pub context: String,
}

/// Validates kubeconfig `content` and selects a context.
///
/// `requested_context` wins over `current-context`. `source` names the origin
/// in error messages.
pub fn validate_kubeconfig(
    content: &str,
    requested_context: Option<&str>,
    source: &str,
) -> Result<ValidatedKubeconfig, AuthError> {
    if content.trim().is_empty() {
        return Err(AuthError::MissingCredential(format!("{source} is empty")));
    }

    let outline: Option<KubeconfigOutline> = serde_yaml::from_str(content)
        .map_err(|err| AuthError::MalformedConfig(format!("{source} is not valid YAML: {err}")))?;
    let Some(outline) = outline else {
        return Err(AuthError::MissingCredential(format!("{source} is empty")));
    };

    if outline
        .api_version
        .as_deref()
        .is_none_or(|version| version.trim().is_empty())
    {
        return Err(AuthError::MalformedConfig(format!(
            "{source} is missing `apiVersion`"
        )));
    }
    for (field, entries) in [
        ("clusters", &outline.clusters),
        ("contexts", &outline.contexts),
        ("users", &outline.users),
    ] {
        if entries.as_ref().is_none_or(Vec::is_empty) {
            return Err(AuthError::MalformedConfig(format!(
                "{source} has no `{field}` entries"
            )));
        }
    }

    let context = requested_context
        .map(str::trim)
        .filter(|context| !context.is_empty())
        .map(str::to_owned)
        .or_else(|| outline.current_context.clone())
        .filter(|context| !context.trim().is_empty())
        .ok_or_else(|| {
            AuthError::MalformedConfig(format!(
                "{source} has no `current-context` and no context was selected"
            ))
        })?;

    let available = names(&outline.contexts);
    if !available.contains(&context) {
        let mut sorted = available;
        sorted.sort();
        return Err(AuthError::MalformedConfig(format!(
            "context `{context}` not found in {source} (available: {})",
            sorted.join(", ")
        )));
    }

    let kubeconfig = Kubeconfig::from_yaml(content)
        .map_err(|err| AuthError::MalformedConfig(format!("{source} cannot be loaded: {err}")))?;

    Ok(ValidatedKubeconfig {
        kubeconfig,
        context,
    })
}

/// Sorted context names declared in kubeconfig `content`.
pub fn context_names(content: &str, source: &str) -> Result<Vec<String>, AuthError> {
    let outline: Option<KubeconfigOutline> = serde_yaml::from_str(content)
        .map_err(|err| AuthError::MalformedConfig(format!("{source} is not valid YAML: {err}")))?;

    let mut names = names(&outline.unwrap_or_default().contexts);
    names.sort();
    names.dedup();

    Ok(names)
}

/// Reads a kubeconfig file as UTF-8.
pub fn read_kubeconfig_file(path: &Path) -> Result<String, AuthError> {
    let metadata = std::fs::metadata(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => AuthError::MissingCredential(format!(
            "kubeconfig file {} does not exist",
            path.display()
        )),
        _ => AuthError::MissingCredential(format!(
            "kubeconfig file {} cannot be accessed: {err}",
            path.display()
        )),
    })?;
    if !metadata.is_file() {
        return Err(AuthError::MalformedConfig(format!(
            "kubeconfig path {} is not a file",
            path.display()
        )));
    }

    std::fs::read_to_string(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::InvalidData => AuthError::MalformedConfig(format!(
            "kubeconfig file {} is not valid UTF-8",
            path.display()
        )),
        _ => AuthError::MissingCredential(format!(
            "kubeconfig file {} cannot be read: {err}",
            path.display()
        )),
    })
}

/// Expands a leading `~` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    let path = path.trim();
    let home = std::env::var_os("HOME");
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => PathBuf::from(home),
        (Some(rest), Some(home)) if rest.starts_with('/') => {
            PathBuf::from(home).join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(path),
    }
}

/// First `KUBECONFIG` entry, else `~/.kube/config`.
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    if let Some(value) = std::env::var_os("KUBECONFIG")
        && let Some(first) = std::env::split_paths(&value).find(|path| !path.as_os_str().is_empty())
    {
        return Some(first);
    }

    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube").join("config"))
}
