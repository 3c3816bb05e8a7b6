use std::path::Path;

use serde::de::DeserializeOwned;

use crate::environment::{Environment, UnknownEnvironment};
use crate::{
    BASE_CONFIG_FILE, CONFIGURATION_DIR, Config, ENV_PREFIX, ENV_PREFIX_SEPARATOR, ENV_SEPARATOR,
    LIST_SEPARATOR,
};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    #[error("failed to parse `APP_ENVIRONMENT`: {0}")]
    Environment(#[from] UnknownEnvironment),

    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
}

/// Loads layered configuration relative to the current working directory.
///
/// See [`load_config_from`] for the layering rules.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    load_config_from(&base_path)
}

/// Loads hierarchical configuration from optional YAML files and environment variables.
///
/// Loads configuration in this order, later sources overriding earlier ones:
/// 1. Defaults declared on the configuration types themselves
/// 2. `configuration/base.yaml`, if present
/// 3. `configuration/{environment}.yaml`, if present
/// 4. Environment variable overrides prefixed with `APP`
///
/// Nested keys use double underscores: `APP_DISCOVERY__TIMEOUT_SECS` → `discovery.timeout_secs`.
pub fn load_config_from<T>(base_path: &Path) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let configuration_directory = base_path.join(CONFIGURATION_DIR);

    // Default to `prod` if unspecified.
    let environment = Environment::load()?;
    let environment_filename = format!("{environment}.yaml");

    let mut environment_source = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true);

    if !<T as Config>::LIST_PARSE_KEYS.is_empty() {
        environment_source = environment_source.list_separator(LIST_SEPARATOR);

        for key in <T as Config>::LIST_PARSE_KEYS {
            environment_source = environment_source.with_list_parse_key(key);
        }
    }

    let settings = config::Config::builder()
        .add_source(
            config::File::from(configuration_directory.join(BASE_CONFIG_FILE)).required(false),
        )
        .add_source(
            config::File::from(configuration_directory.join(environment_filename)).required(false),
        )
        // E.g. `APP_DESTINATION__HOST=backup.example.com` sets `destination.host`.
        .add_source(environment_source)
        .build()?;

    Ok(settings.try_deserialize::<T>()?)
}
