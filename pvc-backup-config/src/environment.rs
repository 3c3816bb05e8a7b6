use std::fmt;
use std::str::FromStr;

/// Environment variable name containing the environment identifier.
const APP_ENVIRONMENT_ENV_NAME: &str = "APP_ENVIRONMENT";

const PROD_ENV_NAME: &str = "prod";
const STAGING_ENV_NAME: &str = "staging";
const DEV_ENV_NAME: &str = "dev";

/// The value of `APP_ENVIRONMENT` is not one of the supported names.
#[derive(Debug, thiserror::Error)]
#[error(
    "`{0}` is not a supported environment, use one of `{PROD_ENV_NAME}`, `{STAGING_ENV_NAME}` or `{DEV_ENV_NAME}`"
)]
pub struct UnknownEnvironment(String);

/// Runtime environment of the process.
///
/// Selects the environment-specific configuration file and whether logs are
/// written as JSON files or pretty-printed to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Prod,
    Staging,
    Dev,
}

impl Environment {
    /// Loads the environment from `APP_ENVIRONMENT`, defaulting to [`Environment::Prod`].
    pub fn load() -> Result<Environment, UnknownEnvironment> {
        match std::env::var(APP_ENVIRONMENT_ENV_NAME) {
            Ok(value) => value.parse(),
            Err(_) => Ok(Environment::Prod),
        }
    }

    /// Exports this environment through `APP_ENVIRONMENT`.
    ///
    /// Only meant for process start-up and tests, before other threads read the
    /// environment.
    pub fn set(&self) {
        unsafe { std::env::set_var(APP_ENVIRONMENT_ENV_NAME, self.to_string()) }
    }

    /// Returns `true` for [`Environment::Prod`] and [`Environment::Staging`].
    pub fn is_prod(&self) -> bool {
        matches!(self, Self::Prod | Self::Staging)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Environment::Prod => PROD_ENV_NAME,
            Environment::Staging => STAGING_ENV_NAME,
            Environment::Dev => DEV_ENV_NAME,
        };
        f.write_str(name)
    }
}

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    /// Parses an environment name case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            PROD_ENV_NAME => Ok(Self::Prod),
            STAGING_ENV_NAME => Ok(Self::Staging),
            DEV_ENV_NAME => Ok(Self::Dev),
            _ => Err(UnknownEnvironment(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert_eq!(" dev ".parse::<Environment>().unwrap(), Environment::Dev);
        assert_eq!("Staging".parse::<Environment>().unwrap(), Environment::Staging);
    }

    #[test]
    fn test_parse_rejects_unknown_names() {
        let err = "qa".parse::<Environment>().unwrap_err();
        assert!(err.to_string().contains("`qa`"));
    }

    #[test]
    fn test_staging_counts_as_prod() {
        assert!(Environment::Staging.is_prod());
        assert!(!Environment::Dev.is_prod());
    }
}
