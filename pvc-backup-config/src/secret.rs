use std::ops::Deref;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

/// A [`SecretString`] that can be read from configuration sources.
///
/// The value is wrapped as soon as it is deserialized and is redacted from
/// `Debug` output. It is intentionally not `Serialize` so a loaded config can
/// be logged or dumped without leaking credentials.
#[derive(Clone, Debug)]
pub struct ConfigSecret(SecretString);

impl ConfigSecret {
    /// Returns `true` when the wrapped secret is the empty string.
    pub fn is_empty(&self) -> bool {
        use secrecy::ExposeSecret;

        self.0.expose_secret().is_empty()
    }
}

impl Deref for ConfigSecret {
    type Target = SecretString;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for ConfigSecret {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl From<&str> for ConfigSecret {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl<'de> Deserialize<'de> for ConfigSecret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Ok(Self(string.into()))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn test_debug_output_is_redacted() {
        let secret = ConfigSecret::from("hunter2");
        assert!(!format!("{secret:?}").contains("hunter2"));
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_empty_secret() {
        assert!(ConfigSecret::from("").is_empty());
        assert!(!ConfigSecret::from("x").is_empty());
    }
}
