//! Read-only secret access
//!
//! Webhook signing keys and outbound hook URLs are looked up by name at
//! runtime. Values are wrapped in [`SecretString`] so they are zeroed on drop
//! and never show up in `Debug` output.

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;

use crate::error::Result;

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Look up `name`. Absent secrets are `Ok(None)`, not an error.
    async fn get_secret(&self, name: &str) -> Result<Option<SecretString>>;
}

/// Reads secret `foo_bar` from the environment variable `{prefix}FOO_BAR`.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_name(&self, name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<SecretString>> {
        match std::env::var(self.variable_name(name)) {
            Ok(value) if !value.is_empty() => Ok(Some(SecretString::from(value))),
            _ => Ok(None),
        }
    }
}

/// Fixed name/value map, for tests and embedded setups.
#[derive(Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, SecretString>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: &str, value: &str) -> Self {
        self.secrets
            .insert(name.to_string(), SecretString::from(value.to_string()));
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<SecretString>> {
        Ok(self.secrets.get(name).cloned())
    }
}
