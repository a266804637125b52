//! Provider configuration source
//!
//! Connection parameters handed to provider factories. A provider named
//! `Redis` resolves its connection string from, in order:
//!
//! 1. the explicit `connectionString` value
//! 2. `connectionStrings.Redis`
//! 3. the structured key `Redis:Configuration`
//! 4. the structured key `Redis:ConnectionString`
//!
//! The first non-empty value wins.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderSettings {
    /// Explicit connection string, wins over every other source
    pub connection_string: Option<String>,

    /// Named connection strings
    pub connection_strings: HashMap<String, String>,

    /// Flat structured keys such as `Redis:Configuration`
    pub values: HashMap<String, String>,
}

impl ProviderSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CacheError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn with_connection_string(mut self, value: impl Into<String>) -> Self {
        self.connection_string = Some(value.into());
        self
    }

    pub fn with_named_connection_string(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.connection_strings.insert(name.into(), value.into());
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Connection string for `provider_name`, first non-empty source wins
    pub fn resolve_connection_string(&self, provider_name: &str) -> Option<&str> {
        let structured = |suffix: &str| {
            self.values
                .get(&format!("{}:{}", provider_name, suffix))
                .map(String::as_str)
        };

        [
            self.connection_string.as_deref(),
            self.connection_strings.get(provider_name).map(String::as_str),
            structured("Configuration"),
            structured("ConnectionString"),
        ]
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_wins() {
        let settings = ProviderSettings::new()
            .with_connection_string("explicit:6379")
            .with_named_connection_string("Redis", "named:6379")
            .with_value("Redis:Configuration", "structured:6379");
        assert_eq!(settings.resolve_connection_string("Redis"), Some("explicit:6379"));
    }

    #[test]
    fn test_fallback_order() {
        let settings = ProviderSettings::new()
            .with_connection_string("  ")
            .with_named_connection_string("Redis", "")
            .with_value("Redis:ConnectionString", "cs:6379")
            .with_value("Redis:Configuration", "cfg:6379");
        assert_eq!(settings.resolve_connection_string("Redis"), Some("cfg:6379"));

        let settings = ProviderSettings::new().with_value("Redis:ConnectionString", "cs:6379");
        assert_eq!(settings.resolve_connection_string("Redis"), Some("cs:6379"));
        assert_eq!(settings.resolve_connection_string("Other"), None);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
connectionStrings:
  Redis: "localhost:6379"
values:
  "Nats:Configuration": "nats://localhost:4222"
"#;
        let settings = ProviderSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.resolve_connection_string("Redis"), Some("localhost:6379"));
        assert_eq!(
            settings.resolve_connection_string("Nats"),
            Some("nats://localhost:4222")
        );
    }
}
