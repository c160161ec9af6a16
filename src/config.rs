//! Provider configuration loaded from TOML.
//!
//! ```toml
//! dialect = "postgres"
//!
//! [translate]
//! quote_identifiers = true
//!
//! [cache]
//! max_entries = 512
//! ttl_seconds = 300
//!
//! [[entities]]
//! name = "Customer"
//! table = "customers"
//! properties = [
//!     { name = "id", column = "id", data_type = "int", primary_key = true },
//!     { name = "name", column = "name", data_type = "text" },
//! ]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relational::EntityMetadata;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "ENTITY_QUERY_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub dialect: String,
    pub translate: TranslateOptions,
    pub cache: CacheOptions,
    pub entities: Vec<EntityMetadata>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            dialect: "postgres".to_string(),
            translate: TranslateOptions::default(),
            cache: CacheOptions::default(),
            entities: Vec::new(),
        }
    }
}

/// Per-translation knobs. Callers get their own copy for every translation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateOptions {
    /// Emit `"quoted"` identifiers.
    pub quote_identifiers: bool,
    /// Materialize rows with change tracking enabled.
    pub trace_entity_state: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub enabled: bool,
    pub max_entries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    pub key_prefix: String,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1024,
            ttl_seconds: None,
            key_prefix: "eq".to_string(),
        }
    }
}

impl CacheOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_seconds.map(Duration::from_secs)
    }
}

impl ProviderConfig {
    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("entity-query")
            .join("config.toml")
    }

    /// Load from [`Self::config_path`], falling back to defaults when the file
    /// does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ProviderConfig = toml::from_str(content)?;
        if config.cache.enabled && config.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be greater than zero when the cache is enabled");
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relational::DataType;

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.dialect, "postgres");
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_entries, 1024);
        assert_eq!(config.cache.ttl(), None);
        assert_eq!(config.cache.key_prefix, "eq");
        assert!(!config.translate.quote_identifiers);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = ProviderConfig::from_toml_str(
            r#"
            [cache]
            ttl_seconds = 30
            key_prefix = "app"
            "#,
        )
        .unwrap();
        assert_eq!(config.dialect, "postgres");
        assert_eq!(config.cache.ttl(), Some(Duration::from_secs(30)));
        assert_eq!(config.cache.key_prefix, "app");
        assert_eq!(config.cache.max_entries, 1024);
    }

    #[test]
    fn test_parse_entities() {
        let config = ProviderConfig::from_toml_str(
            r#"
            [[entities]]
            name = "Customer"
            table = "customers"
            properties = [
                { name = "id", column = "id", data_type = "int", primary_key = true },
                { name = "email", column = "email_address", data_type = "text", nullable = true },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(config.entities.len(), 1);
        let customer = &config.entities[0];
        let email = customer.find("email").unwrap();
        assert_eq!(email.column, "email_address");
        assert_eq!(email.data_type, DataType::Text);
        assert!(email.nullable);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = ProviderConfig::from_toml_str("[cache]\nmax_entries = 0\n");
        assert!(result.is_err());
        let disabled =
            ProviderConfig::from_toml_str("[cache]\nenabled = false\nmax_entries = 0\n").unwrap();
        assert!(!disabled.cache.enabled);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = ProviderConfig::default();
        config.translate.quote_identifiers = true;
        config.cache.ttl_seconds = Some(60);
        let text = config.to_toml_string().unwrap();
        assert_eq!(ProviderConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_load_from_missing_file_fails_with_path() {
        let err = ProviderConfig::load_from(Path::new("/nonexistent/entity-query.toml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("/nonexistent/entity-query.toml"));
    }
}
