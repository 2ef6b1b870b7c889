//! Filter configuration.
//!
//! A [`CacheConfig`] is built once when the filter is instantiated and is
//! shared read-only (behind an `Arc`) by every request afterwards.
//!
//! Besides the programmatic defaults, the plugin-style JSON shape is
//! accepted:
//!
//! ```json
//! { "use_prefix": true, "redis_host": "localhost", "redis_port": 6379 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default entry lifetime: one day.
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_KEY_PREFIX: &str = "cache:";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Connection parameters for the tagged store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    /// Namespace applied to every physical key when `use_prefix` is on.
    pub key_prefix: String,
    pub connect_timeout: Duration,
    /// Upper bound for a single get/set/invalidate round-trip.
    pub operation_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            connect_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(1),
        }
    }
}

impl StoreConfig {
    /// Redis connection URL for this host and port.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Immutable per-filter-instance settings.
///
/// # Examples
///
/// ```
/// use cache_entity::config::CacheConfig;
///
/// let config = CacheConfig::from_json(r#"{"redis_host": "cache.internal", "redis_port": null}"#).unwrap();
/// assert_eq!(config.store.host, "cache.internal");
/// assert_eq!(config.store.port, 6379);
/// assert!(config.use_prefix);
/// assert_eq!(config.physical_prefix(), "cache:");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub use_prefix: bool,
    pub default_ttl: Duration,
    pub store: StoreConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            use_prefix: true,
            default_ttl: DEFAULT_TTL,
            store: StoreConfig::default(),
        }
    }
}

// Wire shape of the plugin configuration. Falsy values mean "use the default".
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PluginSchema {
    use_prefix: Option<bool>,
    redis_host: Option<String>,
    redis_port: Option<u16>,
}

impl CacheConfig {
    /// Parses the plugin JSON configuration.
    ///
    /// Missing, `null`, empty-string and zero values fall back to the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is not valid JSON or a
    /// field has the wrong type.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let schema: PluginSchema = serde_json::from_str(raw)?;
        let mut config = Self::default();

        if let Some(use_prefix) = schema.use_prefix {
            config.use_prefix = use_prefix;
        }
        if let Some(host) = schema.redis_host.filter(|h| !h.trim().is_empty()) {
            config.store.host = host;
        }
        if let Some(port) = schema.redis_port.filter(|p| *p != 0) {
            config.store.port = port;
        }

        Ok(config)
    }

    /// Reads and parses a plugin JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Prefix the store puts in front of every physical key.
    pub fn physical_prefix(&self) -> &str {
        if self.use_prefix {
            &self.store.key_prefix
        } else {
            ""
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CacheConfig::default();
        assert!(config.use_prefix);
        assert_eq!(config.default_ttl, Duration::from_secs(86_400));
        assert_eq!(config.store.url(), "redis://localhost:6379/");
        assert_eq!(config.store.key_prefix, "cache:");
    }

    #[test]
    fn empty_document_is_all_defaults() {
        assert_eq!(CacheConfig::from_json("{}").unwrap(), CacheConfig::default());
    }

    #[test]
    fn falsy_values_fall_back() {
        let config =
            CacheConfig::from_json(r#"{"redis_host": "", "redis_port": 0, "use_prefix": null}"#)
                .unwrap();
        assert_eq!(config, CacheConfig::default());
    }

    #[test]
    fn explicit_values_win() {
        let config = CacheConfig::from_json(
            r#"{"use_prefix": false, "redis_host": "10.0.0.7", "redis_port": 6380}"#,
        )
        .unwrap();
        assert!(!config.use_prefix);
        assert_eq!(config.physical_prefix(), "");
        assert_eq!(config.store.url(), "redis://10.0.0.7:6380/");
    }

    #[test]
    fn wrong_type_is_rejected() {
        let err = CacheConfig::from_json(r#"{"redis_port": "six"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = CacheConfig::from_file("/nonexistent/cache-entity.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cache-entity.json"));
    }
}
