//! Client configuration loading
//!
//! Resolution priority (highest first):
//! 1. Command-line argument
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding the service base URL
pub const ENV_API_URL: &str = "AQUASCAN_API_URL";

/// Environment variable overriding the log level
pub const ENV_LOG_LEVEL: &str = "AQUASCAN_LOG_LEVEL";

/// Compiled default base URL of the detection service
pub const DEFAULT_API_URL: &str = "http://localhost:5000";

/// Effective client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the detection service
    pub api_url: String,
    /// Overall per-request timeout
    pub request_timeout_secs: u64,
    /// Result cache freshness window
    pub cache_ttl_secs: u64,
    /// Fixed job poll interval
    pub poll_interval_ms: u64,
    /// Default detection list page size
    pub page_size: u32,
    /// Window for suppressing repeated identical notifications
    pub notification_dedup_secs: u64,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: 30,
            cache_ttl_secs: 300,
            poll_interval_ms: 3000,
            page_size: 10,
            notification_dedup_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

/// Contents of `config.toml`; every key is optional
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    pub api_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub page_size: Option<u32>,
    pub notification_dedup_secs: Option<u64>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[logging]` table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

impl ClientConfig {
    /// Resolve configuration from all tiers
    ///
    /// `config_path` names an explicit TOML file; without one the platform
    /// default location is tried. A missing file is not an error.
    pub fn resolve(cli_api_url: Option<&str>, config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let path = config_path.map(Path::to_path_buf).or_else(default_config_path);
        match path {
            Some(path) if path.exists() => {
                let toml_config = load_toml_config(&path)?;
                info!("Loaded configuration from {}", path.display());
                config.apply_toml(toml_config);
            }
            Some(path) if config_path.is_some() => {
                warn!("Config file not found: {}, using defaults", path.display());
            }
            _ => {}
        }

        if let Ok(url) = std::env::var(ENV_API_URL) {
            if !url.trim().is_empty() {
                config.api_url = url;
            }
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            if !level.trim().is_empty() {
                config.log_level = level;
            }
        }

        if let Some(url) = cli_api_url {
            config.api_url = url.to_string();
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_toml(&mut self, toml_config: TomlConfig) {
        if let Some(v) = toml_config.api_url {
            self.api_url = v;
        }
        if let Some(v) = toml_config.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        if let Some(v) = toml_config.cache_ttl_secs {
            self.cache_ttl_secs = v;
        }
        if let Some(v) = toml_config.poll_interval_ms {
            self.poll_interval_ms = v;
        }
        if let Some(v) = toml_config.page_size {
            self.page_size = v;
        }
        if let Some(v) = toml_config.notification_dedup_secs {
            self.notification_dedup_secs = v;
        }
        if let Some(v) = toml_config.logging.level {
            self.log_level = v;
        }
    }

    /// Reject values the client cannot run with
    pub fn validate(&self) -> Result<()> {
        let url = self.api_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "api_url must be an http(s) URL, got '{}'",
                self.api_url
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.page_size == 0 {
            return Err(Error::Config("page_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn notification_dedup_window(&self) -> Duration {
        Duration::from_secs(self.notification_dedup_secs)
    }
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid TOML in {}: {}", path.display(), e)))
}

/// Platform config location: `<config_dir>/aquascan/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("aquascan").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.api_url, "http://localhost:5000");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.page_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let config = ClientConfig {
            api_url: "localhost:5000".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = ClientConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_toml_partial() {
        let mut config = ClientConfig::default();
        let toml_config: TomlConfig = toml::from_str(
            r#"
            poll_interval_ms = 1500

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        config.apply_toml(toml_config);
        assert_eq!(config.poll_interval_ms, 1500);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }
}
