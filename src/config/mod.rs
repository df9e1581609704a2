//! Configuration module for putbridge
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Largest accepted copy chunk
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static::lazy_static! {
    static ref ENV_VAR: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}").unwrap();
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in ENV_VAR.captures_iter(s) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let var_name = &cap[1];

        result.push_str(&s[last_match..full_match.start()]);

        match (std::env::var(var_name), cap.get(2)) {
            (Ok(value), _) => result.push_str(&value),
            (Err(_), Some(default)) => result.push_str(default.as_str()),
            // No env var and no default. Keep the original placeholder.
            (Err(_), None) => result.push_str(full_match.as_str()),
        }

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Defaults for everything, storing objects under `root`
    pub fn default_with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                root: root.into(),
                create_buckets: default_true(),
                sync_on_finalize: default_true(),
                keep_partial: false,
            },
            transfer: TransferConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.root must not be empty".into(),
            ));
        }

        if self.transfer.buffer_size == 0 || self.transfer.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "Invalid transfer.buffer_size {}: must be between 1 and {}",
                self.transfer.buffer_size, MAX_BUFFER_SIZE
            )));
        }

        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}': must be one of {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }

        Ok(())
    }
}

/// Destination storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default = "default_true")]
    pub create_buckets: bool,
    #[serde(default = "default_true")]
    pub sync_on_finalize: bool,
    /// Leave partially written objects in place when an upload fails
    #[serde(default)]
    pub keep_partial: bool,
}

/// Worker copy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    crate::upload::DEFAULT_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
storage:
  root: "/tmp/putbridge"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/tmp/putbridge"));
        assert!(config.storage.create_buckets);
        assert!(config.storage.sync_on_finalize);
        assert!(!config.storage.keep_partial);
        assert_eq!(config.transfer.buffer_size, 65536);
        assert_eq!(config.logging.level, "info");
        assert!(config.metrics.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_buffer_size() {
        let mut config = Config::default_with_root("/data");
        config.transfer.buffer_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.transfer.buffer_size = MAX_BUFFER_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default_with_root("/data");
        config.logging.level = "WARN".into();
        config.validate().unwrap();

        config.logging.level = "loud".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn test_validate_empty_root() {
        let config = Config::default_with_root("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_default_value() {
        let expanded = expand_env_vars("root: ${PUTBRIDGE_SURELY_UNSET_VAR:-/srv/data}");
        assert_eq!(expanded, "root: /srv/data");
    }

    #[test]
    fn test_expand_keeps_unknown_placeholder() {
        let expanded = expand_env_vars("root: ${PUTBRIDGE_SURELY_UNSET_VAR}");
        assert_eq!(expanded, "root: ${PUTBRIDGE_SURELY_UNSET_VAR}");
    }
}
