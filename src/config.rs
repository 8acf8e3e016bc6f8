//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{ConfigError, Result, TurnstileError};
use crate::ratelimit::{EvictionPolicy, RuleConfig};

/// Prefix for environment overrides, e.g. `TURNSTILE__LOGGING__LEVEL=debug`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Rules, evaluated in order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Client eviction
    #[serde(default)]
    pub eviction: EvictionConfig,
}

/// Client eviction configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Maximum number of tracked clients; unbounded when absent
    #[serde(default)]
    pub max_clients: Option<usize>,
}

impl EvictionConfig {
    /// The eviction policy described by this configuration.
    pub fn policy(&self) -> std::result::Result<EvictionPolicy, ConfigError> {
        match self.max_clients {
            Some(max_clients) => EvictionPolicy::lru(max_clients),
            None => Ok(EvictionPolicy::Unbounded),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON formatted logs
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

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file, then apply environment
    /// overrides prefixed with `TURNSTILE__`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Settings(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RuleSet;
    use std::io::Write;

    const SAMPLE: &str = r#"
limiter:
  rules:
    - window: 1
      max_requests: 1
      burst_capacity: 2
      cooldown: 5
    - window: minute
      max_requests: 10
      burst_capacity: 15
      cooldown: 10
  eviction:
    max_clients: 500
logging:
  json: true
"#;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert!(config.limiter.rules.is_empty());
        assert_eq!(config.limiter.eviction.max_clients, None);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_from_yaml() {
        let config = TurnstileConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.limiter.rules.len(), 2);
        assert_eq!(
            config.limiter.eviction.policy().unwrap(),
            EvictionPolicy::Lru { max_clients: 500 }
        );
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");

        let rules = RuleSet::from_configs(&config.limiter.rules).unwrap();
        assert_eq!(rules.get(1).unwrap().window, 60);
    }

    #[test]
    fn test_from_yaml_invalid() {
        let err = TurnstileConfig::from_yaml("limiter: [1, 2").unwrap_err();
        assert!(matches!(err, TurnstileError::Settings(_)));
    }

    #[test]
    fn test_eviction_policy() {
        assert_eq!(
            EvictionConfig::default().policy().unwrap(),
            EvictionPolicy::Unbounded
        );
        assert_eq!(
            EvictionConfig {
                max_clients: Some(0)
            }
            .policy(),
            Err(ConfigError::ZeroMaxClients)
        );
    }

    #[test]
    fn test_load_layered_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = TurnstileConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.limiter.rules.len(), 2);
        assert_eq!(config.limiter.rules[0].burst_capacity, Some(2));
        assert_eq!(config.limiter.eviction.max_clients, Some(500));
    }

    #[test]
    fn test_load_missing_file() {
        let err = TurnstileConfig::load(Some(Path::new("/nonexistent/turnstile.yaml")))
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Settings(_)));
    }
}
