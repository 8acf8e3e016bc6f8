//! Error types for Turnstile.
//!
//! Rejecting a request is not an error: admission outcomes are values
//! ([`crate::ratelimit::Decision`]). The types here cover configuration and
//! input problems only.

use thiserror::Error;

/// Invalid rule configuration, raised when a [`crate::ratelimit::RuleSet`]
/// is constructed. A limiter is never built from a rule set that failed here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Window size must be positive
    #[error("rule {index}: window size must be greater than zero")]
    ZeroWindow { index: usize },

    /// Burst capacity must be positive
    #[error("rule {index}: burst capacity must be at least 1")]
    ZeroBurst { index: usize },

    /// Cooldown, when present, must be positive
    #[error("rule {index}: cooldown period must be greater than zero when set")]
    ZeroCooldown { index: usize },

    /// Window sizes must be unique within a rule set
    #[error("rule {index}: window size {window} is already used by rule {first}")]
    DuplicateWindow {
        index: usize,
        first: usize,
        window: u64,
    },

    /// LRU eviction needs room for at least one client
    #[error("eviction max_clients must be at least 1")]
    ZeroMaxClients,

    /// Rules could not be parsed
    #[error("failed to parse rules: {0}")]
    Parse(String),
}

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Rule configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Settings file or environment errors
    #[error("Settings error: {0}")]
    Settings(String),

    /// Malformed request stream
    #[error("Invalid input on line {line}: {message}")]
    Input { line: usize, message: String },

    /// Decision serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Settings(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages() {
        assert_eq!(
            ConfigError::ZeroWindow { index: 2 }.to_string(),
            "rule 2: window size must be greater than zero"
        );
        assert_eq!(
            ConfigError::DuplicateWindow {
                index: 1,
                first: 0,
                window: 60
            }
            .to_string(),
            "rule 1: window size 60 is already used by rule 0"
        );
    }

    #[test]
    fn test_config_error_converts() {
        let err: TurnstileError = ConfigError::ZeroMaxClients.into();
        assert!(matches!(err, TurnstileError::Config(ConfigError::ZeroMaxClients)));
        assert!(err.to_string().starts_with("Configuration error:"));
    }
}
