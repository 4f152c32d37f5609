//! Configuration error types

use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Missing required environment variable
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Value present but not parseable into the expected type
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    /// Parsed fine, but the combination of settings is unusable
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

impl ConfigError {
    /// Shorthand for an [`ConfigError::InvalidValue`] built from borrowed parts
    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue(name.to_string(), reason.into())
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
