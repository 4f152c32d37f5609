//! API server configuration

use std::env;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use reelhouse_shared_config::{
    parse_env, parse_list_env, parse_optional_env, CommonConfig, DatabaseConfig, Environment,
};
use reelhouse_worker::JobsConfig;

/// Minimum required length for JWT_SECRET to be considered secure
const MIN_JWT_SECRET_LENGTH: usize = 32;

/// Per-minute rate limiting with allow and block lists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Shared ceiling used when a type-specific one is unset; 0 disables
    pub per_minute: u32,

    /// Ceiling for authenticated users
    pub user_per_minute: Option<u32>,

    /// Ceiling for anonymous clients keyed by IP
    pub ip_per_minute: Option<u32>,

    pub allow_users: Vec<String>,
    pub allow_ips: Vec<String>,
    pub block_users: Vec<String>,
    pub block_ips: Vec<String>,

    /// Take the client IP from X-Forwarded-For / X-Real-IP
    pub trust_proxy: bool,
}

impl RateLimitSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            per_minute: parse_env("RATE_LIMIT_PER_MINUTE", 0)?,
            user_per_minute: parse_optional_env("RATE_LIMIT_USER_PER_MINUTE")?,
            ip_per_minute: parse_optional_env("RATE_LIMIT_IP_PER_MINUTE")?,
            allow_users: parse_list_env("RATE_LIMIT_ALLOW_USERS"),
            allow_ips: parse_list_env("RATE_LIMIT_ALLOW_IPS"),
            block_users: parse_list_env("RATE_LIMIT_BLOCK_USERS"),
            block_ips: parse_list_env("RATE_LIMIT_BLOCK_IPS"),
            trust_proxy: parse_env("RATE_LIMIT_TRUST_PROXY", false)?,
        })
    }

    /// Effective user ceiling; 0 means unlimited
    pub fn user_limit(&self) -> u32 {
        self.user_per_minute.unwrap_or(self.per_minute)
    }

    /// Effective IP ceiling; 0 means unlimited
    pub fn ip_limit(&self) -> u32 {
        self.ip_per_minute.unwrap_or(self.per_minute)
    }
}

/// API server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with other services
    pub common: CommonConfig,

    /// Server port (default: 8080)
    pub port: u16,

    /// JWT secret for verifying bearer tokens
    pub jwt_secret: String,

    /// CORS allowed origins (optional)
    pub cors_allowed_origins: Option<Vec<String>>,

    /// Concurrent request cap; 0 disables
    pub max_in_flight: usize,

    pub rate_limit: RateLimitSettings,

    /// Queue and dispatch settings
    pub jobs: JobsConfig,

    /// Run the job runtime inside the API process
    pub embedded_workers: bool,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// In production mode, `JWT_SECRET` and `DATABASE_URL` must be set
    /// explicitly. In development, sensible defaults are used.
    pub fn from_env() -> Result<Self> {
        // Determine environment first to know if we need strict validation
        let environment = Environment::from_str(
            &env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        )
        .unwrap_or_default();
        let is_production = environment.is_production();

        let jwt_secret = Self::load_jwt_secret(is_production)?;
        if is_production {
            Self::validate_database_url()?;
        }

        let common = CommonConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

        Ok(Self {
            common,
            port: parse_env("PORT", 8080).context("Invalid PORT value")?,
            jwt_secret,
            cors_allowed_origins: Some(parse_list_env("CORS_ALLOWED_ORIGINS"))
                .filter(|origins| !origins.is_empty()),
            max_in_flight: parse_env("MAX_IN_FLIGHT", 256)?,
            rate_limit: RateLimitSettings::from_env()?,
            jobs: JobsConfig::from_env()?,
            embedded_workers: parse_env("EMBEDDED_WORKERS", true)?,
        })
    }

    /// Load and validate JWT_SECRET
    ///
    /// In production:
    /// - JWT_SECRET must be explicitly set
    /// - Must be at least MIN_JWT_SECRET_LENGTH characters
    ///
    /// In development: uses a default value with a warning
    fn load_jwt_secret(is_production: bool) -> Result<String> {
        match env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => {
                if is_production && secret.len() < MIN_JWT_SECRET_LENGTH {
                    bail!(
                        "JWT_SECRET must be at least {} characters in production (got {})",
                        MIN_JWT_SECRET_LENGTH,
                        secret.len()
                    );
                }
                Ok(secret)
            }
            _ if is_production => {
                bail!(
                    "JWT_SECRET environment variable is required in production. \
                     Please set a secure secret of at least {} characters.",
                    MIN_JWT_SECRET_LENGTH
                );
            }
            _ => {
                tracing::warn!(
                    "JWT_SECRET not set, using insecure default. \
                     This is only acceptable in development mode."
                );
                Ok("development-secret-change-in-production".to_string())
            }
        }
    }

    /// Validate that DATABASE_URL is explicitly set in production
    fn validate_database_url() -> Result<()> {
        match env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => Ok(()),
            _ => {
                bail!(
                    "DATABASE_URL environment variable is required in production. \
                     Please set your PostgreSQL connection string."
                );
            }
        }
    }

    /// Get database configuration
    pub fn database(&self) -> &DatabaseConfig {
        &self.common.database
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.common.environment.is_production()
    }
}
