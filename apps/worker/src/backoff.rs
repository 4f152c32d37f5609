//! Retry delay policy.
//!
//! The delay only ever depends on the attempt count that just failed and is
//! non-decreasing in it, so a job that keeps failing never gets picked up
//! sooner than it was the time before.

use std::time::Duration;

use reelhouse_shared_config::{ConfigError, ConfigResult};

/// Exponent cap; `base * 2^20` is already far beyond any sane maximum
const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Same delay after every failure
    Fixed(Duration),
    /// `step * attempts`
    Linear(Duration),
    /// `base * 2^(attempts - 1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Linear(Duration::from_secs(30))
    }
}

impl BackoffPolicy {
    /// No delay at all; handy in tests
    pub const fn immediate() -> Self {
        Self::Fixed(Duration::ZERO)
    }

    /// Build a policy from its configured name (`fixed`, `linear`, `exponential`)
    pub fn from_parts(kind: &str, step: Duration, max: Duration) -> ConfigResult<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed(step)),
            "linear" => Ok(Self::Linear(step)),
            "exponential" | "exp" => {
                if max < step {
                    return Err(ConfigError::ValidationError(format!(
                        "exponential backoff cap ({}s) is below its base delay ({}s)",
                        max.as_secs(),
                        step.as_secs()
                    )));
                }
                Ok(Self::Exponential { base: step, max })
            }
            other => Err(ConfigError::invalid(
                "JOB_RETRY_BACKOFF",
                format!("unknown backoff policy '{other}'"),
            )),
        }
    }

    /// Delay before the next attempt, given how many attempts have been made
    pub fn delay(&self, attempts: i32) -> Duration {
        let attempts = u32::try_from(attempts).unwrap_or(0);
        match *self {
            Self::Fixed(delay) => delay,
            Self::Linear(step) => step.saturating_mul(attempts),
            Self::Exponential { base, max } => {
                let exponent = attempts.saturating_sub(1).min(MAX_EXPONENT);
                base.saturating_mul(1u32 << exponent).min(max)
            }
        }
    }
}
