//! Job subsystem configuration loaded from environment variables
//!
//! `JobsConfig` is shared by the headless worker and by the API server when
//! it runs the job runtime in-process. `Config` is the worker binary's full
//! configuration.

use std::collections::HashMap;
use std::time::Duration;

use reelhouse_shared_config::{parse_env, CommonConfig, ConfigError, ConfigResult};

use crate::backoff::BackoffPolicy;
use crate::jobs::{AutoMatchJob, HlsJob, IndexJob};
use crate::registry::JobHandler;

/// Settings for queueing, dispatch, recovery and cleanup
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Number of execution slots in the worker pool
    pub worker_count: usize,

    /// How often the dispatcher polls for claimable jobs
    pub poll_interval: Duration,

    /// `max_attempts` given to newly enqueued jobs
    pub max_attempts: i32,

    /// Delay policy between failed attempts
    pub backoff: BackoffPolicy,

    /// Running jobs older than this are reclaimed; zero disables the reaper
    pub running_timeout: Duration,

    /// Reaper sweep interval
    pub reaper_interval: Duration,

    /// How long terminal jobs are kept; zero disables cleanup
    pub retention: Duration,

    /// Retention sweep interval
    pub cleanup_interval: Duration,

    /// Optional deadline for a single handler invocation
    pub execution_timeout: Option<Duration>,

    /// Per job type concurrency ceilings
    pub concurrency: HashMap<String, usize>,

    /// Age after which a media resource lease counts as abandoned
    pub resource_lease_timeout: Option<Duration>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        let worker_count = 2;
        Self {
            worker_count,
            poll_interval: Duration::from_millis(500),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            running_timeout: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(60),
            retention: Duration::from_secs(168 * 3600),
            cleanup_interval: Duration::from_secs(3600),
            execution_timeout: None,
            concurrency: default_concurrency(),
            resource_lease_timeout: Some(Duration::from_secs(3600)),
        }
    }
}

fn default_concurrency() -> HashMap<String, usize> {
    HashMap::from([
        (IndexJob::JOB_TYPE.to_string(), 1),
        (AutoMatchJob::JOB_TYPE.to_string(), 1),
        (HlsJob::JOB_TYPE.to_string(), 2),
    ])
}

fn secs(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_secs(n))
}

impl JobsConfig {
    /// Load job settings from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let retry_step = Duration::from_secs(parse_env("JOB_RETRY_DELAY_SECS", 30u64)?);
        let retry_max = Duration::from_secs(parse_env("JOB_RETRY_MAX_DELAY_SECS", 3600u64)?);
        let backoff_kind: String = parse_env("JOB_RETRY_BACKOFF", "linear".to_string())?;
        let retention_hours: u64 = parse_env("JOB_RETENTION_HOURS", 168)?;
        let retention = retention_hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::invalid("JOB_RETENTION_HOURS", "value is too large"))?;

        let concurrency = HashMap::from([
            (
                IndexJob::JOB_TYPE.to_string(),
                parse_env("JOB_INDEX_CONCURRENCY", 1usize)?,
            ),
            (
                AutoMatchJob::JOB_TYPE.to_string(),
                parse_env("JOB_AUTO_MATCH_CONCURRENCY", 1usize)?,
            ),
            (
                HlsJob::JOB_TYPE.to_string(),
                parse_env("JOB_HLS_CONCURRENCY", 2usize)?,
            ),
        ]);

        let config = Self {
            worker_count: parse_env("JOB_WORKERS", 2)?,
            poll_interval: Duration::from_millis(parse_env("JOB_POLL_INTERVAL_MS", 500)?),
            max_attempts: parse_env("JOB_MAX_ATTEMPTS", 3)?,
            backoff: BackoffPolicy::from_parts(&backoff_kind, retry_step, retry_max)?,
            running_timeout: Duration::from_secs(parse_env("JOB_RUNNING_TIMEOUT_SECS", 3600)?),
            reaper_interval: Duration::from_secs(parse_env("JOB_REAPER_INTERVAL_SECS", 60)?),
            retention,
            cleanup_interval: Duration::from_secs(parse_env("JOB_CLEANUP_INTERVAL_SECS", 3600)?),
            execution_timeout: secs(parse_env("JOB_EXECUTION_TIMEOUT_SECS", 0)?),
            concurrency,
            resource_lease_timeout: secs(parse_env("HLS_LEASE_TIMEOUT_SECS", 3600)?),
        };
        config.validated()
    }

    /// Reject unusable values and clamp ceilings to the pool size
    pub fn validated(mut self) -> ConfigResult<Self> {
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("JOB_WORKERS", "must be at least 1"));
        }
        if self.max_attempts < 1 {
            return Err(ConfigError::invalid("JOB_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("JOB_POLL_INTERVAL_MS", "must be positive"));
        }
        if !self.running_timeout.is_zero() && self.reaper_interval.is_zero() {
            return Err(ConfigError::invalid("JOB_REAPER_INTERVAL_SECS", "must be positive"));
        }
        if !self.retention.is_zero() && self.cleanup_interval.is_zero() {
            return Err(ConfigError::invalid("JOB_CLEANUP_INTERVAL_SECS", "must be positive"));
        }

        for (job_type, ceiling) in self.concurrency.iter_mut() {
            if *ceiling == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "concurrency ceiling for '{job_type}' must be at least 1"
                )));
            }
            if *ceiling > self.worker_count {
                tracing::warn!(
                    job_type = %job_type,
                    ceiling = *ceiling,
                    workers = self.worker_count,
                    "Concurrency ceiling exceeds worker pool size; clamping"
                );
                *ceiling = self.worker_count;
            }
        }
        Ok(self)
    }

    /// Effective ceiling for a job type; unlisted types may use every slot
    pub fn ceiling_for(&self, job_type: &str) -> usize {
        self.concurrency
            .get(job_type)
            .copied()
            .unwrap_or(self.worker_count)
            .min(self.worker_count)
    }
}

/// Headless worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with other services
    pub common: CommonConfig,

    /// Queue and dispatch settings
    pub jobs: JobsConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            common: CommonConfig::from_env()?,
            jobs: JobsConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        temp_env::with_vars_unset(
            [
                "JOB_WORKERS",
                "JOB_POLL_INTERVAL_MS",
                "JOB_MAX_ATTEMPTS",
                "JOB_RETENTION_HOURS",
                "JOB_HLS_CONCURRENCY",
                "JOB_RETRY_BACKOFF",
            ],
            || {
                let config = JobsConfig::from_env().unwrap();
                assert_eq!(config.worker_count, 2);
                assert_eq!(config.poll_interval, Duration::from_millis(500));
                assert_eq!(config.max_attempts, 3);
                assert_eq!(config.retention, Duration::from_secs(168 * 3600));
                assert_eq!(config.ceiling_for("hls"), 2);
                assert_eq!(config.ceiling_for("index"), 1);
                assert_eq!(config.backoff, BackoffPolicy::Linear(Duration::from_secs(30)));
            },
        );
    }

    #[test]
    fn test_ceiling_clamped_to_pool_size() {
        temp_env::with_vars(
            [("JOB_WORKERS", Some("3")), ("JOB_HLS_CONCURRENCY", Some("8"))],
            || {
                let config = JobsConfig::from_env().unwrap();
                assert_eq!(config.ceiling_for("hls"), 3);
            },
        );
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        temp_env::with_var("JOB_INDEX_CONCURRENCY", Some("0"), || {
            let err = JobsConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("index"));
        });
    }

    #[test]
    fn test_zero_workers_rejected() {
        temp_env::with_var("JOB_WORKERS", Some("0"), || {
            assert!(JobsConfig::from_env().is_err());
        });
    }

    #[test]
    fn test_zero_values_disable_optional_timers() {
        temp_env::with_vars(
            [
                ("JOB_RETENTION_HOURS", Some("0")),
                ("JOB_EXECUTION_TIMEOUT_SECS", Some("0")),
                ("HLS_LEASE_TIMEOUT_SECS", Some("0")),
            ],
            || {
                let config = JobsConfig::from_env().unwrap();
                assert!(config.retention.is_zero());
                assert_eq!(config.execution_timeout, None);
                assert_eq!(config.resource_lease_timeout, None);
            },
        );
    }

    #[test]
    fn test_oversized_retention_rejected() {
        temp_env::with_var("JOB_RETENTION_HOURS", Some(u64::MAX.to_string()), || {
            let err = JobsConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("JOB_RETENTION_HOURS"));
        });
    }

    #[test]
    fn test_unlisted_type_may_use_every_slot() {
        let config = JobsConfig::default();
        assert_eq!(config.ceiling_for("thumbnail"), config.worker_count);
    }

    #[test]
    fn test_invalid_number_names_variable() {
        temp_env::with_var("JOB_MAX_ATTEMPTS", Some("three"), || {
            let err = JobsConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("JOB_MAX_ATTEMPTS"));
        });
    }
}
