//! Durable job queue.
//!
//! Every state change of a job goes through a [`JobStore`] method; nothing
//! else writes job rows. Each method is a single atomic transition, so a
//! worker reporting completion and the lease reaper can never both win.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::backoff::BackoffPolicy;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Retry,
    Done,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Queued,
        Self::Running,
        Self::Retry,
        Self::Done,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retry => "retry",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// `done` and `failed` never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// States a worker may claim from
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Queued | Self::Retry)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::InvalidStatus(s.to_string()))
    }
}

/// A unit of deferred work as persisted in the queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    pub job_type: String,
    pub status: JobStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether another failure would still leave room for a retry
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether `worker_id` currently holds this job's lease
    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.locked_by.as_deref() == Some(worker_id)
    }
}

/// Input to [`JobStore::enqueue`]
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub max_attempts: i32,
    /// While a job with the same type and key is still active, enqueueing
    /// returns the existing job instead of creating another one.
    pub dedup_key: Option<String>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: Value, max_attempts: i32) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts: max_attempts.max(1),
            dedup_key: None,
        }
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// Number of jobs in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: i64,
    pub running: i64,
    pub retry: i64,
    pub done: i64,
    pub failed: i64,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus, n: i64) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Running => self.running += n,
            JobStatus::Retry => self.retry += n,
            JobStatus::Done => self.done += n,
            JobStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> i64 {
        self.queued + self.running + self.retry + self.done + self.failed
    }
}

/// Where a failed job goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FailurePlan {
    pub status: JobStatus,
    /// Delay from now before the job is claimable again; `None` when failed
    pub retry_in: Option<Duration>,
}

impl FailurePlan {
    pub(crate) fn decide(attempts: i32, max_attempts: i32, backoff: &BackoffPolicy) -> Self {
        if attempts < max_attempts {
            Self {
                status: JobStatus::Retry,
                retry_in: Some(backoff.delay(attempts)),
            }
        } else {
            Self {
                status: JobStatus::Failed,
                retry_in: None,
            }
        }
    }
}

/// `last_error` recorded when the reaper takes a job back
pub fn lease_expired_message(running_timeout: Duration) -> String {
    format!(
        "lease expired: job was still running after {}s",
        running_timeout.as_secs()
    )
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("unknown job status '{0}'")]
    InvalidStatus(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage backend for the job queue.
///
/// Completion reports carry the reporting worker's id and only apply while
/// that worker still holds the lease; a report that lost the race (for
/// example against the reaper) returns `Ok(None)` and changes nothing.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a `queued` job claimable immediately. Returns the new id, or
    /// the id of the active job sharing the same dedup key.
    async fn enqueue(&self, job: NewJob) -> StoreResult<i64>;

    /// Atomically lease the oldest claimable job whose type is in
    /// `eligible_types`: `running`, `locked_by = worker_id`, `attempts + 1`.
    async fn claim_next(&self, worker_id: &str, eligible_types: &[String])
        -> StoreResult<Option<Job>>;

    /// `running -> done`, storing `result`. `last_error` is left untouched.
    async fn report_success(&self, id: i64, worker_id: &str, result: Value)
        -> StoreResult<Option<Job>>;

    /// `running -> retry` (after backoff) or `running -> failed` once
    /// attempts are exhausted. Always records `error` as `last_error`.
    async fn report_failure(&self, id: i64, worker_id: &str, error: &str)
        -> StoreResult<Option<Job>>;

    async fn get(&self, id: i64) -> StoreResult<Option<Job>>;

    /// Newest first
    async fn list(&self, status: Option<JobStatus>, limit: i64, offset: i64)
        -> StoreResult<Vec<Job>>;

    async fn count_by_status(&self) -> StoreResult<JobCounts>;

    /// Take back every `running` job leased longer than `running_timeout`.
    /// Returns the jobs in their new state.
    async fn reap_expired(&self, running_timeout: Duration) -> StoreResult<Vec<Job>>;

    /// Delete `done`/`failed` jobs last updated more than `retention` ago.
    /// A zero retention deletes nothing.
    async fn delete_terminal_older_than(&self, retention: Duration) -> StoreResult<u64>;

    /// Cheap liveness probe for readiness checks
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
