//! In-process [`JobStore`] used by tests and single-binary development runs.
//!
//! All transitions happen under one mutex, which makes each of them a
//! single atomic test-and-set exactly like the conditional `UPDATE`s in the
//! Postgres store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    lease_expired_message, FailurePlan, Job, JobCounts, JobStatus, JobStore, NewJob, StoreError,
    StoreResult,
};
use crate::backoff::BackoffPolicy;
use crate::clock::{Clock, SystemClock};

#[derive(Default)]
struct Inner {
    next_id: i64,
    jobs: BTreeMap<i64, Job>,
}

pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), BackoffPolicy::default())
    }
}

impl MemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>, backoff: BackoffPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            backoff,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn to_chrono(duration: Duration) -> StoreResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| StoreError::InvalidArgument(format!("duration {duration:?} out of range")))
}

fn release_lease(job: &mut Job) {
    job.locked_at = None;
    job.locked_by = None;
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, new_job: NewJob) -> StoreResult<i64> {
        let now = self.now();
        let mut inner = self.inner.lock().await;

        if let Some(key) = new_job.dedup_key.as_deref() {
            let existing = inner.jobs.values().find(|job| {
                job.job_type == new_job.job_type
                    && job.dedup_key.as_deref() == Some(key)
                    && !job.status.is_terminal()
            });
            if let Some(job) = existing {
                return Ok(job.id);
            }
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.jobs.insert(
            id,
            Job {
                id,
                job_type: new_job.job_type,
                status: JobStatus::Queued,
                payload: new_job.payload,
                result: None,
                attempts: 0,
                max_attempts: new_job.max_attempts,
                last_error: None,
                dedup_key: new_job.dedup_key,
                scheduled_at: now,
                locked_at: None,
                locked_by: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        eligible_types: &[String],
    ) -> StoreResult<Option<Job>> {
        if eligible_types.is_empty() {
            return Ok(None);
        }
        let now = self.now();
        let mut inner = self.inner.lock().await;

        let next_id = inner
            .jobs
            .values()
            .filter(|job| {
                job.status.is_claimable()
                    && job.scheduled_at <= now
                    && job.has_attempts_left()
                    && eligible_types.iter().any(|t| *t == job.job_type)
            })
            .min_by_key(|job| (job.scheduled_at, job.id))
            .map(|job| job.id);

        let Some(job) = next_id.and_then(|id| inner.jobs.get_mut(&id)) else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.locked_at = Some(now);
        job.locked_by = Some(worker_id.to_string());
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn report_success(
        &self,
        id: i64,
        worker_id: &str,
        result: Value,
    ) -> StoreResult<Option<Job>> {
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&id).filter(|j| j.is_leased_by(worker_id)) else {
            return Ok(None);
        };
        job.status = JobStatus::Done;
        job.result = Some(result);
        release_lease(job);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn report_failure(
        &self,
        id: i64,
        worker_id: &str,
        error: &str,
    ) -> StoreResult<Option<Job>> {
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&id).filter(|j| j.is_leased_by(worker_id)) else {
            return Ok(None);
        };
        let plan = FailurePlan::decide(job.attempts, job.max_attempts, &self.backoff);
        if let Some(delay) = plan.retry_in {
            job.scheduled_at = now + to_chrono(delay)?;
        }
        job.status = plan.status;
        job.last_error = Some(error.to_string());
        release_lease(job);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn get(&self, id: i64) -> StoreResult<Option<Job>> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Job>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let offset = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .rev()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> StoreResult<JobCounts> {
        let inner = self.inner.lock().await;
        let mut counts = JobCounts::default();
        for job in inner.jobs.values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn reap_expired(&self, running_timeout: Duration) -> StoreResult<Vec<Job>> {
        let now = self.now();
        let cutoff = now - to_chrono(running_timeout)?;
        let message = lease_expired_message(running_timeout);
        let mut inner = self.inner.lock().await;

        let mut reaped = Vec::new();
        for job in inner.jobs.values_mut() {
            let expired = job.status == JobStatus::Running
                && job.locked_at.is_some_and(|locked_at| locked_at < cutoff);
            if !expired {
                continue;
            }
            if job.has_attempts_left() {
                job.status = JobStatus::Retry;
                job.scheduled_at = now;
            } else {
                job.status = JobStatus::Failed;
            }
            job.last_error = Some(message.clone());
            release_lease(job);
            job.updated_at = now;
            reaped.push(job.clone());
        }
        Ok(reaped)
    }

    async fn delete_terminal_older_than(&self, retention: Duration) -> StoreResult<u64> {
        if retention.is_zero() {
            return Ok(0);
        }
        let cutoff = self.now() - to_chrono(retention)?;
        let mut inner = self.inner.lock().await;
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        Ok((before - inner.jobs.len()) as u64)
    }
}
