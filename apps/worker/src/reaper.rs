//! Lease reaper: takes back jobs whose worker crashed or hung.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::publisher::StatusPublisher;
use crate::store::{JobStatus, JobStore, StoreResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Put back in the queue with attempts remaining
    pub retried: usize,
    /// Out of attempts
    pub failed: usize,
}

impl ReapSummary {
    pub fn total(&self) -> usize {
        self.retried + self.failed
    }
}

pub struct LeaseReaper {
    store: Arc<dyn JobStore>,
    publisher: StatusPublisher,
    running_timeout: Duration,
    interval: Duration,
}

impl LeaseReaper {
    /// `None` when the running timeout is zero (reaping disabled)
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: StatusPublisher,
        running_timeout: Duration,
        interval: Duration,
    ) -> Option<Self> {
        if running_timeout.is_zero() {
            return None;
        }
        Some(Self {
            store,
            publisher,
            running_timeout,
            interval,
        })
    }

    pub async fn sweep(&self) -> StoreResult<ReapSummary> {
        let reaped = self.store.reap_expired(self.running_timeout).await?;

        let mut summary = ReapSummary::default();
        for job in &reaped {
            match job.status {
                JobStatus::Failed => summary.failed += 1,
                _ => summary.retried += 1,
            }
            tracing::warn!(
                job_id = job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                status = %job.status,
                "Reclaimed job with expired lease"
            );
            self.publisher.publish(job);
        }
        Ok(summary)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            running_timeout_secs = self.running_timeout.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Lease reaper started"
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(summary) if summary.total() > 0 => {
                            tracing::info!(
                                retried = summary.retried,
                                failed = summary.failed,
                                "Lease reaper sweep finished"
                            );
                        }
                        Ok(_) => tracing::trace!("Lease reaper found nothing to reclaim"),
                        Err(err) => tracing::error!(error = %err, "Lease reaper sweep failed"),
                    }
                }
            }
        }
        tracing::info!("Lease reaper stopped");
    }
}
