//! Claim loop and job execution.
//!
//! The dispatcher owns the worker pool. Each pass it claims jobs while a
//! slot is free and at least one job type is under its ceiling, spawning a
//! task per claimed job. Running jobs never block the loop: it wakes on the
//! poll interval, on a finished job, or on shutdown.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::JobsConfig;
use crate::error::WorkerError;
use crate::pool::{WorkerPool, WorkerSlot};
use crate::publisher::StatusPublisher;
use crate::registry::{HandlerRegistry, JobContext};
use crate::store::{Job, JobStore};

/// Running-job counters per type, checked against each type's ceiling
#[derive(Debug)]
pub struct TypeLimits {
    limits: HashMap<String, (usize, Arc<AtomicUsize>)>,
}

impl TypeLimits {
    pub fn new<'a>(job_types: impl IntoIterator<Item = &'a str>, config: &JobsConfig) -> Self {
        let limits = job_types
            .into_iter()
            .map(|job_type| {
                let ceiling = config.ceiling_for(job_type);
                (job_type.to_string(), (ceiling, Arc::new(AtomicUsize::new(0))))
            })
            .collect();
        Self { limits }
    }

    /// Types with spare capacity, sorted for stable claim queries
    pub fn eligible(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .limits
            .iter()
            .filter(|(_, (ceiling, running))| running.load(Ordering::SeqCst) < *ceiling)
            .map(|(job_type, _)| job_type.clone())
            .collect();
        types.sort_unstable();
        types
    }

    pub fn running(&self, job_type: &str) -> usize {
        self.limits
            .get(job_type)
            .map(|(_, running)| running.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn acquire(&self, job_type: &str) -> TypeGuard {
        let counter = self.limits.get(job_type).map(|(_, running)| {
            running.fetch_add(1, Ordering::SeqCst);
            Arc::clone(running)
        });
        TypeGuard { counter }
    }
}

/// Holds one unit of a type's running count until dropped
struct TypeGuard {
    counter: Option<Arc<AtomicUsize>>,
}

impl Drop for TypeGuard {
    fn drop(&mut self) {
        if let Some(counter) = &self.counter {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    publisher: StatusPublisher,
    pool: WorkerPool,
    limits: TypeLimits,
    poll_interval: Duration,
    execution_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        publisher: StatusPublisher,
        node_id: &str,
        config: &JobsConfig,
    ) -> Self {
        let limits = TypeLimits::new(registry.job_types(), config);
        Self {
            store,
            registry: Arc::new(registry),
            publisher,
            pool: WorkerPool::new(node_id, config.worker_count),
            limits,
            poll_interval: config.poll_interval,
            execution_timeout: config.execution_timeout,
        }
    }

    pub fn limits(&self) -> &TypeLimits {
        &self.limits
    }

    /// Claim loop; returns once `shutdown` fires and running jobs have finished
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            workers = self.pool.size(),
            job_types = ?self.registry.job_types(),
            "Dispatcher started"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut running = JoinSet::new();

        loop {
            self.dispatch_available(&mut running).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                Some(finished) = running.join_next(), if !running.is_empty() => {
                    if let Err(err) = finished {
                        tracing::error!(error = %err, "Job task aborted");
                    }
                }
            }
        }

        tracing::info!(
            running = running.len(),
            "Dispatcher stopping, waiting for running jobs"
        );
        while let Some(finished) = running.join_next().await {
            if let Err(err) = finished {
                tracing::error!(error = %err, "Job task aborted");
            }
        }
        tracing::info!("Dispatcher stopped");
    }

    /// Claim and start as many jobs as slots and ceilings allow
    pub async fn dispatch_available(&mut self, running: &mut JoinSet<()>) -> usize {
        let mut started = 0;
        loop {
            let eligible = self.limits.eligible();
            if eligible.is_empty() {
                break;
            }
            let Some(slot) = self.pool.try_acquire() else {
                break;
            };

            let job = match self.store.claim_next(slot.worker_id(), &eligible).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(error = %err, "Failed to claim next job");
                    break;
                }
            };

            tracing::debug!(
                job_id = job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                worker_id = slot.worker_id(),
                "Claimed job"
            );
            self.publisher.publish(&job);

            let execution = Execution {
                store: Arc::clone(&self.store),
                registry: Arc::clone(&self.registry),
                publisher: self.publisher.clone(),
                execution_timeout: self.execution_timeout,
                type_guard: self.limits.acquire(&job.job_type),
                slot,
            };
            running.spawn(execution.run(job));
            started += 1;
        }
        started
    }
}

/// Everything a spawned job task owns; slot and type count are released on drop
struct Execution {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    publisher: StatusPublisher,
    execution_timeout: Option<Duration>,
    type_guard: TypeGuard,
    slot: WorkerSlot,
}

impl Execution {
    async fn run(self, job: Job) {
        let ctx = JobContext {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            worker_id: self.slot.worker_id().to_string(),
        };
        let span = tracing::info_span!(
            "job",
            job_id = job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            worker = %ctx.worker_id
        );

        async move {
            let started = Instant::now();
            let handler = self.registry.execute(&ctx, job.payload);
            let outcome = match self.execution_timeout {
                Some(limit) => {
                    let guarded = AssertUnwindSafe(handler).catch_unwind();
                    match tokio::time::timeout(limit, guarded).await {
                        Ok(result) => result,
                        Err(_) => Ok(Err(WorkerError::Timeout {
                            seconds: limit.as_secs(),
                        })),
                    }
                }
                None => AssertUnwindSafe(handler).catch_unwind().await,
            }
            .unwrap_or_else(|panic| Err(WorkerError::Panicked(panic_message(&*panic))));
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let reported = match outcome {
                Ok(result) => {
                    tracing::info!(elapsed_ms, "Job succeeded");
                    self.store
                        .report_success(ctx.job_id, &ctx.worker_id, result)
                        .await
                }
                Err(err) => {
                    err.log();
                    self.store
                        .report_failure(ctx.job_id, &ctx.worker_id, &err.to_string())
                        .await
                }
            };

            match reported {
                Ok(Some(updated)) => {
                    if updated.status.is_terminal() {
                        tracing::info!(status = %updated.status, "Job finished");
                    } else {
                        tracing::info!(
                            status = %updated.status,
                            retry_at = %updated.scheduled_at,
                            "Job will be retried"
                        );
                    }
                    self.publisher.publish(&updated);
                }
                Ok(None) => {
                    tracing::warn!("Job lease was lost before completion was recorded");
                }
                Err(err) => {
                    tracing::error!(error = %err, "Failed to record job outcome");
                }
            }

            drop(self.type_guard);
            drop(self.slot);
        }
        .instrument(span)
        .await
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
