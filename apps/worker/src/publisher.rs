//! Per-job status fan-out.
//!
//! Each watched job gets its own broadcast channel. Publishing never waits
//! on subscribers: a subscriber that falls behind sees `Lagged` and
//! re-reads the job from the store instead of replaying every event.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::store::{Job, JobStore};

/// Per-job channel depth; a job has only a handful of transitions
const BROADCAST_CAPACITY: usize = 16;

#[derive(Clone, Default)]
pub struct StatusPublisher {
    channels: Arc<DashMap<i64, broadcast::Sender<Job>>>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a transition to everyone watching `job.id`.
    ///
    /// A terminal state closes the job's channel after delivery.
    pub fn publish(&self, job: &Job) {
        if job.status.is_terminal() {
            if let Some((_, sender)) = self.channels.remove(&job.id) {
                let _ = sender.send(job.clone());
            }
            return;
        }

        let delivered = match self.channels.get(&job.id) {
            Some(sender) => sender.send(job.clone()).is_ok(),
            None => return,
        };
        if !delivered {
            self.release(job.id);
        }
    }

    pub fn subscribe(&self, job_id: i64) -> broadcast::Receiver<Job> {
        self.channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, job_id: i64) -> usize {
        self.channels
            .get(&job_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of jobs with an open channel
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn release(&self, job_id: i64) {
        self.channels
            .remove_if(&job_id, |_, sender| sender.receiver_count() == 0);
    }

    /// Stream a job's current state followed by each later transition,
    /// ending after a terminal state.
    ///
    /// Besides pushed events the store is re-read every `refresh`, which
    /// picks up transitions made by another process. Repeated states are
    /// suppressed. The stream is empty if the job does not exist.
    pub fn watch(
        &self,
        store: Arc<dyn JobStore>,
        job_id: i64,
        refresh: Duration,
    ) -> impl Stream<Item = Job> + Send + 'static {
        let refresh = refresh.max(Duration::from_millis(10));
        let mut ticker = interval_at(Instant::now() + refresh, refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let watch = Watch {
            job_id,
            rx: Some(self.subscribe(job_id)),
            publisher: self.clone(),
            store,
            ticker,
            last: None,
            finished: false,
        };
        stream::unfold(watch, |mut watch| async move {
            let job = watch.next_event().await?;
            Some((job, watch))
        })
    }
}

struct Watch {
    job_id: i64,
    rx: Option<broadcast::Receiver<Job>>,
    publisher: StatusPublisher,
    store: Arc<dyn JobStore>,
    ticker: Interval,
    last: Option<Job>,
    finished: bool,
}

enum Wake {
    Pushed(Result<Job, RecvError>),
    Tick,
}

impl Watch {
    async fn next_event(&mut self) -> Option<Job> {
        if self.finished {
            return None;
        }
        if self.last.is_none() {
            // Subscribed before this read, so nothing after it is missed
            let Some(current) = self.reload().await else {
                self.finished = true;
                return None;
            };
            return Some(self.emit(current));
        }

        loop {
            let wake = match self.rx.as_mut() {
                Some(rx) => tokio::select! {
                    pushed = rx.recv() => Wake::Pushed(pushed),
                    _ = self.ticker.tick() => Wake::Tick,
                },
                None => {
                    self.ticker.tick().await;
                    Wake::Tick
                }
            };

            let candidate = match wake {
                Wake::Pushed(Ok(job)) => Some(job),
                Wake::Pushed(Err(RecvError::Lagged(skipped))) => {
                    tracing::debug!(job_id = self.job_id, skipped, "Status subscriber lagged");
                    self.reload().await
                }
                Wake::Pushed(Err(RecvError::Closed)) => {
                    self.rx = None;
                    self.reload().await
                }
                Wake::Tick => self.reload().await,
            };

            match candidate {
                Some(job) if self.is_new(&job) => return Some(self.emit(job)),
                Some(_) => continue,
                // Deleted underneath us
                None if self.finished => return None,
                None => continue,
            }
        }
    }

    async fn reload(&mut self) -> Option<Job> {
        match self.store.get(self.job_id).await {
            Ok(Some(job)) => Some(job),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                tracing::warn!(job_id = self.job_id, error = %err, "Failed to reload job status");
                None
            }
        }
    }

    fn is_new(&self, job: &Job) -> bool {
        let Some(last) = &self.last else {
            return true;
        };
        if job.updated_at != last.updated_at {
            return job.updated_at > last.updated_at;
        }
        job.status != last.status || job.attempts != last.attempts
    }

    fn emit(&mut self, job: Job) -> Job {
        if job.status.is_terminal() {
            self.finished = true;
        }
        self.last = Some(job.clone());
        job
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if self.rx.take().is_some() {
            self.publisher.release(self.job_id);
        }
    }
}
