//! Stores, configs and polling helpers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reelhouse_worker::clock::ManualClock;
use reelhouse_worker::store::{Job, JobStore, MemoryJobStore, NewJob};
use reelhouse_worker::{BackoffPolicy, JobsConfig};
use serde_json::{json, Value};

/// In-memory store driven by a manual clock
pub fn manual_store(backoff: BackoffPolicy) -> (Arc<MemoryJobStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryJobStore::new(clock.clone(), backoff));
    (store, clock)
}

/// In-memory store on the system clock with no retry delay
pub fn live_store() -> Arc<MemoryJobStore> {
    Arc::new(MemoryJobStore::new(
        Arc::new(reelhouse_worker::clock::SystemClock),
        BackoffPolicy::immediate(),
    ))
}

/// Fast-polling config for runtime tests
pub fn fast_config(workers: usize, ceilings: &[(&str, usize)]) -> JobsConfig {
    JobsConfig {
        worker_count: workers,
        poll_interval: Duration::from_millis(10),
        backoff: BackoffPolicy::immediate(),
        reaper_interval: Duration::from_millis(20),
        concurrency: ceilings
            .iter()
            .map(|(job_type, ceiling)| (job_type.to_string(), *ceiling))
            .collect::<HashMap<_, _>>(),
        ..JobsConfig::default()
    }
}

pub fn new_job(job_type: &str, payload: Value, max_attempts: i32) -> NewJob {
    NewJob::new(job_type, payload, max_attempts)
}

pub fn empty_job(job_type: &str) -> NewJob {
    NewJob::new(job_type, json!({}), 3)
}

/// Poll the store until `done` returns true or five seconds pass
pub async fn wait_for<F>(store: &dyn JobStore, id: i64, done: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = store
            .get(id)
            .await
            .expect("store read failed")
            .expect("job disappeared");
        if done(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on job {id}; last state {:?}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_terminal(store: &dyn JobStore, id: i64) -> Job {
    wait_for(store, id, |job| job.status.is_terminal()).await
}
