//! Handlers with scripted behaviour

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use reelhouse_worker::{JobContext, JobHandler, WorkerError, WorkerResult};

/// Fails with `"transient failure on attempt N"` until `succeed_on`
pub struct FlakyJob {
    pub succeed_on: i32,
}

#[async_trait]
impl JobHandler for FlakyJob {
    const JOB_TYPE: &'static str = "flaky";
    type Payload = Value;
    type Output = i32;

    async fn execute(&self, ctx: &JobContext, _payload: Value) -> WorkerResult<i32> {
        if ctx.attempt < self.succeed_on {
            return Err(WorkerError::Internal(format!(
                "transient failure on attempt {}",
                ctx.attempt
            )));
        }
        Ok(ctx.attempt)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SleepPayload {
    pub millis: u64,
}

/// Sleeps, tracking how many executions overlap
#[derive(Clone, Default)]
pub struct SleepyJob {
    pub running: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    pub finished: Arc<AtomicUsize>,
}

impl SleepyJob {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for SleepyJob {
    const JOB_TYPE: &'static str = "sleepy";
    type Payload = SleepPayload;
    type Output = ();

    async fn execute(&self, _ctx: &JobContext, payload: SleepPayload) -> WorkerResult<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(payload.millis)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Always panics
pub struct PanickingJob;

#[async_trait]
impl JobHandler for PanickingJob {
    const JOB_TYPE: &'static str = "panicky";
    type Payload = Value;
    type Output = ();

    async fn execute(&self, _ctx: &JobContext, _payload: Value) -> WorkerResult<()> {
        panic!("boom");
    }
}

/// Echoes its payload back as the result
pub struct EchoJob;

#[async_trait]
impl JobHandler for EchoJob {
    const JOB_TYPE: &'static str = "echo";
    type Payload = Value;
    type Output = Value;

    async fn execute(&self, _ctx: &JobContext, payload: Value) -> WorkerResult<Value> {
        Ok(payload)
    }
}
