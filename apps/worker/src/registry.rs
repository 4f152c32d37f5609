//! Handler registry keyed by job type.
//!
//! Handlers are written against typed payloads and outputs; the registry
//! erases them behind a JSON-in/JSON-out interface so the store never has
//! to know what a payload looks like.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{WorkerError, WorkerResult};

/// What a handler knows about the attempt it is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: i64,
    pub job_type: String,
    /// 1-based attempt number
    pub attempt: i32,
    pub max_attempts: i32,
    pub worker_id: String,
}

/// A job type's decode/execute/encode contract
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Tag stored in `job_queue.job_type`
    const JOB_TYPE: &'static str;

    type Payload: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    async fn execute(&self, ctx: &JobContext, payload: Self::Payload) -> WorkerResult<Self::Output>;
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext, payload: Value) -> WorkerResult<Value>;
}

struct Typed<H>(H);

#[async_trait]
impl<H: JobHandler> ErasedHandler for Typed<H> {
    async fn run(&self, ctx: &JobContext, payload: Value) -> WorkerResult<Value> {
        let input: H::Payload = serde_json::from_value(payload)
            .map_err(|e| WorkerError::InvalidPayload(format!("{}: {e}", H::JOB_TYPE)))?;
        let output = self.0.execute(ctx, input).await?;
        Ok(serde_json::to_value(output)?)
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register<H: JobHandler>(mut self, handler: H) -> Self {
        if self
            .handlers
            .insert(H::JOB_TYPE, Arc::new(Typed(handler)))
            .is_some()
        {
            tracing::warn!(job_type = H::JOB_TYPE, "Replacing existing job handler");
        }
        self
    }

    /// Registered job types, sorted
    pub fn job_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn execute(&self, ctx: &JobContext, payload: Value) -> WorkerResult<Value> {
        let handler = self
            .handlers
            .get(ctx.job_type.as_str())
            .ok_or_else(|| WorkerError::UnknownJobType(ctx.job_type.clone()))?;
        handler.run(ctx, payload).await
    }
}
