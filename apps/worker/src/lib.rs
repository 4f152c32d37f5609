//! Reelhouse background job subsystem
//!
//! A durable job queue with atomic claims, a bounded worker pool with
//! per-type ceilings, lease-based crash recovery, retention cleanup and
//! live status fan-out. The API server embeds [`JobRuntime`]; the
//! `reelhouse-worker` binary runs it headless.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod jobs;
pub mod media;
pub mod pool;
pub mod publisher;
pub mod reaper;
pub mod registry;
pub mod resource_lease;
pub mod retention;
pub mod runtime;
pub mod store;

use std::time::Duration;

use reelhouse_shared_config::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};

pub use backoff::BackoffPolicy;
pub use config::JobsConfig;
pub use error::{WorkerError, WorkerResult};
pub use jobs::{build_registry, JobRequest, JobServices};
pub use publisher::StatusPublisher;
pub use registry::{HandlerRegistry, JobContext, JobHandler};
pub use resource_lease::ResourceLeases;
pub use runtime::{JobRuntime, RuntimeHandle};
pub use store::{Job, JobCounts, JobStatus, JobStore, MemoryJobStore, NewJob, PgJobStore};

/// Schema for the job queue and media index
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open a Postgres pool sized from configuration
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!(url = %config.redacted_url(), "Connecting to database");
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await
}
