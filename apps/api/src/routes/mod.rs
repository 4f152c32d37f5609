//! HTTP route handlers for the Reelhouse API
//!
//! - Job endpoints (enqueue, status, live status stream, admin listing)
//! - Streaming entry point
//! - Health check and readiness endpoints

pub mod health;
pub mod jobs;

pub use health::health_router;
pub use jobs::{jobs_router, AdminMetrics, EnqueueResponse, JobView, StreamStatus};
