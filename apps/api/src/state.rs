//! Shared application state

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use reelhouse_worker::{JobStore, ResourceLeases, StatusPublisher};
use tokio_util::sync::CancellationToken;

use crate::middleware::{InFlightLimiter, TokenVerifier};

/// State handed to every job and health handler
#[derive(Clone)]
pub struct AppState {
    /// Durable job queue
    pub store: Arc<dyn JobStore>,
    /// In-process fan-out of job transitions
    pub publisher: StatusPublisher,
    /// Per-media transcode leases, shared with embedded workers
    pub leases: ResourceLeases,
    pub tokens: TokenVerifier,
    /// `max_attempts` for jobs enqueued through the API
    pub max_attempts: i32,
    /// Directory holding one segment directory per media id
    pub hls_root: PathBuf,
    /// How often status streams re-read the job from the store
    pub stream_refresh: Duration,
    /// Cancelled on shutdown; ends open status streams
    pub shutdown: CancellationToken,
    /// Request cap, reported by the admin metrics view
    pub in_flight: InFlightLimiter,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: StatusPublisher,
        leases: ResourceLeases,
        tokens: TokenVerifier,
        hls_root: PathBuf,
    ) -> Self {
        Self {
            store,
            publisher,
            leases,
            tokens,
            max_attempts: 3,
            hls_root,
            stream_refresh: Duration::from_millis(500),
            shutdown: CancellationToken::new(),
            in_flight: InFlightLimiter::new(0),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_stream_refresh(mut self, refresh: Duration) -> Self {
        self.stream_refresh = refresh;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_in_flight(mut self, in_flight: InFlightLimiter) -> Self {
        self.in_flight = in_flight;
        self
    }
}

impl FromRef<AppState> for TokenVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}
