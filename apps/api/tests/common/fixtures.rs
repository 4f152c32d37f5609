//! Test application and token fixtures

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use reelhouse_api::middleware::{Claims, UserRole};
use reelhouse_api::{
    build_router, AppState, InFlightLimiter, RateLimitSettings, RateLimitState, TokenVerifier,
};
use reelhouse_worker::clock::SystemClock;
use reelhouse_worker::{BackoffPolicy, MemoryJobStore, ResourceLeases, StatusPublisher};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const TEST_SECRET: &str = "integration-test-secret-at-least-32-chars";

/// Sign a token for `sub` valid for the next hour
pub fn token(sub: &str, role: UserRole) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        role,
        exp: chrono::Utc::now().timestamp() + 3600,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("failed to sign test token")
}

pub fn admin_token() -> String {
    token("admin-1", UserRole::Admin)
}

pub fn user_token() -> String {
    token("alice", UserRole::User)
}

/// The full router plus handles on everything behind it
pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryJobStore>,
    pub publisher: StatusPublisher,
    pub leases: ResourceLeases,
    pub in_flight: InFlightLimiter,
    pub shutdown: CancellationToken,
    pub hls_dir: TempDir,
}

impl TestApp {
    /// No in-flight cap and no rate limiting
    pub fn new() -> Self {
        Self::with_admission(0, RateLimitSettings::default())
    }

    pub fn with_admission(max_in_flight: usize, rate_limit: RateLimitSettings) -> Self {
        let store = Arc::new(MemoryJobStore::new(
            Arc::new(SystemClock),
            BackoffPolicy::immediate(),
        ));
        let publisher = StatusPublisher::new();
        let leases = ResourceLeases::new(None);
        let hls_dir = tempfile::tempdir().expect("failed to create temp dir");
        let tokens = TokenVerifier::new(TEST_SECRET);
        let shutdown = CancellationToken::new();

        let state = AppState::new(
            store.clone(),
            publisher.clone(),
            leases.clone(),
            tokens.clone(),
            hls_dir.path().to_path_buf(),
        )
        .with_stream_refresh(Duration::from_millis(20))
        .with_shutdown(shutdown.clone());

        let in_flight = InFlightLimiter::new(max_in_flight);
        let limits = RateLimitState::new(&rate_limit, tokens);
        let router = build_router(state, in_flight.clone(), limits);

        Self {
            router,
            store,
            publisher,
            leases,
            in_flight,
            shutdown,
            hls_dir,
        }
    }
}
