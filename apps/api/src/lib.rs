//! Reelhouse API library
//!
//! This module exposes the router and its building blocks for use in
//! integration tests and by the server binary.

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

use axum::{middleware::from_fn_with_state, routing::get, Router};
use tower_http::trace::TraceLayer;

// Re-export commonly used types
pub use config::{Config, RateLimitSettings};
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use middleware::{InFlightLimiter, RateLimitState, TokenVerifier};
pub use state::AppState;

use routes::{health_router, jobs_router};

/// Assemble the application router.
///
/// Everything under `/api` passes the in-flight cap first, then the rate
/// limiter. Health probes bypass both.
pub fn build_router(state: AppState, in_flight: InFlightLimiter, limits: RateLimitState) -> Router {
    let state = state.with_in_flight(in_flight.clone());
    let api = jobs_router(state.clone())
        .layer(from_fn_with_state(limits, middleware::rate_limit))
        .layer(from_fn_with_state(in_flight, middleware::limit_in_flight));

    Router::new()
        .route("/", get(root))
        .nest("/health", health_router(state))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

async fn root() -> &'static str {
    "Reelhouse - Self-hosted Media Library"
}
