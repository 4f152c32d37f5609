//! Global cap on concurrently processed requests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ApiError;

/// Process-wide in-flight counter; a maximum of 0 disables the cap
#[derive(Debug, Clone)]
pub struct InFlightLimiter {
    current: Arc<AtomicUsize>,
    max: usize,
}

impl InFlightLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            current: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Take a slot, or `None` when already at the cap. A rejected attempt
    /// leaves the counter untouched.
    pub fn try_acquire(&self) -> Option<InFlightPermit> {
        let max = self.max;
        self.current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (max == 0 || current < max).then_some(current + 1)
            })
            .ok()
            .map(|_| InFlightPermit {
                current: Arc::clone(&self.current),
            })
    }
}

/// Releases its slot exactly once, on drop
#[derive(Debug)]
pub struct InFlightPermit {
    current: Arc<AtomicUsize>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Middleware rejecting requests with 503 once the cap is reached
pub async fn limit_in_flight(
    State(limiter): State<InFlightLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(_permit) = limiter.try_acquire() else {
        return ApiError::ServiceBusy(format!(
            "too many requests in flight (max {})",
            limiter.max()
        ))
        .into_response();
    };
    next.run(request).await
}
