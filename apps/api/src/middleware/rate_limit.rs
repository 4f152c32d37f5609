//! Per-identity rate limiting for the API
//!
//! Requests are keyed by authenticated user id, or by client IP for
//! anonymous callers. Block lists reject outright, allow lists skip the
//! window, and everything else goes through an in-memory sliding window of
//! one minute. Counters live in process memory and reset on restart.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::auth::{request_token, TokenVerifier};
use crate::config::RateLimitSettings;
use crate::error::ApiError;

/// Length of the rate limit window
pub const WINDOW: Duration = Duration::from_secs(60);

/// How often idle keys are swept out of memory
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Request timestamps inside the current window
#[derive(Debug, Default)]
struct RateLimitEntry {
    timestamps: VecDeque<Instant>,
}

impl RateLimitEntry {
    /// Remove expired timestamps and add a new one if under the limit
    /// Returns Ok(remaining) if allowed, Err(retry_after_secs) if rate limited
    fn check_and_record(&mut self, now: Instant, max_requests: u32, window: Duration) -> Result<u32, u64> {
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }

        let current_count = self.timestamps.len() as u32;
        if current_count < max_requests {
            self.timestamps.push_back(now);
            return Ok(max_requests - current_count - 1);
        }

        // Capacity frees up once the oldest request leaves the window
        let retry_after = match self.timestamps.front() {
            Some(&oldest) => window.saturating_sub(now.duration_since(oldest)),
            None => window,
        };
        Err(retry_after.as_secs().max(1))
    }

    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        self.timestamps
            .back()
            .map_or(true, |&newest| now.duration_since(newest) >= window)
    }
}

/// In-memory sliding window limiter keyed by identity
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    entries: RwLock<HashMap<String, RateLimitEntry>>,
    window: Duration,
    last_cleanup: RwLock<Instant>,
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new(WINDOW)
    }
}

impl InMemoryRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            window,
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Record a request against `key` if it fits in the window
    ///
    /// Returns Ok(remaining) if allowed, Err(retry_after) if rate limited
    pub async fn check(&self, key: &str, max_requests: u32) -> Result<u32, u64> {
        let now = Instant::now();
        self.maybe_cleanup(now).await;

        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_default();
        let result = entry.check_and_record(now, max_requests, self.window);

        match &result {
            Ok(remaining) => debug!(key, remaining, "Rate limit check passed"),
            Err(retry_after) => debug!(key, retry_after, "Rate limit exceeded"),
        }
        result
    }

    /// Drop keys with no requests in the window to bound memory
    async fn maybe_cleanup(&self, now: Instant) {
        {
            let last_cleanup = self.last_cleanup.read().await;
            if now.duration_since(*last_cleanup) < CLEANUP_INTERVAL {
                return;
            }
        }

        let mut last_cleanup = self.last_cleanup.write().await;
        // Double-check after acquiring write lock
        if now.duration_since(*last_cleanup) < CLEANUP_INTERVAL {
            return;
        }
        *last_cleanup = now;
        drop(last_cleanup);

        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now, self.window));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Cleaned up idle rate limit entries");
        }
    }

    /// Number of tracked keys
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Who a request is counted against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub ip: String,
}

impl Identity {
    pub fn key(&self) -> String {
        match &self.user_id {
            Some(user_id) => format!("user:{user_id}"),
            None => format!("ip:{}", canonical_ip(&self.ip)),
        }
    }
}

/// `::1` and `0:0::1` are the same client; anything unparseable is kept as is
fn canonical_ip(ip: &str) -> String {
    ip.parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| ip.to_string())
}

/// Outcome of an admitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Allow-listed or limiting disabled for this identity
    Unlimited,
    /// Counted against a window
    Limited { limit: u32, remaining: u32 },
}

/// Block and allow lists plus the per-identity windows
#[derive(Debug)]
pub struct RateLimitPolicy {
    user_limit: u32,
    ip_limit: u32,
    allow_users: HashSet<String>,
    allow_ips: HashSet<String>,
    block_users: HashSet<String>,
    block_ips: HashSet<String>,
    trust_proxy: bool,
    limiter: InMemoryRateLimiter,
}

impl RateLimitPolicy {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            user_limit: settings.user_limit(),
            ip_limit: settings.ip_limit(),
            allow_users: settings.allow_users.iter().cloned().collect(),
            allow_ips: normalize_ips(&settings.allow_ips),
            block_users: settings.block_users.iter().cloned().collect(),
            block_ips: normalize_ips(&settings.block_ips),
            trust_proxy: settings.trust_proxy,
            limiter: InMemoryRateLimiter::default(),
        }
    }

    /// Nothing to enforce: no ceilings and no lists
    pub fn is_disabled(&self) -> bool {
        self.user_limit == 0
            && self.ip_limit == 0
            && self.allow_users.is_empty()
            && self.allow_ips.is_empty()
            && self.block_users.is_empty()
            && self.block_ips.is_empty()
    }

    pub fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }

    /// Check lists, then the window for the identity's key
    pub async fn admit(&self, identity: &Identity) -> Result<Admission, ApiError> {
        if let Some(user_id) = &identity.user_id {
            if self.block_users.contains(user_id) {
                return Err(ApiError::Blocked);
            }
            if self.allow_users.contains(user_id) {
                return Ok(Admission::Unlimited);
            }
        }
        let ip = canonical_ip(&identity.ip);
        if self.block_ips.contains(&ip) {
            return Err(ApiError::Blocked);
        }
        if self.allow_ips.contains(&ip) {
            return Ok(Admission::Unlimited);
        }

        let limit = if identity.user_id.is_some() {
            self.user_limit
        } else {
            self.ip_limit
        };
        if limit == 0 {
            return Ok(Admission::Unlimited);
        }

        match self.limiter.check(&identity.key(), limit).await {
            Ok(remaining) => Ok(Admission::Limited { limit, remaining }),
            Err(retry_after) => Err(ApiError::RateLimited { retry_after }),
        }
    }

    #[cfg(test)]
    pub(crate) fn limiter(&self) -> &InMemoryRateLimiter {
        &self.limiter
    }
}

/// Canonical text form so `::1` and `0:0::1` compare equal
fn normalize_ips(items: &[String]) -> HashSet<String> {
    items
        .iter()
        .map(|item| match item.parse::<IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => {
                warn!(value = %item, "Ignoring invalid IP address in rate limit list");
                item.clone()
            }
        })
        .collect()
}

/// Extract client IP from request headers or connection info
///
/// Forwarding headers are only honoured when `trust_proxy` is set; otherwise
/// any client could pick its own rate limit key.
pub fn extract_client_ip(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    trust_proxy: bool,
) -> String {
    if trust_proxy {
        // Try X-Forwarded-For first (for proxied requests)
        if let Some(forwarded) = headers.get("x-forwarded-for") {
            if let Ok(value) = forwarded.to_str() {
                // X-Forwarded-For can contain multiple IPs, take the first (client IP)
                if let Some(ip) = value.split(',').next() {
                    if let Ok(ip) = ip.trim().parse::<IpAddr>() {
                        return ip.to_string();
                    }
                }
            }
        }

        // Try X-Real-IP (common with nginx)
        if let Some(real_ip) = headers.get("x-real-ip") {
            if let Ok(value) = real_ip.to_str() {
                if let Ok(ip) = value.trim().parse::<IpAddr>() {
                    return ip.to_string();
                }
            }
        }
    }

    if let Some(connect_info) = connect_info {
        return connect_info.0.ip().to_string();
    }

    warn!("Could not determine client IP for rate limiting");
    "unknown".to_string()
}

/// State for the rate limiting middleware
#[derive(Clone)]
pub struct RateLimitState {
    pub policy: Arc<RateLimitPolicy>,
    pub tokens: TokenVerifier,
}

impl RateLimitState {
    pub fn new(settings: &RateLimitSettings, tokens: TokenVerifier) -> Self {
        Self {
            policy: Arc::new(RateLimitPolicy::new(settings)),
            tokens,
        }
    }

    fn identity(&self, request: &Request<Body>) -> Identity {
        let user_id = request_token(request.headers(), request.uri())
            .and_then(|token| self.tokens.verify(&token).ok())
            .map(|claims| claims.sub);
        let ip = extract_client_ip(
            request.headers(),
            request.extensions().get::<ConnectInfo<SocketAddr>>(),
            self.policy.trust_proxy(),
        );
        Identity { user_id, ip }
    }
}

/// Middleware applying [`RateLimitPolicy`] to every request
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if state.policy.is_disabled() {
        return next.run(request).await;
    }

    let identity = state.identity(&request);
    match state.policy.admit(&identity).await {
        Ok(Admission::Unlimited) => next.run(request).await,
        Ok(Admission::Limited { limit, remaining }) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
            response
        }
        Err(err) => {
            warn!(key = %identity.key(), error = %err, "Request rejected by rate limiter");
            err.into_response()
        }
    }
}
