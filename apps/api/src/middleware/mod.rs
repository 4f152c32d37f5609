//! Middleware components for Reelhouse API
//!
//! Authentication extractors:
//! - `AuthUser`: Requires valid authentication, returns 401 if missing/invalid
//! - `AdminUser`: Requires admin role, returns 403 if not admin
//!
//! And admission control applied to every `/api` request:
//! - `limit_in_flight`: global concurrent request cap (503 when full)
//! - `rate_limit`: per-user/per-IP windows with allow and block lists

pub mod admission;
pub mod auth;
pub mod rate_limit;

pub use admission::{limit_in_flight, InFlightLimiter, InFlightPermit};
pub use auth::{bearer_token, request_token, AdminUser, AuthUser, Claims, TokenVerifier, UserRole};
pub use rate_limit::{extract_client_ip, rate_limit, Identity, RateLimitPolicy, RateLimitState};
