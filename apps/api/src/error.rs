//! Error handling for the Reelhouse API
//!
//! One error type for every handler and middleware, mapped to an HTTP
//! status and a stable machine-readable code through Axum's
//! `IntoResponse`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use reelhouse_worker::store::StoreError;
use reelhouse_worker::WorkerError;
use serde::Serialize;
use thiserror::Error;

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for client-side handling
    pub code: &'static str,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Main API error type
#[derive(Error, Debug)]
pub enum ApiError {
    // ========== Authentication & Authorization ==========
    /// Missing credentials
    #[error("authentication required")]
    Unauthorized,

    /// Invalid token (expired, malformed, etc.)
    #[error("invalid authentication token: {0}")]
    InvalidToken(String),

    /// User lacks permission for the requested operation
    #[error("insufficient permissions: {0}")]
    Forbidden(String),

    /// Identity is on a block list
    #[error("access denied")]
    Blocked,

    // ========== Resource Errors ==========
    /// Requested resource not found
    #[error("{resource_type} not found: {id}")]
    NotFound {
        resource_type: &'static str,
        id: String,
    },

    // ========== Validation Errors ==========
    /// Request validation failed
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Invalid query parameter
    #[error("invalid query parameter '{name}': {reason}")]
    InvalidQueryParam { name: &'static str, reason: String },

    // ========== Storage Errors ==========
    /// Job store operation failed
    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    // ========== Admission ==========
    /// Rate limit exceeded
    #[error("rate limit exceeded, retry after {retry_after} seconds")]
    RateLimited { retry_after: u64 },

    /// In-flight request cap reached
    #[error("service temporarily unavailable: {0}")]
    ServiceBusy(String),

    // ========== Internal Errors ==========
    /// Internal server error (catch-all for unexpected errors)
    #[error("internal server error: {0}")]
    Internal(String),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ApiError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 401 Unauthorized
            Self::Unauthorized | Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,

            // 403 Forbidden
            Self::Forbidden(_) | Self::Blocked => StatusCode::FORBIDDEN,

            // 404 Not Found
            Self::NotFound { .. } => StatusCode::NOT_FOUND,

            // 400 Bad Request
            Self::ValidationError(_) | Self::InvalidQueryParam { .. } => StatusCode::BAD_REQUEST,

            // 429 Too Many Requests
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 503 Service Unavailable
            Self::ServiceBusy(_) => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            Self::Store(_) | Self::Internal(_) | Self::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code string for client-side handling
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized | Self::InvalidToken(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Blocked => "ACCESS_DENIED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ValidationError(_) | Self::InvalidQueryParam { .. } => "VALIDATION_ERROR",
            Self::Store(_) => "DATABASE_ERROR",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::ServiceBusy(_) => "SERVICE_BUSY",
            Self::Internal(_) | Self::Serialization(_) => "INTERNAL_ERROR",
        }
    }

    /// Create a not found error for a specific resource
    pub fn not_found(resource_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type,
            id: id.into(),
        }
    }

    /// Log the error with appropriate severity based on status code
    pub fn log(&self) {
        let status = self.status_code();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(
                error = %self,
                code = self.error_code(),
                status = status.as_u16(),
                "Server error occurred"
            );
        } else if matches!(
            status,
            StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
                | StatusCode::TOO_MANY_REQUESTS
                | StatusCode::SERVICE_UNAVAILABLE
        ) {
            tracing::warn!(
                error = %self,
                code = self.error_code(),
                status = status.as_u16(),
                "Request rejected"
            );
        } else {
            tracing::debug!(
                error = %self,
                code = self.error_code(),
                status = status.as_u16(),
                "Client error"
            );
        }
    }

    /// Internal details stay in the logs
    fn public_message(&self) -> String {
        match self {
            Self::Store(_) => "a database error occurred".to_string(),
            Self::Internal(_) | Self::Serialization(_) => "an internal error occurred".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.status_code();
        let error_response = ErrorResponse {
            code: self.error_code(),
            message: self.public_message(),
            details: None,
        };

        // For rate limiting, add Retry-After header
        if let Self::RateLimited { retry_after } = &self {
            return (
                status,
                [("Retry-After", retry_after.to_string())],
                Json(error_response),
            )
                .into_response();
        }

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

// ========== Conversion Implementations ==========

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Store(e) => Self::Store(e),
            WorkerError::Database(e) => Self::Store(StoreError::Database(e)),
            WorkerError::InvalidPayload(msg) => Self::ValidationError(msg),
            WorkerError::NotFound(what) => Self::not_found("resource", what),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ApiError::Unauthorized, StatusCode::UNAUTHORIZED, "UNAUTHORIZED")]
    #[case(ApiError::Forbidden("admin only".into()), StatusCode::FORBIDDEN, "FORBIDDEN")]
    #[case(ApiError::Blocked, StatusCode::FORBIDDEN, "ACCESS_DENIED")]
    #[case(ApiError::not_found("job", "7"), StatusCode::NOT_FOUND, "NOT_FOUND")]
    #[case(ApiError::ValidationError("bad".into()), StatusCode::BAD_REQUEST, "VALIDATION_ERROR")]
    #[case(ApiError::RateLimited { retry_after: 60 }, StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED")]
    #[case(ApiError::ServiceBusy("full".into()), StatusCode::SERVICE_UNAVAILABLE, "SERVICE_BUSY")]
    #[case(ApiError::Internal("oops".into()), StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")]
    fn test_status_and_code(
        #[case] err: ApiError,
        #[case] status: StatusCode,
        #[case] code: &str,
    ) {
        assert_eq!(err.status_code(), status);
        assert_eq!(err.error_code(), code);
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited { retry_after: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["Retry-After"], "42");
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let err = ApiError::Internal("connection string leaked".into());
        assert_eq!(err.public_message(), "an internal error occurred");
    }

    #[test]
    fn test_worker_errors_map_to_http() {
        let err: ApiError = WorkerError::InvalidPayload("bad id".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        let err: ApiError = WorkerError::NotFound("media x".into()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::not_found("job", "42");
        assert_eq!(err.to_string(), "job not found: 42");
    }
}
