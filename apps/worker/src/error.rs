//! Error handling for the Reelhouse job subsystem
//!
//! Every handler failure ends up as a `last_error` string on the job row,
//! so the variants here are mostly about producing a useful message and
//! choosing a log level. Retry accounting does not look at the variant:
//! any failure consumes an attempt.

use thiserror::Error;

use crate::store::StoreError;

/// Main worker error type
#[derive(Error, Debug)]
pub enum WorkerError {
    // ========== Job Processing Errors ==========
    /// Payload could not be decoded into the handler's input type
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No handler is registered for the claimed job type
    #[error("no handler registered for job type '{0}'")]
    UnknownJobType(String),

    /// Target of the job does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Handler exceeded its execution deadline
    #[error("job timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Handler panicked; the payload message is preserved when it is a string
    #[error("handler panicked: {0}")]
    Panicked(String),

    // ========== Store Errors ==========
    /// Job store operation failed
    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    /// Direct query from a handler failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Result could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ========== Library Errors ==========
    /// File system access error
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// Media library path not found or inaccessible
    #[error("media library path not found: {0}")]
    LibraryNotFound(String),

    // ========== Segmenter Errors ==========
    /// Segmenter process could not be started or exited unsuccessfully
    #[error("segmenter failed for media '{media_id}': {reason}")]
    Segmenter { media_id: String, reason: String },

    /// Another attempt of the same job still holds the media lease
    #[error("resource '{key}' is still leased by job {owner}")]
    ResourceBusy { key: String, owner: i64 },

    // ========== Catalog Errors ==========
    /// No external catalog is configured for auto-matching
    #[error("metadata catalog not configured")]
    CatalogNotConfigured,

    /// Catalog lookup failed
    #[error("catalog error: {0}")]
    Catalog(String),

    // ========== Internal Errors ==========
    /// Internal worker error (catch-all for unexpected errors)
    #[error("internal worker error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Whether the failure is likely to go away on its own.
    ///
    /// Informational only: it is logged alongside the error, but a
    /// non-retryable failure still goes through normal retry accounting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(_)
                | Self::Database(_)
                | Self::Filesystem(_)
                | Self::Timeout { .. }
                | Self::Segmenter { .. }
                | Self::ResourceBusy { .. }
                | Self::Catalog(_)
        )
    }

    /// Get a severity level for logging
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::UnknownJobType(_) | Self::LibraryNotFound(_) => ErrorSeverity::Critical,

            Self::Store(_)
            | Self::Database(_)
            | Self::Panicked(_)
            | Self::Internal(_)
            | Self::Segmenter { .. } => ErrorSeverity::Error,

            Self::Timeout { .. }
            | Self::ResourceBusy { .. }
            | Self::Catalog(_)
            | Self::CatalogNotConfigured => ErrorSeverity::Warning,

            _ => ErrorSeverity::Info,
        }
    }

    /// Get the job type this error is related to, if applicable
    pub fn job_context(&self) -> Option<&'static str> {
        match self {
            Self::LibraryNotFound(_) => Some("index"),
            Self::CatalogNotConfigured | Self::Catalog(_) => Some("auto-match"),
            Self::Segmenter { .. } | Self::ResourceBusy { .. } => Some("hls"),
            _ => None,
        }
    }

    /// Log the error with appropriate severity
    pub fn log(&self) {
        let context = self.job_context().unwrap_or("general");
        match self.severity() {
            ErrorSeverity::Critical => {
                tracing::error!(
                    error = %self,
                    context = context,
                    retryable = self.is_retryable(),
                    "Critical worker error"
                );
            }
            ErrorSeverity::Error => {
                tracing::error!(
                    error = %self,
                    context = context,
                    retryable = self.is_retryable(),
                    "Worker error"
                );
            }
            ErrorSeverity::Warning => {
                tracing::warn!(
                    error = %self,
                    context = context,
                    retryable = self.is_retryable(),
                    "Worker warning"
                );
            }
            ErrorSeverity::Info => {
                tracing::info!(
                    error = %self,
                    context = context,
                    retryable = self.is_retryable(),
                    "Worker info"
                );
            }
        }
    }

    /// Create a segmenter error
    pub fn segmenter(media_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Segmenter {
            media_id: media_id.into(),
            reason: reason.into(),
        }
    }
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that should trigger alerts
    Critical,
    /// Standard errors
    Error,
    /// Warnings for expected failures
    Warning,
    /// Informational messages
    Info,
}

/// Result type alias for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;
