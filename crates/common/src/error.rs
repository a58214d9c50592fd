//! Error types for quill.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application result type.
pub type AppResult<T> = Result<T, AppError>;

/// Application error type.
///
/// Variants correspond to the failure kinds handlers are allowed to surface;
/// store- and transport-specific errors are wrapped into these at the
/// suspension points that produce them.
#[derive(Debug, Error)]
pub enum AppError {
    // === Client Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Duplicate item: {0}")]
    Duplicate(String),

    // === Server Errors ===
    /// Temporary condition (throughput exceeded, 429, timeout). Never retried
    /// in-process; the invoking orchestrator owns retries.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Non-transient failure talking to another server.
    #[error("Communication error: {0}")]
    Communication(String),

    /// A stored document failed validation. Requires operator intervention.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Bad configuration: {0}")]
    BadConfiguration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            // 4xx Client Errors
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Duplicate(_) => StatusCode::CONFLICT,

            // 5xx Server Errors
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Communication(_) => StatusCode::BAD_GATEWAY,
            Self::Corrupted(_) | Self::BadConfiguration(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Duplicate(_) => "DUPLICATE",
            Self::Transient(_) => "TRANSIENT",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::Corrupted(_) => "CORRUPTED_DATA",
            Self::BadConfiguration(_) => "BAD_CONFIGURATION",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns whether the invoking orchestrator should retry the unit.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns whether this error should be logged at error level.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Logs a detailed cause and returns the error unchanged.
    ///
    /// Rejection responses stay detail-free; the cause goes to the log only.
    #[must_use]
    pub fn log_cause(self, cause: &str) -> Self {
        tracing::warn!(code = self.error_code(), cause = %cause, "request rejected");
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        if self.is_server_error() {
            tracing::error!(error = %self, code = code, "Server error occurred");
        } else {
            tracing::debug!(error = %self, code = code, "Client error occurred");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::BadConfiguration(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}
