//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service and its mapping
//! to HTTP status codes. Callers must be able to tell transient failures
//! (keep polling) from permanent ones (stop) by status code alone.

use crate::config::ConfigError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use counselor_core::ports::PortError;
use counselor_core::transcript::TurnValidationError;
use serde::Serialize;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents an error related to the WebSocket connection.
    #[error("WebSocket Error: {0}")]
    Websocket(#[from] axum::Error),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The transcript is not complete enough to score yet; the other writer
    /// may not have flushed. Transient: the caller should retry shortly.
    #[error("Transcript is not ready for evaluation yet")]
    TranscriptNotReady,

    /// Evaluation can never succeed for this session (e.g., it was completed
    /// without a usable transcript). Permanent: the caller must stop retrying.
    #[error("Evaluation conflict: {0}")]
    EvaluationConflict(String),

    /// The caller's payload failed validation before any storage write.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The scoring service declined to produce a result for this content.
    #[error("Could not generate an evaluation from this content")]
    ScoringRefused,

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

impl From<TurnValidationError> for ApiError {
    fn from(e: TurnValidationError) -> Self {
        ApiError::InvalidPayload(e.to_string())
    }
}

impl ApiError {
    /// The HTTP status this error maps to. Transient and permanent failures
    /// must be distinguishable from this alone.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::TranscriptNotReady => StatusCode::TOO_EARLY,
            ApiError::EvaluationConflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            ApiError::ScoringRefused => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Port(PortError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Port(PortError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Port(PortError::Unauthorized) => StatusCode::UNAUTHORIZED,
            ApiError::Port(PortError::Timeout(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Port(PortError::Malformed(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Port(PortError::Refused(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when retrying the same request later can succeed. Drives the
    /// bounded evaluation polling loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.status_code(),
            StatusCode::TOO_EARLY | StatusCode::SERVICE_UNAVAILABLE
        )
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Internal details stay in the logs.
            tracing::error!("internal error: {self}");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}
