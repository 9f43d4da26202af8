//! API error types and response handling.
//!
//! This module provides a unified error type for all API handlers
//! with automatic conversion to appropriate HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use drillink_core::DrillError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
///
/// Each variant maps to a specific HTTP status code and produces a
/// consistent JSON error response.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - Invalid input from client.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - Resource does not exist.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - Operation cannot be completed due to current state.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 500 Internal Server Error - Unexpected server-side error.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 503 Service Unavailable - No target link is available.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "session_busy",
    "message": "a drill session is already running"
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "invalid_setup").
    #[schema(example = "session_busy")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "a drill session is already running")]
    pub message: String,
}

impl ApiError {
    /// 400 with the given code and message.
    pub fn bad_request(error_code: &str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            error_code: error_code.to_string(),
            message: message.into(),
        }
    }

    /// 404 with the given code and message.
    pub fn not_found(error_code: &str, message: impl Into<String>) -> Self {
        Self::NotFound {
            error_code: error_code.to_string(),
            message: message.into(),
        }
    }

    /// 409 with the given code and message.
    pub fn conflict(error_code: &str, message: impl Into<String>) -> Self {
        Self::Conflict {
            error_code: error_code.to_string(),
            message: message.into(),
        }
    }

    /// 503 with the given code and message.
    pub fn unavailable(error_code: &str, message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            error_code: error_code.to_string(),
            message: message.into(),
        }
    }

    /// The HTTP status this error maps to.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (Self::BadRequest { error_code, message }
        | Self::NotFound { error_code, message }
        | Self::Conflict { error_code, message }
        | Self::InternalError { error_code, message }
        | Self::ServiceUnavailable { error_code, message }) = self;

        if status.is_server_error() {
            tracing::error!(
                error_code = %error_code,
                message = %message,
                "Request failed"
            );
        }

        (
            status,
            Json(ErrorResponse {
                error: error_code,
                message,
            }),
        )
            .into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            Self::InternalError { message, .. } => write!(f, "Internal Error: {message}"),
            Self::ServiceUnavailable { message, .. } => {
                write!(f, "Service Unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

/// Convert from drillink_core errors.
impl From<DrillError> for ApiError {
    fn from(err: DrillError) -> Self {
        let error_code = err.error_code().to_ascii_lowercase();
        let message = err.to_string();
        match err.http_status_code() {
            400 => Self::BadRequest { error_code, message },
            404 => Self::NotFound { error_code, message },
            409 => Self::Conflict { error_code, message },
            503 | 504 => Self::ServiceUnavailable { error_code, message },
            _ => Self::InternalError { error_code, message },
        }
    }
}

impl From<drillink_core::StorageError> for ApiError {
    fn from(err: drillink_core::StorageError) -> Self {
        Self::from(DrillError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_request_error() {
        let err = ApiError::bad_request("test_error", "Test message");
        assert!(err.to_string().contains("Bad Request"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "test_error".to_string(),
            message: "Test message".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test_error"));
    }

    #[test]
    fn test_from_drill_error() {
        let err = ApiError::from(DrillError::SessionBusy);
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert!(matches!(
            err,
            ApiError::Conflict { ref error_code, .. } if error_code == "session_busy"
        ));

        let err = ApiError::from(DrillError::ResultNotFound("abc".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = ApiError::from(DrillError::Disconnected);
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
