//! Gateway error types with HTTP status code mapping.
//!
//! [`GatewayError`] is the central error type for the gateway. Each variant
//! maps to a specific HTTP status code and structured JSON error response.
//! Socket-level variants ([`GatewayError::MalformedFrame`],
//! [`GatewayError::Transport`]) never leave the connection task that raised
//! them; only request-facing variants are rendered to clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{ChatId, MessageId};

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2003,
///     "message": "precondition failed: message can no longer be edited",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server-side error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category          | HTTP Status                  |
/// |-----------|-------------------|------------------------------|
/// | 1000–1999 | Validation / Auth | 400 Bad Request / 401        |
/// | 2000–2999 | State/Not Found   | 404 Not Found / 409 Conflict |
/// | 3000–3999 | Server            | 500 Internal Server Error    |
/// | 5000–5999 | Transport         | 502 Bad Gateway              |
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Identity resolution failed for an inbound request.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Inbound frame could not be parsed into a recipient and a body.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Read or write failure on a single connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation rejected because its preconditions no longer hold.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Chat not found, or the caller is not a participant.
    #[error("chat not found: {0}")]
    ChatNotFound(ChatId),

    /// Message not found, or not visible to the caller.
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Persistence layer failure.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::MalformedFrame(_) => 1002,
            Self::Unauthorized(_) => 1401,
            Self::ChatNotFound(_) => 2001,
            Self::MessageNotFound(_) => 2002,
            Self::PreconditionFailed(_) => 2003,
            Self::Internal(_) => 3000,
            Self::PersistenceError(_) => 3001,
            Self::Transport(_) => 5001,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::MalformedFrame(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ChatNotFound(_) | Self::MessageNotFound(_) => StatusCode::NOT_FOUND,
            Self::PreconditionFailed(_) => StatusCode::CONFLICT,
            Self::PersistenceError(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.error_code(), error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
