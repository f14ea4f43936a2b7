//! API error types and JSON error response formatting.
//!
//! ApiError provides a consistent JSON error response format across all
//! endpoints, mapping pipeline errors to appropriate HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use intake_channels::ChannelError;
use intake_chat::ChatError;
use intake_core::error::IntakeError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - missing or invalid parameters.
    BadRequest(String),
    /// 401 Unauthorized - webhook secret mismatch.
    Unauthorized(String),
    /// 404 Not Found - resource does not exist.
    NotFound(String),
    /// 409 Conflict - state conflict (e.g., response already registered).
    Conflict(String),
    /// 429 Too Many Requests.
    TooManyRequests(String),
    /// 500 Internal Server Error - unexpected server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::TooManyRequests(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "too_many_requests", msg)
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match &err {
            // Identification failures stay indistinguishable to callers.
            e if e.is_identity_failure() && !matches!(e, ChatError::ResponseNotFound(_)) => {
                ApiError::Conflict("identification failed".to_string())
            }
            ChatError::ResponseNotFound(_)
            | ChatError::SessionNotFound(_)
            | ChatError::ConversationNotFound(_)
            | ChatError::MessageNotFound(_) => ApiError::NotFound(err.to_string()),
            ChatError::InvalidTransition(..) => ApiError::Conflict(err.to_string()),
            ChatError::EmptyMessage | ChatError::MessageTooLong(_) => {
                ApiError::BadRequest(err.to_string())
            }
            ChatError::RateLimited(_) => ApiError::TooManyRequests(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ChannelError> for ApiError {
    fn from(err: ChannelError) -> Self {
        match &err {
            ChannelError::UnknownSession => ApiError::NotFound(err.to_string()),
            ChannelError::Malformed(_) | ChannelError::WrongChannel { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<IntakeError> for ApiError {
    fn from(err: IntakeError) -> Self {
        match &err {
            IntakeError::Config(msg) | IntakeError::InvalidIdentifier(msg) => {
                ApiError::BadRequest(msg.clone())
            }
            IntakeError::RateLimited => ApiError::TooManyRequests(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
