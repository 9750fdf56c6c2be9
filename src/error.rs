//! Error taxonomy for the chat pipeline.
//!
//! Every fallible pipeline operation returns [`ChatError`]. The HTTP surface
//! turns it into a `{ "error": message }` body with the status from
//! [`ChatError::status_code`]. Non-fatal decode problems are reported as
//! [`DecodeWarning`] and never abort a stream.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed request body or empty message list.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The API key could not be resolved.
    #[error("API key is not configured: {0}")]
    AuthConfig(String),

    /// The configured timeout elapsed before the reply completed.
    #[error("request timed out after {0:?}, please try again later")]
    Timeout(Duration),

    /// Network-level failure talking to the upstream API.
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream answered with a non-2xx status.
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// Upstream answered 2xx but without any choice to read.
    #[error("no response from API")]
    EmptyResponse,

    /// The turn was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    /// A turn is already running for this conversation.
    #[error("a turn is already in progress")]
    TurnInProgress,

    #[error("not found: {0}")]
    NotFound(String),

    /// The conversation store rejected an operation.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl ChatError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ChatError::AuthConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ChatError::Transport(_) => StatusCode::BAD_GATEWAY,
            ChatError::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            ChatError::EmptyResponse => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ChatError::TurnInProgress => StatusCode::CONFLICT,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the optional retry decorator may attempt the call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::Timeout(_) | ChatError::Transport(_) => true,
            ChatError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(e: sqlx::Error) -> Self {
        ChatError::Persistence(e.to_string())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            // Store internals stay in the server log.
            ChatError::Persistence(detail) => {
                log::error!("Persistence failure: {}", detail);
                "failed to access chat history".to_string()
            }
            ChatError::AuthConfig(detail) => {
                log::error!("API key missing: {}", detail);
                "API key is not configured".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// A skipped line in a model stream. Logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeWarning {
    pub line: String,
    pub reason: String,
}

impl std::fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "skipped stream line ({}): {}", self.reason, self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_is_propagated() {
        let err = ChatError::Upstream {
            status: 429,
            body: "slow down".into(),
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert!(err.is_retryable());
    }

    #[test]
    fn upstream_non_error_status_maps_to_500() {
        let err = ChatError::Upstream {
            status: 302,
            body: String::new(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn client_errors_are_not_retried() {
        assert!(!ChatError::InvalidInput("x".into()).is_retryable());
        assert!(!ChatError::EmptyResponse.is_retryable());
        assert!(!ChatError::Cancelled.is_retryable());
        assert!(!ChatError::Upstream { status: 400, body: String::new() }.is_retryable());
        assert!(ChatError::Timeout(Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn sub_second_timeout_is_not_reported_as_zero() {
        let msg = ChatError::Timeout(Duration::from_millis(100)).to_string();
        assert!(msg.contains("100ms"), "{}", msg);
        assert!(!msg.contains("0s"), "{}", msg);
    }

    #[test]
    fn taxonomy_status_codes() {
        assert_eq!(ChatError::InvalidInput("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ChatError::AuthConfig("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ChatError::Timeout(Duration::from_secs(30)).status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ChatError::EmptyResponse.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ChatError::TurnInProgress.status_code(), StatusCode::CONFLICT);
    }
}
