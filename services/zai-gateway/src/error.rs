//! Per-request error responses
//!
//! Upstream failure detail never reaches the caller: it goes to the audit log
//! and the tracing output, the response body carries a fixed message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Outcome of a request that did not produce a completion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no upstream credential available, retry later")]
    PoolExhausted,

    #[error("upstream rejected the credential")]
    UpstreamAuth,

    #[error("upstream request failed")]
    Internal,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized | GatewayError::UpstreamAuth => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PoolExhausted => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI-style error type string.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "authentication_error",
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::PoolExhausted => "rate_limit_error",
            GatewayError::UpstreamAuth => "upstream_auth_error",
            GatewayError::Internal => "server_error",
        }
    }

    /// Render as `{"error": {"type", "message", "request_id"}}`.
    pub fn to_response(&self, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
