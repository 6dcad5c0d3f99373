//! Upstream failure taxonomy

/// Failure opening or consuming an upstream chat stream.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Upstream answered 401: the access token is no longer accepted
    #[error("upstream rejected access token")]
    Auth,

    /// Any other non-2xx initial response
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Connection, TLS or mid-stream read failure
    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl UpstreamError {
    pub fn is_auth(&self) -> bool {
        matches!(self, UpstreamError::Auth)
    }

    /// Metric label for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Auth => "auth",
            UpstreamError::Status { .. } => "status",
            UpstreamError::Transport(_) => "transport",
        }
    }
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;
