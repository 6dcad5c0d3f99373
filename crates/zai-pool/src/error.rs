//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential {0} is inactive")]
    Inactive(u64),

    #[error("credential store error: {0}")]
    Credential(String),

    #[error("token refresh failed: {0}")]
    Refresh(zai_auth::Error),

    #[error("ephemeral cache error: {0}")]
    Cache(String),
}

impl Error {
    /// Whether a refresh failure deactivated (or will deactivate) the credential.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Refresh(e) if e.is_terminal())
    }
}

impl From<zai_auth::Error> for Error {
    fn from(e: zai_auth::Error) -> Self {
        Error::Credential(e.to_string())
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
