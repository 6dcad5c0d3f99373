//! Error types for credential storage and exchange

/// Errors from credential storage and token exchange.
///
/// Exchange failures are split into exactly two kinds: `InvalidSecret` is
/// terminal (the credential should be deactivated), everything else is
/// transient and retried on the next refresh pass.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    Exchange(String),

    #[error("secret rejected: {0}")]
    InvalidSecret(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate credential: {0}")]
    Duplicate(String),
}

impl Error {
    /// Whether this failure means the secret will never work again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::InvalidSecret(_))
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
