//! Ephemeral cache key layout
//!
//! Credentials and access tokens are never used as keys directly; both are
//! reduced to a hex SHA-256 digest first.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of a secret or token.
pub fn hash(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

/// AccessLease: credential hash → live access token
pub fn access(credential_hash: &str) -> String {
    format!("zai:token:{credential_hash}")
}

/// RateLimitLease: credential hash → present while cooling down
pub fn limit(credential_hash: &str) -> String {
    format!("zai:limit:{credential_hash}")
}

/// ReverseIndex: access-token hash → credential hash
pub fn reverse(token_hash: &str) -> String {
    format!("zai:reverse:{token_hash}")
}

/// UsageStats counter for one outcome
pub fn stats(credential_hash: &str, success: bool) -> String {
    let field = if success { "success" } else { "failure" };
    format!("zai:stats:{credential_hash}:{field}")
}
