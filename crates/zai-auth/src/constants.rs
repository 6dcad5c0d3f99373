//! Exchange defaults and error signatures

/// Lease lifetime used when the exchange reports no expiry and the access
/// token carries no readable `exp` claim.
pub const DEFAULT_ACCESS_TTL_SECS: u64 = 3600;

/// Timeout for a single exchange round trip.
pub const DEFAULT_EXCHANGE_TIMEOUT_SECS: u64 = 30;

/// Phrases in exchange error text meaning the secret itself is no good.
/// Matched case-insensitively, and only inside `exchange::classify_error_text`.
///
/// Keep these specific: a match permanently deactivates the credential, so
/// words like "auth" or "invalid" on their own are too broad.
pub const AUTH_INVALID_SIGNATURES: &[&str] = &[
    "invalid token",
    "invalid discord token",
    "invalid secret",
    "token revoked",
    "unauthorized",
    "无效",
];
