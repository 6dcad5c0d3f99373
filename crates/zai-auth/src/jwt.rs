//! Unverified JWT claim reading
//!
//! Access tokens from the exchange are JWTs. The gateway never validates
//! them (the upstream does); it only peeks at `exp` to bound the lease TTL
//! when the exchange does not report an expiry.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Read the `exp` claim (unix seconds) from a JWT payload without verifying it.
///
/// Returns `None` for anything that is not a three-segment token with a
/// base64url JSON payload carrying a numeric `exp`.
pub fn expiry(token: &str) -> Option<u64> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_u64()
}
