//! Inbound API-key check
//!
//! Keys are held as SHA-256 digests so the plaintext list is dropped right
//! after startup. The check runs as middleware on the `/v1` routes, before
//! the request body is read and before any pool credential is leased.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use common::Secret;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::GatewayError;

/// Allow-list of inbound bearer keys.
#[derive(Clone)]
pub struct ApiKeys {
    digests: Arc<HashSet<String>>,
}

fn digest(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ApiKeys {
    pub fn new(keys: &[Secret<String>]) -> Self {
        let digests = keys.iter().map(|k| digest(k.expose())).collect();
        Self {
            digests: Arc::new(digests),
        }
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    /// Check an `Authorization` header value of the form `Bearer <key>`.
    pub fn authorize(&self, header: Option<&str>) -> bool {
        let Some(key) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
            return false;
        };
        let key = key.trim();
        !key.is_empty() && self.digests.contains(&digest(key))
    }
}

/// Reject requests without a valid bearer key with a 401 error body.
pub async fn require_api_key(
    State(keys): State<ApiKeys>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if keys.authorize(header) {
        return next.run(request).await;
    }

    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    debug!(%request_id, path = %request.uri().path(), "rejected unauthenticated request");
    GatewayError::Unauthorized.to_response(&request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> ApiKeys {
        ApiKeys::new(&[Secret::new("sk-alpha".to_string()), Secret::new("sk-beta".to_string())])
    }

    #[test]
    fn accepts_listed_keys() {
        let keys = keys();
        assert_eq!(keys.len(), 2);
        assert!(keys.authorize(Some("Bearer sk-alpha")));
        assert!(keys.authorize(Some("Bearer sk-beta")));
    }

    #[test]
    fn rejects_missing_malformed_and_unknown() {
        let keys = keys();
        assert!(!keys.authorize(None));
        assert!(!keys.authorize(Some("sk-alpha")));
        assert!(!keys.authorize(Some("Basic sk-alpha")));
        assert!(!keys.authorize(Some("Bearer ")));
        assert!(!keys.authorize(Some("Bearer sk-gamma")));
    }
}
