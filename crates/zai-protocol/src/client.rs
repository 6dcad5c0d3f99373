//! Upstream chat client
//!
//! The gateway depends on the [`ChatUpstream`] trait; [`ZaiClient`] is the
//! HTTP implementation. The initial response status is classified before any
//! delta is yielded, so callers can still retry on a failed open.

use std::future::Future;
use std::pin::Pin;

use reqwest::header::{ORIGIN, REFERER, USER_AGENT};
use tracing::{debug, warn};

use crate::error::{Result, UpstreamError};
use crate::payload::UpstreamRequest;
use crate::sse::{DeltaStream, delta_stream};

/// Browser identity presented to the upstream.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Opens a streaming chat call with a leased access token.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility (`Arc<dyn ChatUpstream>`).
pub trait ChatUpstream: Send + Sync {
    fn stream<'a>(
        &'a self,
        access_token: &'a str,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DeltaStream>> + Send + 'a>>;
}

/// HTTP client for the upstream chat backend.
///
/// Shares one `reqwest::Client` (connection pool) across all requests.
pub struct ZaiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ZaiClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn chat_url(&self, conversation_id: &str) -> String {
        format!("{}/api/v1/chats/{conversation_id}", self.base_url)
    }

    async fn open(&self, access_token: &str, request: UpstreamRequest) -> Result<DeltaStream> {
        let url = self.chat_url(&request.conversation_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(ORIGIN, &self.base_url)
            .header(
                REFERER,
                format!("{}/c/{}", self.base_url, request.conversation_id),
            )
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            warn!(conversation_id = %request.conversation_id, "upstream returned 401");
            return Err(UpstreamError::Auth);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            warn!(status = status.as_u16(), "upstream returned error status");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(conversation_id = %request.conversation_id, "upstream stream opened");
        Ok(delta_stream(response.bytes_stream()))
    }
}

impl ChatUpstream for ZaiClient {
    fn stream<'a>(
        &'a self,
        access_token: &'a str,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DeltaStream>> + Send + 'a>> {
        Box::pin(self.open(access_token, request))
    }
}
