//! Chat request handling
//!
//! Each request runs `SELECT → TRANSLATE → STREAM/AGGREGATE → outcome → LOG`:
//!
//! 1. Lease a credential from the pool; nothing leasable → 429, no retry
//! 2. Build the upstream conversation and open the stream
//! 3. Upstream 401 → invalidate the lease; any failure → retry with a new lease
//! 4. Exactly one audit entry and one usage stat per request
//!
//! Streaming requests retry only until the first delta arrives. After that
//! the response is committed: a failure ends the SSE stream without the
//! `[DONE]` marker and is visible only in the audit log.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderName};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use common::mask_secret;
use futures_util::stream::{self, StreamExt as _, TryStreamExt as _};
use tracing::{Instrument, debug, info, info_span, warn};
use zai_pool::{Lease, PoolManager};
use zai_protocol::{ChatUpstream, DeltaStream, Turn, UpstreamError, build_request};

use crate::audit::{AuditEntry, AuditLog, NO_CREDENTIAL, now_millis};
use crate::error::GatewayError;
use crate::metrics;
use crate::openai::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, SSE_DONE, completion_id};

/// Status recorded when the caller drops a stream before it finishes.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Shared request handler. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    pool: Arc<PoolManager>,
    upstream: Arc<dyn ChatUpstream>,
    audit: Arc<AuditLog>,
    max_retries: u32,
}

/// Per-request facts carried to the audit entry.
struct RequestContext {
    request_id: String,
    model: String,
    turns: Vec<Turn>,
    stream: bool,
    started: Instant,
}

impl RequestContext {
    fn mode(&self) -> &'static str {
        if self.stream { "stream" } else { "complete" }
    }
}

/// What happened across the attempts of one request.
#[derive(Default)]
struct Trace {
    attempts: u32,
    /// Hash of the last credential leased
    credential: Option<String>,
    last_error: Option<UpstreamError>,
}

impl Gateway {
    pub fn new(
        pool: Arc<PoolManager>,
        upstream: Arc<dyn ChatUpstream>,
        audit: Arc<AuditLog>,
        max_retries: u32,
    ) -> Self {
        Self {
            pool,
            upstream,
            audit,
            max_retries,
        }
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    /// Serve one chat-completions request in the mode it asks for.
    pub async fn handle(&self, request_id: String, request: ChatCompletionRequest) -> Response {
        let turns = match request.turns() {
            Ok(turns) => turns,
            Err(e) => {
                debug!(%request_id, error = %e, "rejected invalid request");
                return e.to_response(&request_id);
            }
        };
        let ctx = RequestContext {
            request_id,
            model: request.model,
            turns,
            stream: request.stream,
            started: Instant::now(),
        };
        let span = info_span!(
            "chat",
            request_id = %ctx.request_id,
            model = %ctx.model,
            stream = ctx.stream
        );
        if ctx.stream {
            self.stream(ctx).instrument(span).await
        } else {
            self.complete(ctx).instrument(span).await
        }
    }

    /// Lease, translate and consume until one attempt succeeds.
    ///
    /// `consume` turns an opened delta stream into the attempt's result; its
    /// error counts as a failed attempt. Returns `None` when attempts run out
    /// or nothing is leasable; `trace` then says why.
    async fn run_attempts<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        trace: &mut Trace,
        mut consume: F,
    ) -> Option<(Lease, T)>
    where
        F: FnMut(DeltaStream) -> Fut,
        Fut: Future<Output = zai_protocol::Result<T>>,
    {
        for attempt in 0..=self.max_retries {
            let lease = match self.pool.select().await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!(attempt, "no leasable credential");
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "credential selection failed");
                    break;
                }
            };
            trace.attempts += 1;
            trace.credential = Some(lease.credential_hash.clone());

            let request = build_request(&ctx.turns, &ctx.model);
            let result = match self.upstream.stream(&lease.access_token, request).await {
                Ok(deltas) => consume(deltas).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => return Some((lease, value)),
                Err(e) => {
                    warn!(
                        attempt,
                        credential_id = lease.credential_id,
                        error_type = e.kind(),
                        error = %e,
                        "upstream attempt failed"
                    );
                    self.on_upstream_error(&lease, &e).await;
                    trace.last_error = Some(e);
                }
            }
        }
        None
    }

    async fn on_upstream_error(&self, lease: &Lease, error: &UpstreamError) {
        metrics::record_upstream_error(error.kind());
        if error.is_auth() {
            if let Err(e) = self.pool.invalidate(&lease.access_token).await {
                warn!(credential_id = lease.credential_id, error = %e, "failed to invalidate lease");
            }
        }
    }

    /// Map a failed request to its response and audit it.
    async fn fail(&self, ctx: &RequestContext, trace: Trace) -> Response {
        let (error, detail) = match &trace.last_error {
            None => (GatewayError::PoolExhausted, "no credential available".to_string()),
            Some(e) if e.is_auth() => (GatewayError::UpstreamAuth, e.to_string()),
            Some(e) => (GatewayError::Internal, e.to_string()),
        };
        let response = error.to_response(&ctx.request_id);
        self.finish(ctx, &trace, response.status().as_u16(), Some(detail))
            .await;
        response
    }

    /// Write the request's single audit entry, usage stat and metrics.
    async fn finish(&self, ctx: &RequestContext, trace: &Trace, status: u16, error: Option<String>) {
        let duration = ctx.started.elapsed();
        let credential_hash = trace.credential.as_deref().unwrap_or(NO_CREDENTIAL);
        self.pool
            .record_stat(credential_hash, status == StatusCode::OK.as_u16())
            .await;

        let credential = match &trace.credential {
            Some(hash) => mask_secret(hash),
            None => NO_CREDENTIAL.to_string(),
        };
        info!(
            status,
            attempts = trace.attempts,
            duration_ms = duration.as_millis() as u64,
            credential = %credential,
            "request finished"
        );
        metrics::record_request(status, ctx.mode(), duration);
        self.audit.record(AuditEntry {
            timestamp: now_millis(),
            request_id: ctx.request_id.clone(),
            model: ctx.model.clone(),
            credential,
            status,
            duration_ms: duration.as_millis() as u64,
            error,
            stream: ctx.stream,
            attempts: trace.attempts,
        });
    }

    /// Non-streaming: concatenate every delta into one completion.
    async fn complete(&self, ctx: RequestContext) -> Response {
        let mut trace = Trace::default();
        let outcome = self
            .run_attempts(&ctx, &mut trace, |deltas| async move {
                deltas.try_collect::<Vec<String>>().await.map(|d| d.concat())
            })
            .await;

        let Some((_lease, content)) = outcome else {
            return self.fail(&ctx, trace).await;
        };

        self.finish(&ctx, &trace, StatusCode::OK.as_u16(), None).await;
        let completion = ChatCompletion::new(completion_id(), ctx.model, content);
        (
            StatusCode::OK,
            [(CONTENT_TYPE, "application/json")],
            serde_json::to_string(&completion).unwrap_or_default(),
        )
            .into_response()
    }

    /// Streaming: retry until the first delta, then relay as SSE.
    async fn stream(&self, ctx: RequestContext) -> Response {
        let mut trace = Trace::default();
        let outcome = self
            .run_attempts(&ctx, &mut trace, |mut deltas| async move {
                match deltas.next().await {
                    Some(Ok(first)) => Ok((Some(first), Some(deltas))),
                    Some(Err(e)) => Err(e),
                    // Ended cleanly without any text
                    None => Ok((None, None)),
                }
            })
            .await;

        let Some((lease, (first, deltas))) = outcome else {
            return self.fail(&ctx, trace).await;
        };

        debug!(credential_id = lease.credential_id, "stream committed");
        let relay = Relay {
            id: completion_id(),
            model: ctx.model.clone(),
            pending: first,
            deltas,
            first_frame: true,
            done: false,
            access_token: lease.access_token,
            finalizer: StreamFinalizer {
                gateway: self.clone(),
                state: Some((ctx, trace)),
                outcome: None,
            },
        };

        (
            StatusCode::OK,
            [
                (CONTENT_TYPE, "text/event-stream"),
                (CACHE_CONTROL, "no-cache"),
                (HeaderName::from_static("x-accel-buffering"), "no"),
            ],
            Body::from_stream(relay.into_stream()),
        )
            .into_response()
    }
}

/// Audits a committed stream exactly once, however it ends.
///
/// Dropped with no outcome set means the caller went away first.
struct StreamFinalizer {
    gateway: Gateway,
    state: Option<(RequestContext, Trace)>,
    outcome: Option<(u16, Option<String>)>,
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        let Some((ctx, trace)) = self.state.take() else {
            return;
        };
        let (status, error) = self
            .outcome
            .take()
            .unwrap_or((CLIENT_CLOSED_REQUEST, Some("client disconnected".into())));
        let gateway = self.gateway.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { gateway.finish(&ctx, &trace, status, error).await });
            }
            Err(_) => warn!(request_id = %ctx.request_id, status, "no runtime to audit stream"),
        }
    }
}

/// Committed stream state: upstream deltas in, SSE frames out.
struct Relay {
    id: String,
    model: String,
    /// First delta, read before commit
    pending: Option<String>,
    /// `None` once the upstream has ended
    deltas: Option<DeltaStream>,
    first_frame: bool,
    done: bool,
    access_token: String,
    finalizer: StreamFinalizer,
}

impl Relay {
    fn content_frame(&mut self, text: String) -> Bytes {
        let chunk = ChatCompletionChunk::content(&self.id, &self.model, text, self.first_frame);
        self.first_frame = false;
        Bytes::from(chunk.to_sse())
    }

    /// Stop frame followed by the `[DONE]` terminator.
    fn closing_frames(&mut self) -> Bytes {
        self.done = true;
        self.finalizer.outcome = Some((StatusCode::OK.as_u16(), None));
        let stop = ChatCompletionChunk::stop(&self.id, &self.model);
        Bytes::from(format!("{}{SSE_DONE}", stop.to_sse()))
    }

    async fn abort(&mut self, error: UpstreamError) {
        warn!(error_type = error.kind(), error = %error, "stream failed after commit");
        let gateway = self.finalizer.gateway.clone();
        metrics::record_upstream_error(error.kind());
        let status = if error.is_auth() {
            if let Err(e) = gateway.pool.invalidate(&self.access_token).await {
                warn!(error = %e, "failed to invalidate lease");
            }
            StatusCode::UNAUTHORIZED
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        self.finalizer.outcome = Some((status.as_u16(), Some(error.to_string())));
    }

    fn into_stream(self) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> + Send {
        stream::unfold(self, |mut relay| async move {
            if relay.done {
                return None;
            }
            if let Some(text) = relay.pending.take() {
                let frame = relay.content_frame(text);
                return Some((Ok(frame), relay));
            }
            let next = match relay.deltas.as_mut() {
                Some(deltas) => deltas.next().await,
                None => None,
            };
            match next {
                Some(Ok(text)) => {
                    let frame = relay.content_frame(text);
                    Some((Ok(frame), relay))
                }
                Some(Err(e)) => {
                    relay.abort(e).await;
                    None
                }
                None => {
                    relay.deltas = None;
                    let frames = relay.closing_frames();
                    Some((Ok(frames), relay))
                }
            }
        })
    }
}
