//! zai gateway
//!
//! Single-binary Rust service that:
//! 1. Accepts OpenAI-compatible chat-completions requests behind an API-key allow-list
//! 2. Leases a pooled upstream credential per request
//! 3. Translates the conversation into the upstream's protocol and relays the reply
//! 4. Keeps the pool fresh with a background refresh task
//! 5. Serves credential management on a separate admin listener

mod admin;
mod audit;
mod auth;
mod config;
mod error;
mod gateway;
mod metrics;
mod openai;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zai_auth::{CredentialStore, HttpExchange};
use zai_pool::{MemoryCache, PoolManager, spawn_refresh_task};
use zai_protocol::ZaiClient;

use crate::admin::{AdminState, build_admin_router};
use crate::audit::AuditLog;
use crate::auth::{ApiKeys, require_api_key};
use crate::config::Config;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::openai::{ChatCompletionRequest, ModelList};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    gateway: Gateway,
    api_keys: ApiKeys,
    models: Arc<Vec<String>>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the public router.
///
/// `/v1` routes sit behind the API-key check; `/health` and `/metrics` are
/// open. A concurrency limit layer caps in-flight requests at
/// `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let api = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route_layer(middleware::from_fn_with_state(
            state.api_keys.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(api)
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting zai-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.gateway.listen_addr,
        admin_addr = %config.gateway.admin_addr,
        upstream = %config.upstream.base_url,
        max_retries = config.gateway.max_retries,
        "configuration loaded"
    );

    let store = CredentialStore::load(config.pool.credentials_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to load credentials from {}",
                config.pool.credentials_path.display()
            )
        })?;
    let store = Arc::new(store);

    // One HTTP client (connection pool) for the exchange and the upstream
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.upstream.connect_timeout_secs))
        .read_timeout(Duration::from_secs(config.upstream.read_timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let exchange = HttpExchange::new(
        http.clone(),
        config.exchange.endpoint.clone(),
        Duration::from_secs(config.exchange.timeout_secs),
    );
    let pool = Arc::new(PoolManager::new(
        store,
        Arc::new(exchange),
        Arc::new(MemoryCache::new()),
        config.pool.scan_order.policy(),
        config.pool.settings(),
    ));

    let summary = pool.refresh_all().await;
    info!(
        refreshed = summary.refreshed,
        failed = summary.failed,
        skipped = summary.skipped,
        "initial refresh complete"
    );

    let shutdown = CancellationToken::new();
    let refresh_handle = spawn_refresh_task(
        pool.clone(),
        config.pool.refresh_interval(),
        shutdown.child_token(),
    );

    let audit = Arc::new(AuditLog::spawn(
        config.audit.path.clone(),
        config.audit.retention,
    ));
    let upstream = Arc::new(ZaiClient::new(http, config.upstream.base_url.clone()));
    let gateway = Gateway::new(
        pool.clone(),
        upstream,
        audit.clone(),
        config.gateway.max_retries,
    );

    let api_keys = ApiKeys::new(&config.gateway.api_keys);
    info!(keys = api_keys.len(), "inbound API keys loaded");

    let app_state = AppState {
        gateway,
        api_keys,
        models: Arc::new(config.models.clone()),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.gateway.max_connections);
    let admin_app = build_admin_router(AdminState::new(pool, audit.clone()));

    let listener = TcpListener::bind(config.gateway.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.gateway.listen_addr))?;
    let admin_listener = TcpListener::bind(config.gateway.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin to {}", config.gateway.admin_addr))?;
    info!(addr = %config.gateway.listen_addr, "accepting requests");
    info!(addr = %config.gateway.admin_addr, "admin API listening");

    // Graceful shutdown: the signal cancels the token, both servers stop
    // accepting and drain; the drain timeout starts at signal receipt.
    let server_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });
    let admin_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });

    shutdown_signal().await;
    shutdown.cancel();

    let drain_timeout = Duration::from_secs(config.gateway.drain_timeout_secs);
    let drained = async {
        let (server, admin) = tokio::join!(server_handle, admin_handle);
        for (name, result) in [("gateway", server), ("admin", admin)] {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(server = name, error = %e, "server error during shutdown"),
                Err(e) => error!(server = name, error = %e, "server task panicked"),
            }
        }
    };
    match tokio::time::timeout(drain_timeout, drained).await {
        Ok(()) => info!("all in-flight requests drained"),
        Err(_) => warn!(
            drain_timeout_secs = drain_timeout.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    if let Err(e) = refresh_handle.await {
        warn!(error = %e, "refresh task ended abnormally");
    }

    if tokio::time::timeout(drain_timeout, audit.flush()).await.is_err() {
        warn!("audit writer did not flush before shutdown");
    }

    info!("shutdown complete");
    Ok(())
}

/// POST /v1/chat/completions
async fn chat_completions(
    State(state): State<AppState>,
    body: Result<axum::Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    match body {
        Ok(axum::Json(request)) => state.gateway.handle(request_id, request).await,
        Err(rejection) => {
            GatewayError::InvalidRequest(rejection.body_text()).to_response(&request_id)
        }
    }
}

/// GET /v1/models: configured model ids in OpenAI list shape.
async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        serde_json::to_string(&ModelList::new(&state.models)).unwrap_or_default(),
    )
}

/// Health endpoint: pool summary plus uptime.
/// Returns 200 while any credential is available, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.gateway.pool().health().await;
    let status_code = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    body["uptime_seconds"] = serde_json::json!(state.started_at.elapsed().as_secs());

    (
        status_code,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{Script, StaticExchange, harness};
    use axum::body::Body;
    use axum::http::Request;
    use common::Secret;
    use tower::ServiceExt;
    use zai_pool::{InsertionOrder, PoolSettings};

    const KEY: &str = "sk-test-key";

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_app(gateway: Gateway) -> Router {
        let state = AppState {
            gateway,
            api_keys: ApiKeys::new(&[Secret::new(KEY.to_string())]),
            models: Arc::new(vec!["glm-4.6".into(), "glm-4.5".into()]),
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
        };
        build_router(state, 1000)
    }

    fn chat_request(key: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    const HELLO: &str = r#"{"model":"glm-4.6","messages":[{"role":"user","content":"hi"}]}"#;

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn chat_requires_api_key_before_body_is_read() {
        let h = harness(1, 0, vec![]).await;
        let app = test_app(h.gateway.clone());

        // Malformed body: a 401 proves auth ran first
        let response = app
            .clone()
            .oneshot(chat_request(None, "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["type"], "authentication_error");

        let response = app
            .oneshot(chat_request(Some("sk-wrong"), HELLO))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert!(h.upstream.tokens().is_empty());
        assert!(h.audit.recent(10).is_empty());
        assert!(h.pool.select().await.unwrap().is_some(), "no credential leased");
    }

    #[tokio::test]
    async fn chat_completion_through_router() {
        let h = harness(1, 0, vec![Script::Deltas(vec!["Hel", "lo"])]).await;
        let app = test_app(h.gateway.clone());

        let response = app.oneshot(chat_request(Some(KEY), HELLO)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["choices"][0]["message"]["content"], "Hello");
    }

    #[tokio::test]
    async fn malformed_json_is_400_with_request_id() {
        let h = harness(1, 0, vec![]).await;
        let app = test_app(h.gateway.clone());

        let response = app
            .oneshot(chat_request(Some(KEY), r#"{"messages": "nope"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
        assert!(h.upstream.tokens().is_empty());
    }

    #[tokio::test]
    async fn models_lists_configured_ids() {
        let h = harness(0, 0, vec![]).await;
        let app = test_app(h.gateway.clone());

        let unauthorized = app
            .clone()
            .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .header("authorization", format!("Bearer {KEY}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["id"], "glm-4.6");
        assert_eq!(json["data"][1]["id"], "glm-4.5");
    }

    #[tokio::test]
    async fn health_reports_pool_and_uptime() {
        let h = harness(2, 0, vec![]).await;
        let app = test_app(h.gateway.clone());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["credentials_total"], 2);
        assert_eq!(json["credentials_available"], 2);
        assert!(json["uptime_seconds"].is_number());
    }

    #[tokio::test]
    async fn health_is_503_without_credentials() {
        let h = harness(0, 0, vec![]).await;
        let app = test_app(h.gateway.clone());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let h = harness(0, 0, vec![]).await;
        let app = test_app(h.gateway.clone());

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    /// Start a mock upstream speaking the real wire format.
    async fn mock_upstream(status: StatusCode, body: &'static str) -> String {
        let app = Router::new().route(
            "/api/v1/chats/{id}",
            post(move || async move { (status, body) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn live_gateway(base_url: String, dir: &tempfile::TempDir) -> (Gateway, Arc<AuditLog>) {
        let store = Arc::new(
            CredentialStore::load(dir.path().join("credentials.json"))
                .await
                .unwrap(),
        );
        store.add("secret-live".into()).await.unwrap();
        let pool = Arc::new(PoolManager::new(
            store,
            Arc::new(StaticExchange),
            Arc::new(MemoryCache::new()),
            Box::new(InsertionOrder),
            PoolSettings::default(),
        ));
        pool.refresh_all().await;
        let audit = Arc::new(AuditLog::spawn(dir.path().join("audit.jsonl"), 10));
        let upstream = Arc::new(ZaiClient::new(reqwest::Client::new(), base_url));
        (Gateway::new(pool, upstream, audit.clone(), 0), audit)
    }

    #[tokio::test]
    async fn end_to_end_streaming_against_mock_upstream() {
        let base = mock_upstream(
            StatusCode::OK,
            "data: {\"content\":\"Hi\"}\n\ndata: {\"data\":{\"delta_content\":\" there\"}}\n\ndata: [DONE]\n\n",
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let (gateway, audit) = live_gateway(base, &dir).await;
        let app = test_app(gateway);

        let response = app
            .oneshot(chat_request(
                Some(KEY),
                r#"{"model":"glm-4.6","stream":true,"messages":[{"role":"system","content":"be brief"},{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["cache-control"], "no-cache");

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("\"content\":\"Hi\""));
        assert!(text.contains("\"content\":\" there\""));
        assert!(text.ends_with("data: [DONE]\n\n"));

        crate::gateway::testing::wait_for_audit(&audit, 1).await;
        assert_eq!(audit.recent(1)[0].status, 200);
    }

    #[tokio::test]
    async fn end_to_end_upstream_401_is_reported_and_invalidates() {
        let base = mock_upstream(StatusCode::UNAUTHORIZED, "token expired").await;
        let dir = tempfile::tempdir().unwrap();
        let (gateway, audit) = live_gateway(base, &dir).await;
        let pool = gateway.pool().clone();
        let app = test_app(gateway);

        let response = app.oneshot(chat_request(Some(KEY), HELLO)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = json_body(response).await;
        assert!(!json.to_string().contains("token expired"));

        assert!(pool.snapshot().await[0].access_token.is_none());
        assert_eq!(audit.recent(1)[0].status, 401);
    }
}
