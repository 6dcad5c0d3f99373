//! Admin API for credential management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is not
//! authenticated; keep it off public interfaces.
//!
//! Endpoints:
//! - GET    /admin/credentials                list credentials with lease status
//! - POST   /admin/credentials                register a secret and refresh it
//! - GET    /admin/credentials/{id}           one credential
//! - DELETE /admin/credentials/{id}           remove credential and its lease
//! - POST   /admin/credentials/{id}/enable    reactivate and refresh
//! - POST   /admin/credentials/{id}/disable   deactivate and evict the lease
//! - POST   /admin/credentials/{id}/refresh   exchange the secret now
//! - GET    /admin/stats                      pool summary and usage totals
//! - GET    /admin/logs?limit=N               recent audit entries, newest first
//!
//! Secrets and access tokens only ever appear masked.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tracing::{info, warn};
use zai_pool::{PoolManager, UsageStats};

use crate::audit::{AuditLog, NO_CREDENTIAL};

const DEFAULT_LOG_LIMIT: usize = 100;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<PoolManager>,
    audit: Arc<AuditLog>,
}

impl AdminState {
    pub fn new(pool: Arc<PoolManager>, audit: Arc<AuditLog>) -> Self {
        Self { pool, audit }
    }
}

/// Build the admin axum router with all credential management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route(
            "/admin/credentials",
            get(list_credentials).post(create_credential),
        )
        .route(
            "/admin/credentials/{id}",
            get(get_credential).delete(delete_credential),
        )
        .route("/admin/credentials/{id}/enable", post(enable_credential))
        .route("/admin/credentials/{id}/disable", post(disable_credential))
        .route("/admin/credentials/{id}/refresh", post(refresh_credential))
        .route("/admin/stats", get(stats))
        .route("/admin/logs", get(logs))
        .with_state(state)
}

fn reply(status: StatusCode, body: serde_json::Value) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    reply(status, serde_json::json!({ "error": message.into() }))
}

fn not_found(id: u64) -> Response {
    error(StatusCode::NOT_FOUND, format!("credential {id} not found"))
}

/// Current admin view of a credential, or 404.
async fn status_reply(state: &AdminState, id: u64, status: StatusCode) -> Response {
    match state.pool.status(id).await {
        Some(credential) => reply(status, serde_json::json!({ "credential": credential })),
        None => not_found(id),
    }
}

/// GET /admin/credentials: all credentials, masked.
async fn list_credentials(State(state): State<AdminState>) -> Response {
    let credentials = state.pool.snapshot().await;
    reply(
        StatusCode::OK,
        serde_json::json!({ "credentials": credentials }),
    )
}

#[derive(Deserialize)]
struct CreateCredential {
    secret: String,
}

/// POST /admin/credentials: register a secret, then refresh it once.
///
/// The credential is created even when the first refresh fails; the error is
/// reported alongside and the refresh task keeps trying.
async fn create_credential(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CreateCredential>,
) -> Response {
    let secret = body.secret.trim().to_string();
    if secret.is_empty() {
        return error(StatusCode::BAD_REQUEST, "secret must not be empty");
    }

    let credential = match state.pool.store().add(secret).await {
        Ok(c) => c,
        Err(zai_auth::Error::Duplicate(_)) => {
            return error(StatusCode::CONFLICT, "secret already registered");
        }
        Err(e) => {
            warn!(error = %e, "failed to store credential");
            return error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to store credential: {e}"),
            );
        }
    };
    info!(credential_id = credential.id, "credential registered");

    let refresh_error = state
        .pool
        .refresh(&credential)
        .await
        .err()
        .map(|e| e.to_string());

    let Some(status) = state.pool.status(credential.id).await else {
        return not_found(credential.id);
    };
    reply(
        StatusCode::CREATED,
        serde_json::json!({
            "credential": status,
            "refreshed": refresh_error.is_none(),
            "refresh_error": refresh_error,
        }),
    )
}

/// GET /admin/credentials/{id}
async fn get_credential(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    status_reply(&state, id, StatusCode::OK).await
}

/// DELETE /admin/credentials/{id}: remove from the store and evict its lease.
async fn delete_credential(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    let credential = match state.pool.store().remove(id).await {
        Ok(Some(c)) => c,
        Ok(None) => return not_found(id),
        Err(e) => {
            warn!(credential_id = id, error = %e, "credential removal failed");
            return error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to remove credential: {e}"),
            );
        }
    };
    if let Err(e) = state.pool.evict(&credential).await {
        warn!(credential_id = id, error = %e, "lease eviction failed");
    }

    info!(credential_id = id, "credential removed");
    reply(
        StatusCode::OK,
        serde_json::json!({ "id": id, "status": "removed" }),
    )
}

/// POST /admin/credentials/{id}/enable: reactivate, clear the failure streak, refresh.
async fn enable_credential(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    if state.pool.store().get(id).await.is_none() {
        return not_found(id);
    }
    let credential = match state.pool.store().set_active(id, true).await {
        Ok(c) => c,
        Err(e) => {
            warn!(credential_id = id, error = %e, "failed to enable credential");
            return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    info!(credential_id = id, "credential enabled");

    if let Err(e) = state.pool.refresh(&credential).await {
        warn!(credential_id = id, error = %e, "refresh after enable failed");
    }
    status_reply(&state, id, StatusCode::OK).await
}

/// POST /admin/credentials/{id}/disable: deactivate and evict the lease.
async fn disable_credential(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    if state.pool.store().get(id).await.is_none() {
        return not_found(id);
    }
    let credential = match state.pool.store().set_active(id, false).await {
        Ok(c) => c,
        Err(e) => {
            warn!(credential_id = id, error = %e, "failed to disable credential");
            return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    if let Err(e) = state.pool.evict(&credential).await {
        warn!(credential_id = id, error = %e, "lease eviction failed");
    }

    info!(credential_id = id, "credential disabled");
    status_reply(&state, id, StatusCode::OK).await
}

/// POST /admin/credentials/{id}/refresh: exchange the secret immediately.
async fn refresh_credential(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    let Some(credential) = state.pool.store().get(id).await else {
        return not_found(id);
    };
    if !credential.active {
        return error(StatusCode::CONFLICT, format!("credential {id} is inactive"));
    }

    match state.pool.refresh(&credential).await {
        Ok(()) => status_reply(&state, id, StatusCode::OK).await,
        Err(e) => error(StatusCode::BAD_GATEWAY, format!("refresh failed: {e}")),
    }
}

/// GET /admin/stats: pool health plus summed usage counters.
async fn stats(State(state): State<AdminState>) -> Response {
    let health = state.pool.health().await;
    let totals = state
        .pool
        .snapshot()
        .await
        .iter()
        .fold(UsageStats::default(), |acc, s| UsageStats {
            success: acc.success + s.usage.success,
            failure: acc.failure + s.usage.failure,
        });
    let unassigned = state.pool.usage(NO_CREDENTIAL).await;

    reply(
        StatusCode::OK,
        serde_json::json!({
            "pool": health,
            "usage": totals,
            "unassigned": unassigned,
        }),
    )
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

/// GET /admin/logs?limit=N: recent audit entries, newest first.
async fn logs(State(state): State<AdminState>, Query(query): Query<LogsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let entries = state.audit.recent(limit);
    reply(StatusCode::OK, serde_json::json!({ "logs": entries }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEntry, now_millis};
    use crate::gateway::testing::StaticExchange;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use zai_auth::CredentialStore;
    use zai_pool::{InsertionOrder, MemoryCache, PoolSettings};

    struct TestAdmin {
        app: Router,
        pool: Arc<PoolManager>,
        audit: Arc<AuditLog>,
        _dir: tempfile::TempDir,
    }

    async fn test_admin() -> TestAdmin {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            CredentialStore::load(dir.path().join("credentials.json"))
                .await
                .unwrap(),
        );
        let pool = Arc::new(PoolManager::new(
            store,
            Arc::new(StaticExchange),
            Arc::new(MemoryCache::new()),
            Box::new(InsertionOrder),
            PoolSettings::default(),
        ));
        let audit = Arc::new(AuditLog::spawn(dir.path().join("audit.jsonl"), 100));
        let app = build_admin_router(AdminState::new(pool.clone(), audit.clone()));
        TestAdmin {
            app,
            pool,
            audit,
            _dir: dir,
        }
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn create(app: &Router, secret: &str) -> (StatusCode, serde_json::Value) {
        send(
            app,
            "POST",
            "/admin/credentials",
            Some(serde_json::json!({ "secret": secret })),
        )
        .await
    }

    #[tokio::test]
    async fn list_empty_pool() {
        let t = test_admin().await;
        let (status, json) = send(&t.app, "GET", "/admin/credentials", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["credentials"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn create_registers_and_refreshes() {
        let t = test_admin().await;
        let (status, json) = create(&t.app, "secret-value-long").await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["refreshed"], true);
        assert!(json["refresh_error"].is_null());
        let credential = &json["credential"];
        assert_eq!(credential["id"], 1);
        assert_eq!(credential["active"], true);
        assert_eq!(credential["label"], "secret-value-long@example.com");
        // Masked previews only
        assert_eq!(credential["secret"], "secret...");
        assert_eq!(credential["access_token"], "at_sec...");

        assert!(t.pool.select().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_rejects_empty_and_duplicate() {
        let t = test_admin().await;
        let (status, _) = create(&t.app, "   ").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = create(&t.app, "secret-a").await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, json) = create(&t.app, "secret-a").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "secret already registered");
    }

    #[tokio::test]
    async fn listing_never_exposes_raw_values() {
        let t = test_admin().await;
        create(&t.app, "super-secret-value-123").await;

        let (_, json) = send(&t.app, "GET", "/admin/credentials", None).await;
        let text = json.to_string();
        assert!(!text.contains("super-secret-value-123"));
        assert!(!text.contains("at_super-secret-value-123"));
    }

    #[tokio::test]
    async fn get_and_delete_by_id() {
        let t = test_admin().await;
        create(&t.app, "secret-a").await;

        let (status, json) = send(&t.app, "GET", "/admin/credentials/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["credential"]["id"], 1);

        let (status, json) = send(&t.app, "DELETE", "/admin/credentials/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "removed");
        assert!(t.pool.select().await.unwrap().is_none());

        let (status, _) = send(&t.app, "GET", "/admin/credentials/1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&t.app, "DELETE", "/admin/credentials/1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disable_evicts_and_enable_restores() {
        let t = test_admin().await;
        create(&t.app, "secret-a").await;

        let (status, json) = send(&t.app, "POST", "/admin/credentials/1/disable", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["credential"]["active"], false);
        assert!(json["credential"]["access_token"].is_null());
        assert!(t.pool.select().await.unwrap().is_none());

        let (status, _) = send(&t.app, "POST", "/admin/credentials/1/refresh", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, json) = send(&t.app, "POST", "/admin/credentials/1/enable", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["credential"]["active"], true);
        assert!(json["credential"]["access_token"].is_string());
        assert!(t.pool.select().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_ids_are_404() {
        let t = test_admin().await;
        for (method, uri) in [
            ("POST", "/admin/credentials/9/enable"),
            ("POST", "/admin/credentials/9/disable"),
            ("POST", "/admin/credentials/9/refresh"),
        ] {
            let (status, _) = send(&t.app, method, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn refresh_rewrites_lease() {
        let t = test_admin().await;
        create(&t.app, "secret-a").await;
        let (status, json) = send(&t.app, "POST", "/admin/credentials/1/refresh", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["credential"]["success_count"], 2);
    }

    #[tokio::test]
    async fn stats_sum_usage() {
        let t = test_admin().await;
        create(&t.app, "secret-a").await;
        let lease = t.pool.select().await.unwrap().unwrap();
        t.pool.record_stat(&lease.credential_hash, true).await;
        t.pool.record_stat(NO_CREDENTIAL, false).await;

        let (status, json) = send(&t.app, "GET", "/admin/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["pool"]["credentials_total"], 1);
        assert_eq!(json["usage"]["success"], 1);
        assert_eq!(json["unassigned"]["failure"], 1);
    }

    #[tokio::test]
    async fn logs_newest_first_with_limit() {
        let t = test_admin().await;
        for i in 0..3 {
            t.audit.record(AuditEntry {
                timestamp: now_millis(),
                request_id: format!("req_{i}"),
                model: "glm-4.6".into(),
                credential: NO_CREDENTIAL.into(),
                status: 200,
                duration_ms: 1,
                error: None,
                stream: false,
                attempts: 1,
            });
        }

        let (status, json) = send(&t.app, "GET", "/admin/logs?limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        let logs = json["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0]["request_id"], "req_2");

        let (_, json) = send(&t.app, "GET", "/admin/logs", None).await;
        assert_eq!(json["logs"].as_array().unwrap().len(), 3);
    }
}
