//! Health and admin HTTP handlers.
//!
//! This module provides Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Prometheus metrics (`/metrics`)
//! - Queue monitoring (`/queues/{stream}/info`)
//! - Dead-letter admin endpoints (`/admin/deadletter/{stream}/*`)

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::client::StreamClient;
use crate::dlq::DeadLetterQueue;
use crate::error::QueueError;
use crate::metrics;

type ApiError = (StatusCode, Json<Value>);

/// Shared state for the health and admin routes
#[derive(Clone)]
pub struct AdminState {
    pub client: Arc<dyn StreamClient>,
    pub dead_letters: DeadLetterQueue,
    pub app_name: String,
    pub app_version: String,
    /// Group used by `/queues/{stream}/info` when none is given
    pub default_group: String,
}

impl AdminState {
    pub fn new(
        client: Arc<dyn StreamClient>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        default_group: impl Into<String>,
    ) -> Self {
        Self {
            dead_letters: DeadLetterQueue::new(client.clone()),
            client,
            app_name: app_name.into(),
            app_version: app_version.into(),
            default_group: default_group.into(),
        }
    }
}

/// Liveness response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe: OK whenever the server responds
pub async fn health_handler(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe: OK when the broker answers PING
pub async fn ready_handler(State(state): State<AdminState>) -> Result<Json<Value>, ApiError> {
    match state.client.ping().await {
        Ok(()) => Ok(Json(json!({
            "status": "ready",
            "checks": { "redis": "ok" }
        }))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("error: {}", e) }
            })),
        )),
    }
}

/// Prometheus scrape endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct InfoParams {
    pub group: Option<String>,
}

/// Stream length and pending summary for one group
///
/// `GET /queues/{stream}/info?group=executors`
pub async fn queue_info_handler(
    State(state): State<AdminState>,
    Path(stream): Path<String>,
    Query(params): Query<InfoParams>,
) -> Result<Json<Value>, ApiError> {
    let group = params.group.unwrap_or_else(|| state.default_group.clone());
    let info = state.client.info(&stream, &group).await.map_err(error_response)?;

    Ok(Json(json!({
        "stream": stream,
        "group": group,
        "length": info.length,
        "total_pending": info.total_pending,
        "consumer_pending": info.consumer_pending,
    })))
}

/// Query parameters for listing dead-lettered entries
#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Maximum entries to return (default: 10, max: 100)
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Entry ID to start from (inclusive)
    pub start: Option<String>,
}

fn default_limit() -> usize {
    10
}

/// `GET /admin/deadletter/{stream}/stats`
pub async fn dead_letter_stats_handler(
    State(state): State<AdminState>,
    Path(stream): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.dead_letters.stats(&stream).await.map_err(error_response)?;
    Ok(Json(stats))
}

/// `GET /admin/deadletter/{stream}/entries?limit=10&start=0-0`
pub async fn dead_letter_list_handler(
    State(state): State<AdminState>,
    Path(stream): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.clamp(1, 100);
    let entries = state
        .dead_letters
        .list(&stream, limit, params.start.as_deref())
        .await
        .map_err(error_response)?;

    Ok(Json(json!({
        "stream": stream,
        "limit": limit,
        "count": entries.len(),
        "entries": entries,
    })))
}

/// Re-enqueue one dead-lettered entry onto its original stream
///
/// `POST /admin/deadletter/{stream}/replay/{id}`
pub async fn dead_letter_replay_handler(
    State(state): State<AdminState>,
    Path((stream, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    match state.dead_letters.replay(&stream, &id).await {
        Ok(Some(entry_id)) => Ok(Json(json!({
            "success": true,
            "dead_letter_id": id,
            "entry_id": entry_id,
        }))),
        Ok(None) => Err(not_found(&id)),
        Err(e) => Err(error_response(e)),
    }
}

/// Discard one dead-lettered entry
///
/// `DELETE /admin/deadletter/{stream}/{id}`
pub async fn dead_letter_discard_handler(
    State(state): State<AdminState>,
    Path((stream, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    match state.dead_letters.discard(&stream, &id).await {
        Ok(true) => Ok(Json(json!({ "success": true, "dead_letter_id": id }))),
        Ok(false) => Err(not_found(&id)),
        Err(e) => Err(error_response(e)),
    }
}

/// Discard every dead-lettered entry of a stream
///
/// `DELETE /admin/deadletter/{stream}`
pub async fn dead_letter_purge_handler(
    State(state): State<AdminState>,
    Path(stream): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.dead_letters.purge(&stream).await.map_err(error_response)?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

fn not_found(id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Entry not found in dead-letter stream",
            "dead_letter_id": id
        })),
    )
}

fn error_response(e: QueueError) -> ApiError {
    let status = if e.is_connection_error() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "error": e.to_string() })))
}

/// Liveness, readiness, metrics and queue info routes
pub fn health_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/queues/{stream}/info", get(queue_info_handler))
        .with_state(state)
}

/// Dead-letter admin routes
pub fn dead_letter_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/deadletter/{stream}", delete(dead_letter_purge_handler))
        .route("/admin/deadletter/{stream}/stats", get(dead_letter_stats_handler))
        .route("/admin/deadletter/{stream}/entries", get(dead_letter_list_handler))
        .route(
            "/admin/deadletter/{stream}/replay/{id}",
            post(dead_letter_replay_handler),
        )
        .route("/admin/deadletter/{stream}/{id}", delete(dead_letter_discard_handler))
        .with_state(state)
}

/// Health and dead-letter admin routes combined
pub fn admin_router(state: AdminState) -> Router {
    health_router(state.clone()).merge(dead_letter_router(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockStreamClient, RedisStreamInfo};
    use crate::envelope::MessageEnvelope;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn router(client: MockStreamClient) -> Router {
        admin_router(AdminState::new(Arc::new(client), "queue-worker", "0.1.0", "executors"))
    }

    async fn call(router: Router, method: Method, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(router(MockStreamClient::new()), Method::GET, "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["name"], "queue-worker");
    }

    #[tokio::test]
    async fn test_ready_reports_broker_failure() {
        let mut client = MockStreamClient::new();
        client
            .expect_ping()
            .returning(|| Err(QueueError::Protocol("LOADING".into())));

        let (status, body) = call(router(client), Method::GET, "/ready").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");
    }

    #[tokio::test]
    async fn test_queue_info_uses_default_group() {
        let mut client = MockStreamClient::new();
        client
            .expect_info()
            .withf(|stream, group| stream == "chat:requests" && group == "executors")
            .returning(|_, _| {
                Ok(RedisStreamInfo {
                    length: 1,
                    total_pending: 1,
                    consumer_pending: HashMap::from([("worker-a".to_string(), 1)]),
                })
            });

        let (status, body) = call(router(client), Method::GET, "/queues/chat:requests/info").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["length"], 1);
        assert_eq!(body["consumer_pending"]["worker-a"], 1);
    }

    #[tokio::test]
    async fn test_dead_letter_list() {
        let mut client = MockStreamClient::new();
        client
            .expect_range()
            .withf(|stream, start, end, count| {
                stream == "q.deadletter" && start == "-" && end == "+" && *count == 100
            })
            .returning(|_, _, _, _| {
                Ok(vec![MessageEnvelope::new(
                    "q.deadletter",
                    "9-0",
                    HashMap::from([
                        ("job".to_string(), "1".to_string()),
                        ("failureCount".to_string(), "3".to_string()),
                    ]),
                )])
            });

        let (status, body) = call(
            router(client),
            Method::GET,
            "/admin/deadletter/q/entries?limit=500",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["failure_count"], 3);
    }

    #[tokio::test]
    async fn test_replay_missing_entry_is_not_found() {
        let mut client = MockStreamClient::new();
        client.expect_range().returning(|_, _, _, _| Ok(vec![]));

        let (status, _) = call(
            router(client),
            Method::POST,
            "/admin/deadletter/q/replay/1-0",
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_discard() {
        let mut client = MockStreamClient::new();
        client
            .expect_delete()
            .withf(|stream, id| stream == "q.deadletter" && id == "9-0")
            .returning(|_, _| Ok(true));

        let (status, body) = call(router(client), Method::DELETE, "/admin/deadletter/q/9-0").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }
}
