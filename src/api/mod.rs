//! HTTP surface
//!
//! Thin axum layer over [`SyncService`]:
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | GET | `/api/health` | Dependency health |
//! | GET | `/api/status` | Queue, limiter, breaker and backlog snapshot |
//! | GET | `/metrics` | Prometheus text format |
//! | POST | `/api/sync` | Force sync 1 to 20 AWBs |
//! | POST | `/api/track` | Add AWBs to tracking and sync them |
//! | POST | `/api/shipments/{awb}/reset` | Re-arm a quarantined shipment |

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::metrics;
use crate::service::{HealthStatus, SyncService};

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Body of `/api/sync` and `/api/track`
#[derive(Debug, Deserialize)]
pub struct AwbListRequest {
    pub awbs: Vec<String>,
}

/// Force sync response
#[derive(Debug, Serialize)]
pub struct EnqueuedResponse {
    pub batch_id: String,
    pub awbs: Vec<String>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
}

// ============================================================================
// Router
// ============================================================================

/// Create the API router
pub fn create_router(service: Arc<SyncService>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .route("/api/sync", post(force_sync))
        .route("/api/track", post(add_to_tracking))
        .route("/api/shipments/{awb}/reset", post(reset_shipment))
        .with_state(AppState { service })
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Serve the router on `bind` until `shutdown` resolves
pub async fn serve<F>(service: Arc<SyncService>, bind: &str, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP surface listening");

    axum::serve(listener, create_router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    (status, Json(ApiResponse::error(err.to_string()))).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> Response {
    let report = state.service.health().await;
    let code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(ApiResponse::success(report))).into_response()
}

async fn get_status(State(state): State<AppState>) -> Response {
    match state.service.status().await {
        Ok(snapshot) => Json(ApiResponse::success(snapshot)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn force_sync(State(state): State<AppState>, Json(request): Json<AwbListRequest>) -> Response {
    match state.service.force_sync(request.awbs.as_slice()).await {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(EnqueuedResponse {
                batch_id: job.batch_id,
                awbs: job.awbs,
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn add_to_tracking(
    State(state): State<AppState>,
    Json(request): Json<AwbListRequest>,
) -> Response {
    match state.service.add_to_tracking(request.awbs.as_slice()).await {
        Ok(outcome) => (StatusCode::ACCEPTED, Json(ApiResponse::success(outcome))).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn reset_shipment(State(state): State<AppState>, Path(awb): Path<String>) -> Response {
    match state.service.reset_shipment(&awb).await {
        Ok(true) => Json(ApiResponse::success(format!("{awb} re-armed"))).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("{awb} is not tracked"))),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::limits::{Limits, MemoryConstraintStore};
    use crate::queue::MemoryJobQueue;
    use crate::scheduler::Scheduler;
    use crate::storage::SqliteStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn router() -> Router {
        let config = Config::default();
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let queue = Arc::new(MemoryJobQueue::new(&config.queue, clock.clone()));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            &config,
        ));
        let limits = Limits::with_store(
            Arc::new(MemoryConstraintStore::new()),
            &config.limits,
            "test",
            clock.clone(),
        );
        create_router(Arc::new(SyncService::new(store, queue, scheduler, limits, clock)))
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_force_sync_accepts_and_rejects() {
        let app = router();

        let response = app
            .clone()
            .oneshot(post_json("/api/sync", r#"{"awbs":["AWB0001"]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["awbs"][0], "AWB0001");

        let response = app
            .oneshot(post_json("/api/sync", r#"{"awbs":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["success"], false);
    }

    #[tokio::test]
    async fn test_track_then_status() {
        let app = router();
        let response = app
            .clone()
            .oneshot(post_json("/api/track", r#"{"awbs":["AWB0001","AWB0002"]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["data"]["backlog"]["total"], 2);
        assert_eq!(body["data"]["queue"]["waiting"], 1);
    }

    #[tokio::test]
    async fn test_reset_unknown_shipment() {
        let response = router()
            .oneshot(post_json("/api/shipments/AWB0404/reset", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
