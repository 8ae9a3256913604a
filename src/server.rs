//! Ingestion API over HTTP.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/manifest` | Service and connector capabilities |
//! | `POST` | `/sync` | Start a sync run for a source |
//! | `POST` | `/cancel` | Request cancellation of a running sync |
//! | `POST` | `/action` | Run a connector action |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/queue/stats` | Event queue counts by status |
//! | `POST` | `/sdk/runs` | Register a run driven by a remote connector |
//! | `POST` | `/sdk/content` | Store a document body (base64) |
//! | `POST` | `/sdk/events` | Enqueue a document event |
//! | `POST` | `/sdk/runs/{id}/progress` | Report scan counters |
//! | `POST` | `/sdk/runs/{id}/state` | Save a checkpoint |
//! | `POST` | `/sdk/runs/{id}/complete` | Finish a run |
//! | `POST` | `/sdk/runs/{id}/fail` | Fail or cancel a run |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "source docs already has an active sync run-1" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `content_storage` (500), `internal` (500).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::client::{
    BeginRunRequest, BeginRunResponse, CompleteRequest, FailRequest, IngestionClient,
    ProgressRequest, Receipt, StateRequest, StoreContentRequest, StoreContentResponse,
};
use crate::error::IngestError;
use crate::ingest::{ActionRequest, IngestionService, ServiceManifest};
use crate::models::EventEnvelope;
use crate::queue::QueueStats;
use crate::traits::ActionResponse;

type AppState = Arc<IngestionService>;

/// Build the router. Tests mount it on an ephemeral port.
pub fn router(service: Arc<IngestionService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/manifest", get(handle_manifest))
        .route("/sync", post(handle_sync))
        .route("/cancel", post(handle_cancel))
        .route("/action", post(handle_action))
        .route("/health", get(handle_health))
        .route("/queue/stats", get(handle_queue_stats))
        .route("/sdk/runs", post(handle_begin_run))
        .route("/sdk/content", post(handle_store_content))
        .route("/sdk/events", post(handle_event))
        .route("/sdk/runs/{id}/progress", post(handle_progress))
        .route("/sdk/runs/{id}/state", post(handle_state))
        .route("/sdk/runs/{id}/complete", post(handle_complete))
        .route("/sdk/runs/{id}/fail", post(handle_fail))
        .layer(cors)
        .with_state(service)
}

/// Serve the ingestion API on `bind` until `shutdown` flips to true.
pub async fn run_server(
    service: Arc<IngestionService>,
    bind: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind = %bind, "ingestion API listening");

    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let (status, code) = match &err {
            IngestError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            IngestError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            IngestError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            IngestError::ContentStorage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "content_storage")
            }
            IngestError::Transport(_) | IngestError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        if status.is_server_error() {
            tracing::error!(code, error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

fn ok() -> Json<Value> {
    Json(json!({ "ok": true }))
}

// ============ Control plane ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_manifest(State(service): State<AppState>) -> Json<ServiceManifest> {
    Json(service.manifest())
}

#[derive(Deserialize)]
struct SyncRequest {
    sync_run_id: String,
    source_id: String,
}

#[derive(Serialize)]
struct SyncResponse {
    status: &'static str,
    sync_run_id: String,
}

/// `POST /sync`. Answers once the run is registered; the connector runs
/// on its own task.
async fn handle_sync(
    State(service): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> ApiResult<SyncResponse> {
    // Dropping the handle detaches the task.
    let _ = service.start_sync(&req.sync_run_id, &req.source_id).await?;
    Ok(Json(SyncResponse {
        status: "started",
        sync_run_id: req.sync_run_id,
    }))
}

#[derive(Deserialize)]
struct CancelRequest {
    sync_run_id: String,
}

#[derive(Serialize)]
struct CancelResponse {
    status: &'static str,
}

async fn handle_cancel(
    State(service): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Json<CancelResponse> {
    let status = if service.cancel_sync(&req.sync_run_id) {
        "cancelled"
    } else {
        "not_found"
    };
    Json(CancelResponse { status })
}

async fn handle_action(
    State(service): State<AppState>,
    Json(req): Json<ActionRequest>,
) -> ApiResult<ActionResponse> {
    Ok(Json(service.execute_action(req).await?))
}

async fn handle_queue_stats(State(service): State<AppState>) -> ApiResult<QueueStats> {
    let stats = service
        .queue()
        .stats()
        .await
        .map_err(IngestError::Internal)?;
    Ok(Json(stats))
}

// ============ SDK ============

async fn handle_begin_run(
    State(service): State<AppState>,
    Json(req): Json<BeginRunRequest>,
) -> ApiResult<BeginRunResponse> {
    let (source, _token) = service.begin_run(&req.sync_run_id, &req.source_id).await?;
    Ok(Json(BeginRunResponse {
        sync_run_id: req.sync_run_id,
        state: source.sync_state,
    }))
}

async fn handle_store_content(
    State(service): State<AppState>,
    Json(req): Json<StoreContentRequest>,
) -> ApiResult<StoreContentResponse> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(req.content.as_bytes())
        .map_err(|e| IngestError::BadRequest(format!("content is not valid base64: {}", e)))?;
    let content_id = service
        .store_content(&req.sync_run_id, &bytes, &req.content_type)
        .await?;
    Ok(Json(StoreContentResponse { content_id }))
}

async fn handle_event(
    State(service): State<AppState>,
    Json(event): Json<EventEnvelope>,
) -> ApiResult<Receipt> {
    Ok(Json(service.emit_event(&event).await?))
}

async fn handle_progress(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ProgressRequest>,
) -> ApiResult<Receipt> {
    Ok(Json(service.report_progress(&id, &req).await?))
}

async fn handle_state(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StateRequest>,
) -> ApiResult<Value> {
    service.save_state(&id, &req.state).await?;
    Ok(ok())
}

async fn handle_complete(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<Value> {
    service.complete_run(&id, &req).await?;
    Ok(ok())
}

async fn handle_fail(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FailRequest>,
) -> ApiResult<Value> {
    service.fail_run(&id, &req).await?;
    Ok(ok())
}
