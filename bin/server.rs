// MMP Ingest - Web Server
// REST API over the upload pipeline, plus a background sweep of stale uploads

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use mmp_ingest::{
    resolve_uploader, sweep_stale_pending, IngestConfig, LocalObjectStore, PlanIngestor,
    PlanMetadata, PlanWithEntries, RecordStore, RegistrySite, SqliteRecordStore, UploadRequest,
    UploadResult,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
struct AppState {
    ingestor: Arc<PlanIngestor>,
    store: Arc<SqliteRecordStore>,
    shutdown: CancellationToken,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Query string of POST /api/plans
#[derive(Debug, Deserialize)]
struct UploadParams {
    filename: String,
    project: Option<String>,
    month: Option<String>,
    hub: Option<String>,
    name: Option<String>,
}

fn status_for(result: &UploadResult) -> StatusCode {
    if result.success {
        return StatusCode::CREATED;
    }
    match result.error_code.as_deref() {
        Some("validation_error") => StatusCode::UNPROCESSABLE_ENTITY,
        Some("duplicate_upload") => StatusCode::CONFLICT,
        Some("file_too_large") => StatusCode::PAYLOAD_TOO_LARGE,
        Some("unsupported_file") => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        Some("timeout") => StatusCode::GATEWAY_TIMEOUT,
        Some("cancelled") => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok(mmp_ingest::VERSION))
}

/// POST /api/plans - Upload a plan file (raw body)
async fn upload_plan(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(uploader_id) = headers
        .get("x-uploader-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::err("missing x-uploader-id header")),
        )
            .into_response();
    };

    let uploader = resolve_uploader(state.store.as_ref(), &uploader_id).await;
    let request = UploadRequest::new(&params.filename, body.to_vec()).with_metadata(PlanMetadata {
        display_name: params.name,
        hub: params.hub,
        month: params.month,
        owner_project_id: params.project,
    });

    // Run detached so a dropped connection cannot interrupt the rollback chain
    let cancel = state.shutdown.child_token();
    let ingestor = Arc::clone(&state.ingestor);
    let task = tokio::spawn(async move { ingestor.ingest(request, &uploader, None, &cancel).await });

    match task.await {
        Ok(result) => (status_for(&result), Json(result)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "upload task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<()>::err("upload task failed")),
            )
                .into_response()
        }
    }
}

/// GET /api/plans/:id - Plan with its entries
async fn get_plan(State(state): State<AppState>, Path(plan_id): Path<Uuid>) -> Response {
    let plan = match state.store.get_plan(plan_id).await {
        Ok(Some(plan)) => plan,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::<PlanWithEntries>::err(format!("plan {} not found", plan_id))),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(plan_id = %plan_id, error = %e, "error loading plan");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<PlanWithEntries>::err(e.to_string())),
            )
                .into_response();
        }
    };

    match state.store.list_entries(plan_id).await {
        Ok(entries) => (
            StatusCode::OK,
            Json(ApiResponse::ok(PlanWithEntries { plan, entries })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(plan_id = %plan_id, error = %e, "error loading plan entries");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<PlanWithEntries>::err(e.to_string())),
            )
                .into_response()
        }
    }
}

/// GET /api/sites - Site registry
async fn get_sites(State(state): State<AppState>) -> Response {
    match state.store.list_sites().await {
        Ok(sites) => (StatusCode::OK, Json(ApiResponse::ok(sites))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "error listing sites");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<Vec<RegistrySite>>::err(e.to_string())),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Background sweep
// ============================================================================

fn spawn_sweeper(
    store: Arc<SqliteRecordStore>,
    objects: Arc<LocalObjectStore>,
    ttl: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let every = (ttl / 2).max(Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweep_stale_pending(store.as_ref(), objects.as_ref(), ttl).await {
                        tracing::error!(error = %e, "stale pending sweep failed");
                    }
                }
            }
        }
    })
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let config = IngestConfig::from_env();
    let addr = std::env::var("MMP_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    let store = Arc::new(SqliteRecordStore::open(&config.database_path)?);
    let objects = Arc::new(LocalObjectStore::new(config.storage_root.clone()));
    tracing::info!(
        database = %config.database_path.display(),
        storage = %config.storage_root.display(),
        "stores opened"
    );

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        Arc::clone(&store),
        Arc::clone(&objects),
        config.pending_ttl,
        shutdown.clone(),
    );

    let body_limit = config.max_file_bytes + 64 * 1024;
    let ingestor = Arc::new(PlanIngestor::new(config, store.clone(), objects));
    let state = AppState {
        ingestor,
        store,
        shutdown: shutdown.clone(),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/plans", post(upload_plan))
        .route("/plans/:id", get(get_plan))
        .route("/sites", get(get_sites))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .layer(DefaultBodyLimit::max(body_limit)),
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("🚀 Server running on http://{}", addr);

    let on_signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
            }
            on_signal.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}
