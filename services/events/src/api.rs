use crate::config::ApiConfig;
use crate::lifecycle::{EventLifecycle, LifecycleError};
use crate::models::{DetectionRecord, EventRecord, EventState, WriteTarget};
use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<EventLifecycle>,
}

/// Start request from a device
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub job_id: Uuid,
    pub device_id: String,
    /// Alternative to the bearer header
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub event_id: Uuid,
    pub state: EventState,
    pub write_target: Option<WriteTarget>,
    pub replayed: bool,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub snapshot_ref: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub event_id: Uuid,
    pub state: EventState,
    pub snapshot_ref: Option<String>,
    pub replayed: bool,
}

/// Event as shown to readers. The write URL stays private to the device.
#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub event_id: Uuid,
    pub device_id: String,
    pub state: EventState,
    pub created_at: DateTime<Utc>,
    pub finalize_deadline: DateTime<Utc>,
    pub snapshot_ref: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl From<EventRecord> for EventResponse {
    fn from(e: EventRecord) -> Self {
        Self {
            event_id: e.event_id,
            device_id: e.device_id,
            state: e.state,
            created_at: e.created_at,
            finalize_deadline: e.finalize_deadline,
            snapshot_ref: e.snapshot_ref,
            finalized_at: e.finalized_at,
            expired_at: e.expired_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventDetailResponse {
    #[serde(flatten)]
    pub event: EventResponse,
    pub detections: Vec<DetectionRecord>,
    /// Presigned URL for the snapshot (finalized events only)
    pub snapshot_url: Option<String>,
    pub snapshot_url_expires_at: Option<DateTime<Utc>>,
}

/// Query parameters for the event list
#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    /// Maximum results, clamped to 1..=100
    pub limit: Option<i64>,
    /// Only events created at or after this time (ISO 8601)
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<EventResponse>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: code.to_string(),
        }),
    )
}

fn lifecycle_error(err: LifecycleError) -> ApiError {
    match err {
        LifecycleError::Unauthorized => {
            api_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", err.to_string())
        }
        LifecycleError::NotFound(_) => {
            api_error(StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
        }
        LifecycleError::IdempotencyConflict(_) => {
            api_error(StatusCode::CONFLICT, "IDEMPOTENCY_CONFLICT", err.to_string())
        }
        LifecycleError::Expired(_) => api_error(StatusCode::GONE, "EVENT_EXPIRED", err.to_string()),
        LifecycleError::InvalidRequest(_) => {
            api_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", err.to_string())
        }
        LifecycleError::Store(_) | LifecycleError::Storage(_) => {
            error!(error = %err, "Request failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "Internal server error",
            )
        }
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
}

/// Bearer token, falling back to a key sent in the body.
fn credential<'a>(headers: &'a HeaderMap, body_key: Option<&'a str>) -> Result<&'a str, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .or(body_key)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Missing device credential",
            )
        })
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/v1/events", get(list_events))
        .route("/v1/events/start", post(start_event))
        .route("/v1/events/:event_id", get(get_event))
        .route("/v1/events/:event_id/finalize", post(finalize_event))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "doorcam-events"
    }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.lifecycle.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip_all)]
async fn start_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>, ApiError> {
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;
    let api_key = credential(&headers, request.api_key.as_deref())?;

    let outcome = state
        .lifecycle
        .start(request.job_id, &request.device_id, api_key)
        .await
        .map_err(lifecycle_error)?;

    Ok(Json(StartResponse {
        event_id: outcome.event.event_id,
        state: outcome.event.state,
        write_target: outcome.write_target,
        replayed: outcome.replayed,
    }))
}

#[instrument(skip_all)]
async fn finalize_event(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
    headers: HeaderMap,
    body: Result<Json<FinalizeRequest>, JsonRejection>,
) -> Result<Json<FinalizeResponse>, ApiError> {
    let Path(event_id) = path.map_err(|e| bad_request(e.body_text()))?;
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;
    let api_key = credential(&headers, request.api_key.as_deref())?;

    let outcome = state
        .lifecycle
        .finalize(event_id, api_key, &request.snapshot_ref)
        .await
        .map_err(lifecycle_error)?;

    Ok(Json(FinalizeResponse {
        event_id: outcome.event.event_id,
        state: outcome.event.state,
        snapshot_ref: outcome.event.snapshot_ref,
        replayed: outcome.replayed,
    }))
}

#[instrument(skip_all)]
async fn get_event(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<EventDetailResponse>, ApiError> {
    let Path(event_id) = path.map_err(|e| bad_request(e.body_text()))?;
    let detail = state
        .lifecycle
        .get_event(event_id)
        .await
        .map_err(lifecycle_error)?;

    let (snapshot_url, snapshot_url_expires_at) = match detail.snapshot_url {
        Some(url) => (Some(url.url), Some(url.expires_at)),
        None => (None, None),
    };

    Ok(Json(EventDetailResponse {
        event: detail.event.into(),
        detections: detail.detections,
        snapshot_url,
        snapshot_url_expires_at,
    }))
}

#[instrument(skip_all)]
async fn list_events(
    State(state): State<AppState>,
    query: Result<Query<EventListQuery>, QueryRejection>,
) -> Result<Json<EventListResponse>, ApiError> {
    let Query(params) = query.map_err(|e| bad_request(e.body_text()))?;

    let events = state
        .lifecycle
        .list_events(params.limit, params.since)
        .await
        .map_err(lifecycle_error)?;

    Ok(Json(EventListResponse {
        events: events.into_iter().map(Into::into).collect(),
    }))
}

/// Serve the event API until `cancel` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting event API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
