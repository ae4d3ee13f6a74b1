//! Read-only HTTP status API over the queue and evidence store.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use uuid::Uuid;

use crate::errors::QueueError;
use crate::evidence::EvidenceStore;
use crate::queue::{ListFilter, QueueHandle};

pub const DEFAULT_PORT: u16 = 3142;

pub struct AppState {
    pub queue: QueueHandle,
    pub evidence: EvidenceStore,
}

pub type SharedState = Arc<AppState>;

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound { id } => ApiError::NotFound(format!("Work item {} not found", id)),
            QueueError::Validation(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/items", get(list_items))
        .route("/api/items/{id}", get(get_item))
        .route("/api/items/{id}/evidence", get(get_evidence))
}

pub fn build_router(state: SharedState) -> Router {
    api_router().with_state(state)
}

async fn health(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let counts = state.queue.counts().await?;
    Ok(Json(json!({"status": "ok", "queue": counts})))
}

async fn list_items(
    State(state): State<SharedState>,
    Query(filter): Query<ListFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queue.list(filter).await?))
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid work item id '{}'", raw)))
}

async fn get_item(State(state): State<SharedState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    match state.queue.view(id).await? {
        Some(item) => Ok(Json(item)),
        None => Err(ApiError::NotFound(format!("Work item {} not found", id))),
    }
}

async fn get_evidence(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    if state.queue.view(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Work item {} not found", id)));
    }
    let report = state
        .evidence
        .export_report(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(report))
}

/// Serve the status API on localhost until Ctrl-C.
pub async fn serve(state: SharedState, port: u16) -> Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "status API listening");
    println!("Anvil status API at http://{}/api/health", local_addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("failed to install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("Server error")?;
    tracing::info!("status API stopped");
    Ok(())
}
