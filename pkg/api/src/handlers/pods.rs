use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use pkg_types::pod::PodSpec;

use crate::{AppState, error_response};

/// POST /api/v1/pods — admit a bare pod; the scheduler picks it up.
pub async fn create_pod(
    State(state): State<AppState>,
    Json(spec): Json<PodSpec>,
) -> impl IntoResponse {
    match state.store.create_pod(spec).await {
        Ok(pod) => (StatusCode::CREATED, Json(pod)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/pods
pub async fn list_pods(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.pods())
}

/// GET /api/v1/pods/:id
pub async fn get_pod(State(state): State<AppState>, Path(pod_id): Path<Uuid>) -> impl IntoResponse {
    match state.store.get_pod(pod_id) {
        Some(pod) => Json(pod).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /api/v1/pods/:id/history
pub async fn pod_history(
    State(state): State<AppState>,
    Path(pod_id): Path<Uuid>,
) -> impl IntoResponse {
    Json(state.store.pod_history(pod_id))
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub version: String,
}

/// POST /api/v1/pods/:id/rollback — swap a live pod onto another version.
pub async fn rollback_pod(
    State(state): State<AppState>,
    Path(pod_id): Path<Uuid>,
    Json(req): Json<RollbackRequest>,
) -> impl IntoResponse {
    match state.scheduler.rollback(pod_id, &req.version).await {
        Ok(pod) => Json(pod).into_response(),
        Err(e) => error_response(&e),
    }
}
