use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use pkg_types::service::{ServiceSpec, ServiceStatus};

use crate::{AppState, error_response};

/// POST /api/v1/services — declare a service.
pub async fn create_service(
    State(state): State<AppState>,
    Json(spec): Json<ServiceSpec>,
) -> impl IntoResponse {
    match state.store.create_service(spec).await {
        Ok(service) => (StatusCode::CREATED, Json(service)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/services
pub async fn list_services(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.services())
}

/// GET /api/v1/services/:id
pub async fn get_service(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.get_service(service_id) {
        Some(service) => Json(service).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replicas: u32,
}

/// PUT /api/v1/services/:id/scale
pub async fn scale_service(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
    Json(req): Json<ScaleRequest>,
) -> impl IntoResponse {
    match state.store.scale_service(service_id, req.replicas).await {
        Ok(service) => Json(service).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct VersionRequest {
    pub version: String,
}

/// PUT /api/v1/services/:id/version — retarget the service; the reconciler
/// rolls replicas over.
pub async fn update_service_version(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
    Json(req): Json<VersionRequest>,
) -> impl IntoResponse {
    match state
        .store
        .update_service_version(service_id, &req.version)
        .await
    {
        Ok(service) => Json(service).into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE /api/v1/services/:id — mark deleting; the reconciler cascades.
pub async fn delete_service(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
) -> impl IntoResponse {
    match state
        .store
        .set_service_status(service_id, ServiceStatus::Deleting)
        .await
    {
        Ok(service) => (StatusCode::ACCEPTED, Json(service)).into_response(),
        Err(e) => error_response(&e),
    }
}
