use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use pkg_types::namespace::{LimitRange, ResourceQuota};
use pkg_types::priority::PriorityClass;

use crate::{AppState, error_response};

#[derive(Debug, Deserialize)]
pub struct CreateNamespaceRequest {
    pub name: String,
    #[serde(default)]
    pub quota: Option<ResourceQuota>,
    #[serde(default)]
    pub limit_range: Option<LimitRange>,
}

/// POST /api/v1/namespaces
pub async fn create_namespace(
    State(state): State<AppState>,
    Json(req): Json<CreateNamespaceRequest>,
) -> impl IntoResponse {
    match state
        .store
        .create_namespace(req.name, req.quota, req.limit_range)
        .await
    {
        Ok(ns) => (StatusCode::CREATED, Json(ns)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/namespaces
pub async fn list_namespaces(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.namespaces())
}

/// DELETE /api/v1/namespaces/:name
pub async fn delete_namespace(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_namespace(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// PUT /api/v1/priorityclasses
pub async fn set_priority_class(
    State(state): State<AppState>,
    Json(class): Json<PriorityClass>,
) -> impl IntoResponse {
    match state.store.set_priority_class(class).await {
        Ok(class) => Json(class).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/priorityclasses
pub async fn list_priority_classes(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.priority_classes())
}
