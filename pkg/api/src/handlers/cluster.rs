use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ClusterInfo {
    pub version: String,
    pub nodes: usize,
    pub pods: usize,
    pub services: usize,
    pub packs: usize,
    pub open_sessions: usize,
}

/// GET /api/v1/cluster/info
pub async fn cluster_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(ClusterInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        nodes: state.store.nodes().len(),
        pods: state.store.pods().len(),
        services: state.store.services().len(),
        packs: state.store.packs().len(),
        open_sessions: state.gateway.registry.len(),
    })
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}
