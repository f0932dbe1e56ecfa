//! JSON status surface over the polling registry.

use crate::cache::MonitorStatus;
use crate::error::MonitorError;
use crate::metrics::SharedMetrics;
use crate::polling::{NodeInfo, PollTarget, PollingRegistry};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PollingRegistry>,
    pub metrics: SharedMetrics,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/nodes", get(list_nodes))
        .route("/nodes/{key}", get(node_detail))
        .route("/nodes/{key}/poll", post(poll_node))
        .route("/poll", post(poll_all))
        .with_state(state)
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let status = match &self {
            MonitorError::NotFound(_) => StatusCode::NOT_FOUND,
            MonitorError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            MonitorError::Registration(_) | MonitorError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Metrics endpoint handler
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.registry.nodes();
    let count = |wanted: MonitorStatus| {
        nodes
            .iter()
            .filter(|n| n.aggregate_status() == wanted)
            .count()
    };

    let status = if state.registry.is_shutting_down() {
        "stopping"
    } else {
        "healthy"
    };

    Json(json!({
        "status": status,
        "nodes": nodes.len(),
        "critical": count(MonitorStatus::Critical),
        "warning": count(MonitorStatus::Warning),
        "pending_polls": state.registry.pending_tasks(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeInfo>> {
    Json(state.registry.nodes().iter().map(|n| n.info()).collect())
}

async fn node_detail(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<NodeInfo>, MonitorError> {
    state
        .registry
        .get(&key)
        .map(|node| Json(node.info()))
        .ok_or_else(|| MonitorError::NotFound(format!("node {}", key)))
}

async fn poll_node(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, MonitorError> {
    let dispatched = state.registry.force_poll(PollTarget::Node(&key))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "node": key, "dispatched": dispatched }))))
}

async fn poll_all(State(state): State<AppState>) -> Result<impl IntoResponse, MonitorError> {
    let dispatched = state.registry.force_poll(PollTarget::All)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "dispatched": dispatched }))))
}
