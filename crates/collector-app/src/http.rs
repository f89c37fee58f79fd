use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use modbus_client::ConnectionManager;
use serde::Serialize;

/// Thin ambient HTTP layer: `/hello` (liveness smoke test), `/health`
/// (aggregate `ConnectionManager` health snapshots), `/metrics` (Prometheus
/// scrape). Not part of the core algorithms.
#[derive(Clone)]
pub struct AppState {
    pub connections: Arc<HashMap<String, Arc<ConnectionManager>>>,
    pub prometheus_handle: PrometheusHandle,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/hello", get(hello))
        .route("/health", get(health))
        .route("/metrics", get(scrape_metrics))
        .with_state(state)
}

async fn hello() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ConnectionHealthView {
    connection: String,
    status: String,
    last_error: Option<String>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut views = Vec::with_capacity(state.connections.len());
    for (name, manager) in state.connections.iter() {
        let snapshot = manager.health().await;
        views.push(ConnectionHealthView {
            connection: name.clone(),
            status: format!("{:?}", snapshot.status),
            last_error: snapshot.last_error,
        });
    }
    Json(views)
}

async fn scrape_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus_handle.render()
}
