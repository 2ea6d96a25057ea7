use crate::services::runner::{ActiveRun, FinishedRun};
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use backup_pipeline::store::EndpointHealth;
use serde::Serialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(health))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub replication_factor: usize,
    pub healthy_endpoints: usize,
    pub endpoints: Vec<EndpointHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_run: Option<ActiveRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<FinishedRun>,
}

/// "degraded" when fewer endpoints answer than uploads need.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let endpoints = state.pipeline.store.check_health().await;
    let healthy_endpoints = endpoints.iter().filter(|e| e.healthy).count();
    let replication_factor = state.pipeline.store.replication_factor();

    Json(HealthResponse {
        status: if healthy_endpoints >= replication_factor {
            "ok"
        } else {
            "degraded"
        },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        replication_factor,
        healthy_endpoints,
        endpoints,
        active_run: state.runs.active(),
        last_run: state.runs.last(),
    })
}
