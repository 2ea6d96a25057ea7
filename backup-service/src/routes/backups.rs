use crate::error::AppError;
use crate::services::runner::{self, ActiveRun, Operation};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_pipeline::manifest::{BackupFilter, BackupRecord, ManifestStatistics};
use backup_pipeline::store::PinVerification;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups))
        .route("/statistics", get(statistics))
        .route("/{address}/verify", get(verify_backup))
        .route("/full", post(trigger_full))
        .route("/incremental", post(trigger_incremental))
}

pub fn retention_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sweep", post(trigger_sweep))
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<BackupFilter>,
) -> Result<Json<Vec<BackupRecord>>, AppError> {
    if let (Some(since), Some(until)) = (filter.since, filter.until) {
        if since > until {
            return Err(AppError::BadRequest("since must not be after until".into()));
        }
    }
    let mut ledger = state.pipeline.ledger.lock().await;
    ledger.load().await?;
    Ok(Json(ledger.query(&filter)))
}

async fn statistics(State(state): State<Arc<AppState>>) -> Result<Json<ManifestStatistics>, AppError> {
    let mut ledger = state.pipeline.ledger.lock().await;
    ledger.load().await?;
    Ok(Json(ledger.statistics()))
}

async fn verify_backup(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<PinVerification>, AppError> {
    {
        let mut ledger = state.pipeline.ledger.lock().await;
        if ledger.load().await?.find(&address).is_none() {
            return Err(AppError::NotFound(format!("Backup {} not found", address)));
        }
    }
    Ok(Json(state.pipeline.store.verify_pin(&address).await))
}

async fn trigger_full(State(state): State<Arc<AppState>>) -> Result<(StatusCode, Json<ActiveRun>), AppError> {
    trigger(state, Operation::Full)
}

async fn trigger_incremental(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<ActiveRun>), AppError> {
    trigger(state, Operation::Incremental)
}

async fn trigger_sweep(State(state): State<Arc<AppState>>) -> Result<(StatusCode, Json<ActiveRun>), AppError> {
    trigger(state, Operation::Retention)
}

/// Runs continue in the background; progress shows up in `/api/health`.
fn trigger(state: Arc<AppState>, operation: Operation) -> Result<(StatusCode, Json<ActiveRun>), AppError> {
    let run = runner::spawn(state, operation)?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}
