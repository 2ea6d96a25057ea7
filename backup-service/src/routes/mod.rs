pub mod backups;
pub mod health;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/health", health::router())
        .nest("/api/backups", backups::router())
        .nest("/api/retention", backups::retention_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::runner::Operation;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use backup_pipeline::manifest::{BackupKind, BackupRecord};
    use backup_pipeline::{Config, Pipeline};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_state(tmp: &TempDir) -> Arc<AppState> {
        let mut config = Config::default();
        config.database.uri = "mongodb://localhost:27017".to_string();
        config.encryption.key = format!("{}=", "A".repeat(43));
        config.store.endpoints = vec!["http://127.0.0.1:9".to_string()];
        config.store.replication_factor = 1;
        config.storage.temp_dir = tmp.path().join("temp");
        config.storage.storage_dir = tmp.path().join("storage");

        let pipeline = Pipeline::from_config(config).await.unwrap();
        Arc::new(AppState::new(pipeline))
    }

    fn record(address: &str, kind: BackupKind, created_at: &str, size: u64, base: Option<&str>) -> BackupRecord {
        BackupRecord {
            kind,
            content_address: address.to_string(),
            created_at: created_at.parse().unwrap(),
            size_bytes: size,
            duration_seconds: 1.0,
            databases: vec!["shop".to_string()],
            encrypted: true,
            replica_set: None,
            local_path: None,
            base_backup_address: base.map(str::to_string),
            oplog_range_start: None,
            oplog_range_end: None,
        }
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
        let response = create_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_list_and_statistics() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp).await;
        {
            let mut ledger = state.pipeline.ledger.lock().await;
            ledger
                .append(record("bafyfull", BackupKind::Full, "2024-01-01T02:00:00Z", 100, None))
                .await
                .unwrap();
            ledger
                .append(record(
                    "bafyinc",
                    BackupKind::Incremental,
                    "2024-01-02T02:00:00Z",
                    20,
                    Some("bafyfull"),
                ))
                .await
                .unwrap();
        }

        let (status, body) = get_json(state.clone(), "/api/backups").await;
        assert_eq!(status, StatusCode::OK);
        let addresses: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["contentAddress"].as_str().unwrap())
            .collect();
        assert_eq!(addresses, vec!["bafyinc", "bafyfull"]);

        let (_, body) = get_json(state.clone(), "/api/backups?type=full").await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = get_json(state.clone(), "/api/backups?since=2024-01-02T00:00:00Z").await;
        assert_eq!(body[0]["contentAddress"], "bafyinc");

        let (status, body) = get_json(state, "/api/backups/statistics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalBackups"], 2);
        assert_eq!(body["totalSize"], 120);
    }

    #[tokio::test]
    async fn test_verify_unknown_backup_is_404() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp).await;
        let (status, body) = get_json(state, "/api/backups/bafynope/verify").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("bafynope"));
    }

    #[tokio::test]
    async fn test_trigger_rejected_while_run_active() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp).await;
        let _guard = state.runs.try_acquire(Operation::Retention).unwrap();

        for uri in ["/api/backups/full", "/api/backups/incremental", "/api/retention/sweep"] {
            let response = create_router(state.clone())
                .oneshot(Request::post(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CONFLICT, "{uri}");
        }
    }
}
