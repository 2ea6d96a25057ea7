use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backup_pipeline::BackupError;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Backup(#[from] BackupError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Backup(e) => backup_status(e),
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

fn backup_status(e: &BackupError) -> (StatusCode, String) {
    match e {
        BackupError::NoBaseBackup => (StatusCode::CONFLICT, e.to_string()),
        BackupError::InsufficientReplication { .. } | BackupError::Store(_) | BackupError::Http(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        BackupError::Config(_) => (StatusCode::BAD_REQUEST, e.to_string()),
        _ => {
            tracing::error!(error = %e, "Backup operation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
