//! Custom error types for the backup pipeline.

use crate::restore::RestoreStage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dump tool failed (exit code {exit_code:?}): {stderr}")]
    DumpFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Authentication failed: ciphertext or tag does not verify")]
    AuthenticationFailed,

    #[error("Insufficient replication: required {required}, pinned on {achieved}")]
    InsufficientReplication { required: usize, achieved: usize },

    #[error("No full backup found. Cannot create incremental backup without a base")]
    NoBaseBackup,

    #[error("Manifest error: {0}")]
    ManifestIo(String),

    #[error("Content store error: {0}")]
    Store(String),

    #[error("Notification delivery failed: {0}")]
    NotificationDeliveryFailed(String),

    #[error("Secondary mirror error: {0}")]
    SecondaryMirror(String),

    #[error("Cleanup error: {0}")]
    Cleanup(String),

    #[error("Restore tool failed (exit code {exit_code:?}): {stderr}")]
    RestoreToolFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Restore failed during {stage}: {source}")]
    RestoreFailed {
        stage: RestoreStage,
        #[source]
        source: Box<BackupError>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Tag an error with the restore stage it happened in.
    pub fn in_restore_stage(self, stage: RestoreStage) -> Self {
        BackupError::RestoreFailed {
            stage,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
