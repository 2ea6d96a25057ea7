//! Dump producer: runs `mongodump` for full snapshots and oplog ranges.

use crate::config::DatabaseConfig;
use crate::fs::walker::{calculate_total_size, top_level_dirs};
use crate::utils::process::run_tool;
use crate::utils::redact::mask_uri;
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// What a dump run should capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    /// Point-in-time snapshot of every database, or the configured one
    Full,
    /// Oplog entries with `ts >= since`
    Incremental { since: DateTime<Utc> },
}

/// Metadata of a finished dump.
#[derive(Debug, Clone)]
pub struct DumpResult {
    pub output_dir: PathBuf,
    pub duration_seconds: f64,
    /// Sorted database directory names, `["all"]` when there are none
    pub databases: Vec<String>,
    pub size_bytes: u64,
    /// When the dump started; the snapshot's point in time
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DumpProducer {
    tool: String,
    uri: String,
    database: Option<String>,
}

impl DumpProducer {
    pub fn new(tool: impl Into<String>, uri: impl Into<String>, database: Option<String>) -> Self {
        Self {
            tool: tool.into(),
            uri: uri.into(),
            database,
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(&config.dump_tool, &config.uri, config.database.clone())
    }

    /// Arguments passed to the dump tool for `mode`.
    pub fn build_args(&self, mode: DumpMode, output_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--uri".to_string(),
            self.uri.clone(),
            "--out".to_string(),
            output_dir.to_string_lossy().into_owned(),
        ];

        match mode {
            DumpMode::Full => {
                if let Some(db) = &self.database {
                    args.push("--db".to_string());
                    args.push(db.clone());
                }
            }
            DumpMode::Incremental { since } => {
                args.extend([
                    "--db".to_string(),
                    "local".to_string(),
                    "--collection".to_string(),
                    "oplog.rs".to_string(),
                    "--query".to_string(),
                    oplog_query(since),
                ]);
            }
        }

        args.push("--gzip".to_string());
        args
    }

    pub async fn create_full_dump(&self, output_dir: &Path) -> Result<DumpResult> {
        self.run(DumpMode::Full, output_dir).await
    }

    pub async fn create_incremental_dump(&self, output_dir: &Path, since: DateTime<Utc>) -> Result<DumpResult> {
        self.run(DumpMode::Incremental { since }, output_dir).await
    }

    async fn run(&self, mode: DumpMode, output_dir: &Path) -> Result<DumpResult> {
        let timestamp = Utc::now();
        let started = Instant::now();
        tokio::fs::create_dir_all(output_dir).await?;

        let args = self.build_args(mode, output_dir);
        let printable: Vec<String> = args.iter().map(|a| mask_uri(a)).collect();
        tracing::info!(mode = ?mode, output = %output_dir.display(), "Starting dump");
        tracing::debug!("Executing {} {}", self.tool, printable.join(" "));

        let output = run_tool(&self.tool, &args)
            .await
            .map_err(|e| BackupError::DumpFailed {
                exit_code: None,
                stderr: format!("failed to start {}: {}", self.tool, e),
            })?;

        if !output.success() {
            tracing::error!(exit_code = ?output.exit_code(), "Dump tool failed");
            return Err(BackupError::DumpFailed {
                exit_code: output.exit_code(),
                stderr: output.stderr_tail,
            });
        }

        let duration_seconds = started.elapsed().as_secs_f64();
        let (databases, size_bytes) = dump_metadata(output_dir.to_path_buf()).await;

        tracing::info!(
            databases = ?databases,
            size_bytes,
            duration_seconds,
            "Dump completed"
        );

        Ok(DumpResult {
            output_dir: output_dir.to_path_buf(),
            duration_seconds,
            databases,
            size_bytes,
            timestamp,
        })
    }
}

/// Extended-JSON filter selecting oplog entries at or after `since`.
fn oplog_query(since: DateTime<Utc>) -> String {
    serde_json::json!({
        "ts": { "$gte": { "$timestamp": { "t": since.timestamp(), "i": 0 } } }
    })
    .to_string()
}

/// Best effort: a failed walk degrades to `["all"]` and zero bytes.
async fn dump_metadata(dir: PathBuf) -> (Vec<String>, u64) {
    let walked = tokio::task::spawn_blocking(move || {
        let dbs = top_level_dirs(&dir)?;
        let size = calculate_total_size(&dir)?;
        Ok::<_, std::io::Error>((dbs, size))
    })
    .await;

    let (mut databases, size) = match walked {
        Ok(Ok(meta)) => meta,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Could not read dump metadata");
            (Vec::new(), 0)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Dump metadata task failed");
            (Vec::new(), 0)
        }
    };
    if databases.is_empty() {
        databases.push("all".to_string());
    }
    (databases, size)
}
