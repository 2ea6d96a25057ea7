//! Retention sweeper: expires remote backups and bounds local disk usage.
//!
//! Remote and local horizons are independent. Each expired record is handled
//! on its own, so one failing record never blocks the rest of the sweep.

use crate::fs::metadata::FileMetadata;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::manifest::{BackupFilter, BackupRecord, ManifestLedger, SharedLedger};
use crate::notify::{NotificationEvent, Notifier};
use crate::store::ReplicatedStore;
use crate::transfer::format_bytes;
use crate::utils::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Step of the sweep an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SweepStep {
    Unpin,
    LocalDelete,
    ManifestRemove,
    LocalSweep,
    Publish,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_address: Option<String>,
    pub step: SweepStep,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub deleted_count: usize,
    pub freed_bytes: u64,
    pub local_deleted: usize,
    pub local_freed_bytes: u64,
    pub errors: Vec<SweepError>,
}

impl SweepReport {
    fn error(&mut self, content_address: Option<&str>, step: SweepStep, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(address = ?content_address, step = ?step, "{}", message);
        self.errors.push(SweepError {
            content_address: content_address.map(str::to_string),
            step,
            message,
        });
    }
}

pub struct RetentionSweeper {
    store: Arc<ReplicatedStore>,
    ledger: SharedLedger,
    notifier: Notifier,
    storage_dir: PathBuf,
    retention_days: u32,
    local_retention_days: u32,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<ReplicatedStore>,
        ledger: SharedLedger,
        notifier: Notifier,
        storage_dir: PathBuf,
        retention_days: u32,
        local_retention_days: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
            storage_dir,
            retention_days,
            local_retention_days,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        tracing::info!(
            retention_days = self.retention_days,
            local_retention_days = self.local_retention_days,
            "Starting retention sweep"
        );
        let mut report = SweepReport::default();
        let mut ledger = self.ledger.lock().await;

        ledger.load().await?;
        let expired = ledger.query(&BackupFilter::older_than_days(self.retention_days));
        if expired.is_empty() {
            tracing::info!("No backups past the retention horizon");
        } else {
            tracing::info!(count = expired.len(), "Expiring backups");
        }

        for record in &expired {
            self.expire(&mut ledger, record, &mut report).await;
        }

        let reclaimed = self.sweep_local(&mut report).await;
        if let Err(e) = ledger.forget_local_copies(&reclaimed).await {
            report.error(None, SweepStep::LocalSweep, e.to_string());
        }

        if let Err(e) = ledger.publish().await {
            report.error(None, SweepStep::Publish, e.to_string());
        }
        drop(ledger);

        tracing::info!(
            deleted = report.deleted_count,
            freed = %format_bytes(report.freed_bytes),
            local_deleted = report.local_deleted,
            local_freed = %format_bytes(report.local_freed_bytes),
            errors = report.errors.len(),
            "Retention sweep completed"
        );
        self.notifier
            .send(NotificationEvent::retention_completed(
                report.deleted_count,
                report.freed_bytes,
            ))
            .await;

        Ok(report)
    }

    /// Unpin, delete the local copy and drop the record. Each step runs
    /// regardless of the others; failures go into the report.
    async fn expire(&self, ledger: &mut ManifestLedger, record: &BackupRecord, report: &mut SweepReport) {
        let address = record.content_address.as_str();

        let failed: Vec<String> = self
            .store
            .unpin(address)
            .await
            .into_iter()
            .filter(|r| !r.success)
            .map(|r| format!("{}: {}", r.endpoint, r.error.unwrap_or_default()))
            .collect();
        if !failed.is_empty() {
            report.error(
                Some(address),
                SweepStep::Unpin,
                format!("unpin failed on {}", failed.join("; ")),
            );
        }

        if let Some(path) = &record.local_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "Deleted local backup file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => report.error(
                    Some(address),
                    SweepStep::LocalDelete,
                    format!("cannot delete {}: {}", path.display(), e),
                ),
            }
        }

        match ledger.remove(address).await {
            Ok(_) => {
                report.deleted_count += 1;
                report.freed_bytes += record.size_bytes;
            }
            Err(e) => report.error(Some(address), SweepStep::ManifestRemove, e.to_string()),
        }
    }

    /// Delete regular files in the storage directory older than the local horizon.
    async fn sweep_local(&self, report: &mut SweepReport) -> Vec<PathBuf> {
        let cutoff = Utc::now() - Duration::days(i64::from(self.local_retention_days));
        let dir = self.storage_dir.clone();

        let scanned = tokio::task::spawn_blocking(move || local_candidates(&dir, cutoff)).await;
        let candidates = match scanned {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                report.error(None, SweepStep::LocalSweep, format!("cannot scan storage directory: {}", e));
                return Vec::new();
            }
            Err(e) => {
                report.error(None, SweepStep::LocalSweep, format!("scan task failed: {}", e));
                return Vec::new();
            }
        };

        let mut reclaimed = Vec::new();
        for (path, size) in candidates {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Deleted old local file");
                    report.local_deleted += 1;
                    report.local_freed_bytes += size;
                    reclaimed.push(path);
                }
                Err(e) => report.error(
                    None,
                    SweepStep::LocalSweep,
                    format!("cannot delete {}: {}", path.display(), e),
                ),
            }
        }
        reclaimed
    }
}

/// Top-level regular files older than `cutoff`, never the manifest.
fn local_candidates(dir: &Path, cutoff: chrono::DateTime<Utc>) -> std::io::Result<Vec<(PathBuf, u64)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let options = WalkOptions {
        include_dirs: false,
        max_depth: Some(1),
    };
    let mut candidates = Vec::new();
    for entry in walk_directory(dir, &options)? {
        let name = entry.relative_path.to_string_lossy();
        if ManifestLedger::is_manifest_file(&name) {
            continue;
        }
        let meta = FileMetadata::from_path(&entry.path)?;
        if meta.is_file && meta.modified_before(cutoff) {
            candidates.push((entry.path, meta.size));
        }
    }
    Ok(candidates)
}
