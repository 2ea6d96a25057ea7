//! Restore pipeline: download → decrypt → extract → restore tool.
//!
//! Every failure is tagged with the stage it happened in. Work files live in a
//! per-run directory under the temp dir.

pub mod tool;

use crate::archive;
use crate::crypto::Cipher;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::manifest::SharedLedger;
use crate::store::ReplicatedStore;
use crate::utils::{BackupError, Result};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tool::{RestoreMode, RestoreTool};

/// Oplog files an incremental dump may contain.
const OPLOG_FILE_NAMES: &[&str] = &["oplog.rs.bson.gz", "oplog.rs.bson"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreStage {
    Download,
    Decrypt,
    Extract,
    Restore,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreStage::Download => "download",
            RestoreStage::Decrypt => "decrypt",
            RestoreStage::Extract => "extract",
            RestoreStage::Restore => "restore",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Drop existing collections before restoring a full backup
    pub drop_existing: bool,
    /// Keep downloaded and decrypted files
    pub keep_files: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    /// Content addresses applied, in order
    pub restored: Vec<String>,
    /// Chain gaps found before replay
    pub gaps: usize,
    /// Work directory, when kept
    pub work_dir: Option<PathBuf>,
}

#[derive(Clone)]
pub struct RestorePipeline {
    store: Arc<ReplicatedStore>,
    cipher: Cipher,
    ledger: SharedLedger,
    tool: RestoreTool,
    temp_dir: PathBuf,
}

impl RestorePipeline {
    pub fn new(
        store: Arc<ReplicatedStore>,
        cipher: Cipher,
        ledger: SharedLedger,
        tool: RestoreTool,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            cipher,
            ledger,
            tool,
            temp_dir,
        }
    }

    /// Restore into a different database than the configured one.
    pub fn with_uri(&self, uri: impl Into<String>) -> Self {
        Self {
            tool: self.tool.with_uri(uri),
            ..self.clone()
        }
    }

    pub async fn download(&self, address: &str, dest: &Path) -> Result<u64> {
        self.store
            .download(address, dest)
            .await
            .map_err(|e| e.in_restore_stage(RestoreStage::Download))
    }

    pub async fn decrypt(&self, input: &Path, output: &Path) -> Result<u64> {
        self.cipher
            .decrypt(input.to_path_buf(), output.to_path_buf())
            .await
            .map_err(|e| e.in_restore_stage(RestoreStage::Decrypt))
    }

    /// Run the restore tool on an already extracted dump directory.
    pub async fn restore_directory(&self, dir: &Path, drop_existing: bool) -> Result<()> {
        self.tool
            .run(&RestoreMode::Snapshot { drop_existing }, dir)
            .await
            .map_err(|e| e.in_restore_stage(RestoreStage::Restore))
    }

    /// Full restore of a single backup.
    pub async fn restore(&self, address: &str, options: &RestoreOptions) -> Result<RestoreReport> {
        let work = self.work_dir().await?;
        let result = async {
            let dump_dir = self.fetch_and_unpack(address, &work, "snapshot").await?;
            self.restore_directory(&dump_dir, options.drop_existing).await
        }
        .await;

        let work_dir = self.finish(work, options.keep_files).await;
        result?;
        tracing::info!(address, "Restore completed");
        Ok(RestoreReport {
            restored: vec![address.to_string()],
            gaps: 0,
            work_dir,
        })
    }

    /// Restore a full backup and replay every incremental based on it.
    ///
    /// Chain gaps are reported as warnings; replay continues regardless.
    pub async fn restore_lineage(&self, full_address: &str, options: &RestoreOptions) -> Result<RestoreReport> {
        let (chain, report) = {
            let mut ledger = self.ledger.lock().await;
            ledger.load().await?;
            (ledger.lineage(full_address)?, ledger.verify_chain(full_address)?)
        };
        for gap in &report.gaps {
            tracing::warn!(
                address = %gap.content_address,
                expected = %gap.expected_start,
                actual = ?gap.actual_start,
                "Oplog chain gap; changes in this window will be missing"
            );
        }
        tracing::info!(full = full_address, incrementals = chain.len() - 1, "Restoring lineage");

        let work = self.work_dir().await?;
        let mut restored = Vec::with_capacity(chain.len());
        let result: Result<()> = async {
            for (i, record) in chain.iter().enumerate() {
                let label = format!("{:03}_{}", i, record.kind);
                let dump_dir = self.fetch_and_unpack(&record.content_address, &work, &label).await?;

                let mode = if record.is_full() {
                    RestoreMode::Snapshot {
                        drop_existing: options.drop_existing,
                    }
                } else {
                    RestoreMode::OplogReplay {
                        oplog_file: find_oplog_file(&dump_dir)
                            .map_err(|e| e.in_restore_stage(RestoreStage::Extract))?,
                    }
                };
                // Replay reads only the oplog file; give it an empty source directory
                let source = match mode {
                    RestoreMode::Snapshot { .. } => dump_dir,
                    RestoreMode::OplogReplay { .. } => {
                        let empty = work.join(format!("{}_replay", label));
                        tokio::fs::create_dir_all(&empty)
                            .await
                            .map_err(|e| BackupError::from(e).in_restore_stage(RestoreStage::Restore))?;
                        empty
                    }
                };
                self.tool
                    .run(&mode, &source)
                    .await
                    .map_err(|e| e.in_restore_stage(RestoreStage::Restore))?;
                tracing::info!(address = %record.content_address, kind = %record.kind, "Applied");
                restored.push(record.content_address.clone());
            }
            Ok(())
        }
        .await;

        let work_dir = self.finish(work, options.keep_files).await;
        result?;
        Ok(RestoreReport {
            restored,
            gaps: report.gaps.len(),
            work_dir,
        })
    }

    /// Download, decrypt and extract `address` below `work`; returns the dump directory.
    async fn fetch_and_unpack(&self, address: &str, work: &Path, label: &str) -> Result<PathBuf> {
        let encrypted = work.join(format!("{}.tar.zst.enc", label));
        let compressed = work.join(format!("{}.tar.zst", label));
        let extracted = work.join(label);

        tracing::info!(address, "Step 1/4: downloading");
        self.download(address, &encrypted).await?;
        tracing::info!(address, "Step 2/4: decrypting");
        self.decrypt(&encrypted, &compressed).await?;
        tracing::info!(address, "Step 3/4: extracting");
        archive::extract(compressed, extracted.clone())
            .await
            .map_err(|e| e.in_restore_stage(RestoreStage::Extract))?;
        tracing::info!(address, "Step 4/4: restoring");
        Ok(extracted)
    }

    async fn work_dir(&self) -> Result<PathBuf> {
        let dir = self
            .temp_dir
            .join(format!("restore_{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove the work directory unless it should be kept; returns it when kept.
    async fn finish(&self, work: PathBuf, keep_files: bool) -> Option<PathBuf> {
        if keep_files {
            tracing::info!(path = %work.display(), "Keeping restore work files");
            return Some(work);
        }
        if let Err(e) = tokio::fs::remove_dir_all(&work).await {
            let err = BackupError::Cleanup(format!("{}: {}", work.display(), e));
            tracing::warn!(error = %err, "Could not remove restore work files");
        }
        None
    }
}

/// Locate the oplog file inside an extracted incremental dump.
fn find_oplog_file(dump_dir: &Path) -> Result<PathBuf> {
    walk_directory(dump_dir, &WalkOptions::files_only())?
        .into_iter()
        .find(|f| {
            f.path
                .file_name()
                .is_some_and(|n| OPLOG_FILE_NAMES.iter().any(|o| n == *o))
        })
        .map(|f| f.path)
        .ok_or_else(|| {
            BackupError::Archive(format!("no oplog file found in {}", dump_dir.display()))
        })
}
