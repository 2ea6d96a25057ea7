//! Backup orchestration: dump, compress, encrypt, replicate and record.
//!
//! A run walks `Init → Dumped → Compressed → Encrypted → [Mirrored] →
//! Uploaded → ManifestUpdated → ManifestPublished → Done`. Any failure ends
//! in `Failed`, removes every artifact the run created and sends a failure
//! notification before the error is returned.

pub mod mirror;

use crate::archive;
use crate::config::Config;
use crate::crypto::Cipher;
use crate::dump::DumpProducer;
use crate::manifest::{BackupKind, BackupRecord, ManifestLedger, SharedLedger};
use crate::notify::{NotificationEvent, Notifier};
use crate::store::ReplicatedStore;
use crate::transfer::{format_bytes, format_duration};
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use mirror::SecondaryMirror;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Position of a run in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Dumped,
    Compressed,
    Encrypted,
    Mirrored,
    Uploaded,
    ManifestUpdated,
    ManifestPublished,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Dumped => "dumped",
            Stage::Compressed => "compressed",
            Stage::Encrypted => "encrypted",
            Stage::Mirrored => "mirrored",
            Stage::Uploaded => "uploaded",
            Stage::ManifestUpdated => "manifest-updated",
            Stage::ManifestPublished => "manifest-published",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub content_address: String,
    pub size_bytes: u64,
    pub duration_seconds: f64,
}

/// Files and directories created by a run.
#[derive(Debug, Default)]
struct RunArtifacts {
    dump_dir: Option<PathBuf>,
    compressed: Option<PathBuf>,
    encrypted: Option<PathBuf>,
}

impl RunArtifacts {
    /// Remove the intermediates, keeping the encrypted archive.
    async fn cleanup_temp(&self) {
        remove_path(self.dump_dir.as_deref()).await;
        remove_path(self.compressed.as_deref()).await;
    }

    async fn cleanup_all(&self) {
        self.cleanup_temp().await;
        remove_path(self.encrypted.as_deref()).await;
    }
}

/// Cleanup failures are logged and never replace the run's own error.
async fn remove_path(path: Option<&Path>) {
    let Some(path) = path else { return };
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "Cleaned up"),
        Err(e) => {
            let err = BackupError::Cleanup(format!("{}: {}", path.display(), e));
            tracing::warn!(error = %err, "Cleanup failed");
        }
    }
}

/// Where an incremental's oplog window starts.
struct IncrementalBase {
    full_address: String,
    since: DateTime<Utc>,
}

pub struct BackupOrchestrator {
    dumper: DumpProducer,
    cipher: Cipher,
    store: Arc<ReplicatedStore>,
    ledger: SharedLedger,
    notifier: Notifier,
    mirror: Option<SecondaryMirror>,
    temp_dir: PathBuf,
    storage_dir: PathBuf,
    compression_level: i32,
    replica_set: Option<String>,
}

impl BackupOrchestrator {
    pub fn new(
        config: &Config,
        dumper: DumpProducer,
        cipher: Cipher,
        store: Arc<ReplicatedStore>,
        ledger: SharedLedger,
        notifier: Notifier,
    ) -> Self {
        Self {
            dumper,
            cipher,
            store,
            ledger,
            notifier,
            mirror: config.storage.mirror_dir.clone().map(SecondaryMirror::new),
            temp_dir: config.storage.temp_dir.clone(),
            storage_dir: config.storage.storage_dir.clone(),
            compression_level: config.storage.compression_level,
            replica_set: replica_set_from_uri(&config.database.uri),
        }
    }

    pub async fn run_full(&self) -> Result<BackupOutcome> {
        self.run(BackupKind::Full).await
    }

    /// Requires a full backup in the manifest; fails with `NoBaseBackup` before dumping otherwise.
    pub async fn run_incremental(&self) -> Result<BackupOutcome> {
        self.run(BackupKind::Incremental).await
    }

    pub async fn run(&self, kind: BackupKind) -> Result<BackupOutcome> {
        tracing::info!("=== Starting {} backup ===", kind);
        let mut artifacts = RunArtifacts::default();
        let mut stage = Stage::Init;

        match self.execute(kind, &mut artifacts, &mut stage).await {
            Ok(outcome) => {
                advance(&mut stage, Stage::Done);
                tracing::info!(
                    address = %outcome.content_address,
                    size = %format_bytes(outcome.size_bytes),
                    duration = %format_duration(outcome.duration_seconds),
                    "=== {} backup completed ===",
                    kind
                );
                self.notifier
                    .send(NotificationEvent::backup_succeeded(
                        kind,
                        &outcome.content_address,
                        outcome.size_bytes,
                        outcome.duration_seconds,
                    ))
                    .await;
                artifacts.cleanup_temp().await;
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(stage = %stage, error = %e, "=== {} backup failed ===", kind);
                stage = Stage::Failed;
                tracing::debug!(stage = %stage, "Run aborted");
                self.notifier.send(NotificationEvent::backup_failed(kind, &e)).await;
                artifacts.cleanup_all().await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        kind: BackupKind,
        artifacts: &mut RunArtifacts,
        stage: &mut Stage,
    ) -> Result<BackupOutcome> {
        let started = Instant::now();

        let base = match kind {
            BackupKind::Full => None,
            BackupKind::Incremental => Some(self.incremental_base().await?),
        };

        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%6fZ");
        let name = format!("{}_backup_{}", kind, stamp);

        let dump_dir = self.temp_dir.join(&name);
        artifacts.dump_dir = Some(dump_dir.clone());
        let dump = match &base {
            None => self.dumper.create_full_dump(&dump_dir).await?,
            Some(base) => self.dumper.create_incremental_dump(&dump_dir, base.since).await?,
        };
        advance(stage, Stage::Dumped);

        let compressed = self.temp_dir.join(format!("{}.tar.zst", name));
        artifacts.compressed = Some(compressed.clone());
        archive::compress(dump_dir, compressed.clone(), self.compression_level).await?;
        advance(stage, Stage::Compressed);

        let encrypted = self.storage_dir.join(format!("{}.tar.zst.enc", name));
        artifacts.encrypted = Some(encrypted.clone());
        let size_bytes = self.cipher.encrypt(compressed, encrypted.clone()).await?;
        tracing::info!(size = %format_bytes(size_bytes), "Backup encrypted");
        advance(stage, Stage::Encrypted);

        if let Some(mirror) = &self.mirror {
            match mirror.copy(&encrypted).await {
                Ok(copy) => tracing::info!(path = %copy.display(), "Secondary copy written"),
                Err(e) => tracing::warn!(error = %e, "Secondary copy failed, continuing"),
            }
            advance(stage, Stage::Mirrored);
        }

        let upload = self.store.upload(&encrypted).await?;
        advance(stage, Stage::Uploaded);

        let record = BackupRecord {
            kind,
            content_address: upload.content_address.clone(),
            created_at: dump.timestamp,
            size_bytes,
            duration_seconds: started.elapsed().as_secs_f64(),
            databases: dump.databases,
            encrypted: true,
            replica_set: self.replica_set.clone(),
            local_path: Some(encrypted),
            base_backup_address: base.as_ref().map(|b| b.full_address.clone()),
            oplog_range_start: base.as_ref().map(|b| b.since),
            oplog_range_end: base.as_ref().map(|_| dump.timestamp),
        };
        let duration_seconds = record.duration_seconds;

        let mut ledger = self.ledger.lock().await;
        if let Err(e) = record_and_publish(&mut ledger, record, stage).await {
            self.roll_back(&mut ledger, &upload.content_address, *stage).await;
            return Err(e);
        }

        Ok(BackupOutcome {
            kind,
            content_address: upload.content_address,
            size_bytes,
            duration_seconds,
        })
    }

    /// Undo an upload the manifest does not (durably) describe: drop the
    /// record if it was appended and release the pins.
    async fn roll_back(&self, ledger: &mut ManifestLedger, address: &str, stage: Stage) {
        if stage == Stage::ManifestUpdated {
            match ledger.remove(address).await {
                Ok(_) => tracing::info!(address, "Removed unpublished record from manifest"),
                Err(e) => tracing::error!(address, error = %e, "Could not remove unpublished record"),
            }
        }
        for result in self.store.unpin(address).await.into_iter().filter(|r| !r.success) {
            tracing::warn!(
                address,
                endpoint = %result.endpoint,
                error = ?result.error,
                "Could not release pin of failed run"
            );
        }
    }

    /// The latest full backup and where the next oplog window starts.
    async fn incremental_base(&self) -> Result<IncrementalBase> {
        let mut ledger = self.ledger.lock().await;
        ledger.load().await?;
        let full = ledger.latest_full().ok_or(BackupError::NoBaseBackup)?;
        let since = ledger
            .latest_in_lineage(&full.content_address)
            .and_then(|inc| inc.oplog_range_end)
            .unwrap_or(full.created_at);
        tracing::info!(base = %full.content_address, since = %since, "Incremental window");
        Ok(IncrementalBase {
            full_address: full.content_address,
            since,
        })
    }
}

async fn record_and_publish(ledger: &mut ManifestLedger, record: BackupRecord, stage: &mut Stage) -> Result<()> {
    ledger.append(record).await?;
    advance(stage, Stage::ManifestUpdated);
    ledger.publish().await?;
    advance(stage, Stage::ManifestPublished);
    Ok(())
}

fn advance(stage: &mut Stage, next: Stage) {
    tracing::info!(from = %stage, to = %next, "Stage transition");
    *stage = next;
}

/// `replicaSet` query parameter of a MongoDB URI.
fn replica_set_from_uri(uri: &str) -> Option<String> {
    let (_, query) = uri.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "replicaSet")
        .map(|(_, value)| value.to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::archive::extract_archive;
    use crate::crypto::EncryptionKey;
    use crate::dump::testing::{fake_mongodump, write_script};
    use crate::manifest::BackupFilter;
    use crate::notify::testing::RecordingSink;
    use crate::notify::NotificationType;
    use crate::store::testing::{memory_store, MemoryEndpoint};
    use crate::store::StoreEndpoint;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        tmp: TempDir,
        config: Config,
        store: Arc<ReplicatedStore>,
        nodes: Vec<Arc<MemoryEndpoint>>,
        ledger: SharedLedger,
        sink: Arc<RecordingSink>,
        cipher: Cipher,
    }

    impl Harness {
        async fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let mut config = Config::default();
            config.database.uri = "mongodb://backup:pw@db1:27017/?replicaSet=rs0".to_string();
            config.database.dump_tool = fake_mongodump(tmp.path()).to_string_lossy().into_owned();
            config.storage.temp_dir = tmp.path().join("temp");
            config.storage.storage_dir = tmp.path().join("storage");
            config.ensure_dirs().unwrap();

            let (store, nodes) = memory_store(3, 2);
            let store = Arc::new(store);
            let ledger = ManifestLedger::open(&config.storage.storage_dir, store.clone())
                .await
                .unwrap()
                .into_shared();
            Self {
                tmp,
                config,
                store,
                nodes,
                ledger,
                sink: Arc::new(RecordingSink::default()),
                cipher: Cipher::new(EncryptionKey::from_bytes([5u8; 32])),
            }
        }

        fn orchestrator(&self) -> BackupOrchestrator {
            BackupOrchestrator::new(
                &self.config,
                DumpProducer::from_config(&self.config.database),
                self.cipher.clone(),
                self.store.clone(),
                self.ledger.clone(),
                Notifier::with_sink(self.sink.clone()),
            )
        }

        fn dir_entries(&self, dir: &Path) -> Vec<String> {
            std::fs::read_dir(dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        }

        fn dump_calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.tmp.path().join("mongodump.calls"))
                .map(|s| s.lines().map(str::to_string).collect())
                .unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn test_full_then_incremental() {
        let h = Harness::new().await;
        let orchestrator = h.orchestrator();

        let full = orchestrator.run_full().await.unwrap();
        let incremental = orchestrator.run_incremental().await.unwrap();

        let ledger = h.ledger.lock().await;
        let fulls = ledger.query(&BackupFilter::kind(BackupKind::Full));
        let incs = ledger.query(&BackupFilter::kind(BackupKind::Incremental));
        assert_eq!(fulls.len(), 1);
        assert_eq!(incs.len(), 1);

        let full_record = &fulls[0];
        assert_eq!(full_record.content_address, full.content_address);
        assert_eq!(full_record.databases, vec!["admin", "shop"]);
        assert_eq!(full_record.replica_set.as_deref(), Some("rs0"));
        let local = full_record.local_path.clone().unwrap();
        assert_eq!(std::fs::metadata(&local).unwrap().len(), full_record.size_bytes);
        assert_eq!(full.size_bytes, full_record.size_bytes);

        let inc_record = &incs[0];
        assert_eq!(inc_record.base_backup_address.as_deref(), Some(full.content_address.as_str()));
        assert_eq!(inc_record.content_address, incremental.content_address);
        assert_eq!(inc_record.oplog_range_start, Some(full_record.created_at));
        assert_eq!(inc_record.oplog_range_end, Some(inc_record.created_at));

        // Intermediates gone, encrypted archives and manifest kept
        assert!(h.dir_entries(&h.config.storage.temp_dir).is_empty());
        let stored = h.dir_entries(&h.config.storage.storage_dir);
        assert_eq!(stored.iter().filter(|n| n.ends_with(".tar.zst.enc")).count(), 2);
        assert!(stored.contains(&"manifest.json".to_string()));

        // Manifest published and pinned
        let manifest_address = ledger.manifest().manifest_content_address.clone().unwrap();
        assert!(h.nodes.iter().all(|n| n.has_pin(&manifest_address)));

        let calls = h.dump_calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].contains("oplog.rs"));
        assert!(calls[1].contains("--collection oplog.rs"));

        let events = h.sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == NotificationType::Success));
    }

    #[tokio::test]
    async fn test_encrypted_archive_restores_dump() {
        let h = Harness::new().await;
        h.orchestrator().run_full().await.unwrap();

        let record = h.ledger.lock().await.latest_full().unwrap();
        let work = h.tmp.path().join("check");
        std::fs::create_dir_all(&work).unwrap();
        let archive_path = work.join("backup.tar.zst");
        h.cipher
            .decrypt_file(&record.local_path.unwrap(), &archive_path)
            .unwrap();
        extract_archive(&archive_path, &work.join("dump")).unwrap();
        assert_eq!(
            std::fs::read(work.join("dump/shop/orders.bson.gz")).unwrap(),
            b"orders-data"
        );
    }

    #[tokio::test]
    async fn test_second_incremental_continues_the_window() {
        let h = Harness::new().await;
        let orchestrator = h.orchestrator();
        orchestrator.run_full().await.unwrap();
        let first = orchestrator.run_incremental().await.unwrap();
        let second = orchestrator.run_incremental().await.unwrap();

        let ledger = h.ledger.lock().await;
        let full = ledger.latest_full().unwrap();
        let first = ledger.manifest().find(&first.content_address).unwrap().clone();
        let second = ledger.manifest().find(&second.content_address).unwrap().clone();
        assert_eq!(second.oplog_range_start, first.oplog_range_end);
        assert!(ledger.verify_chain(&full.content_address).unwrap().is_contiguous());
    }

    #[tokio::test]
    async fn test_incremental_without_full_never_dumps() {
        let h = Harness::new().await;

        let err = h.orchestrator().run_incremental().await.unwrap_err();
        assert!(matches!(err, BackupError::NoBaseBackup));
        assert!(h.dir_entries(&h.config.storage.temp_dir).is_empty());
        assert!(h.dump_calls().is_empty());

        let events = h.sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, NotificationType::Failure);
    }

    #[tokio::test]
    async fn test_replication_failure_cleans_up_every_artifact() {
        let h = Harness::new().await;
        h.nodes[1].fail_pins.store(true, Ordering::SeqCst);
        h.nodes[2].fail_pins.store(true, Ordering::SeqCst);

        let err = h.orchestrator().run_full().await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::InsufficientReplication { required: 2, achieved: 1 }
        ));
        assert!(h.dir_entries(&h.config.storage.temp_dir).is_empty());
        assert!(h.dir_entries(&h.config.storage.storage_dir).is_empty());
        assert!(h.ledger.lock().await.manifest().backups.is_empty());
        assert_eq!(h.sink.events.lock().unwrap()[0].kind, NotificationType::Failure);
    }

    #[tokio::test]
    async fn test_publish_failure_rolls_back_record_and_pins() {
        let mut h = Harness::new().await;
        // Manifest publishing needs all three nodes; the archive needs two
        let endpoints = h
            .nodes
            .iter()
            .map(|n| n.clone() as Arc<dyn StoreEndpoint>)
            .collect();
        let strict = ReplicatedStore::new(endpoints, 3, Duration::from_millis(500), Duration::from_millis(500))
            .unwrap();
        h.ledger = ManifestLedger::open(&h.config.storage.storage_dir, Arc::new(strict))
            .await
            .unwrap()
            .into_shared();
        h.nodes[2].fail_pins.store(true, Ordering::SeqCst);

        let err = h.orchestrator().run_full().await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::InsufficientReplication { required: 3, achieved: 2 }
        ));

        let mut ledger = h.ledger.lock().await;
        ledger.load().await.unwrap();
        assert!(ledger.manifest().backups.is_empty());
        assert!(ledger.latest_full().is_none());
        drop(ledger);

        let stored = h.dir_entries(&h.config.storage.storage_dir);
        assert!(!stored.iter().any(|n| n.ends_with(".tar.zst.enc")), "{stored:?}");
        assert!(h.dir_entries(&h.config.storage.temp_dir).is_empty());
        assert_eq!(h.sink.events.lock().unwrap()[0].kind, NotificationType::Failure);

        // Only the unpublished manifest blob stays pinned; the archive pins are released
        let first = h.nodes[0].pinned();
        assert_eq!(first.len(), 1, "{first:?}");
        assert_eq!(h.nodes[1].pinned(), first);
        assert!(h.nodes[2].pinned().is_empty());

        // The incremental that follows has no base to build on
        let err = h.orchestrator().run_incremental().await.unwrap_err();
        assert!(matches!(err, BackupError::NoBaseBackup));
    }

    #[tokio::test]
    async fn test_dump_failure_removes_partial_dump() {
        let mut h = Harness::new().await;
        let tool = write_script(
            h.tmp.path(),
            "broken-mongodump",
            r#"while [ $# -gt 0 ]; do if [ "$1" = "--out" ]; then mkdir -p "$2/shop"; fi; shift; done
echo "Failed: connection refused" >&2
exit 2"#,
        );
        h.config.database.dump_tool = tool.to_string_lossy().into_owned();

        let err = h.orchestrator().run_full().await.unwrap_err();
        assert!(matches!(err, BackupError::DumpFailed { exit_code: Some(2), .. }));
        assert!(h.dir_entries(&h.config.storage.temp_dir).is_empty());
    }

    #[tokio::test]
    async fn test_mirror_failure_does_not_abort() {
        let mut h = Harness::new().await;
        let blocker = h.tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        h.config.storage.mirror_dir = Some(blocker.join("mirror"));

        assert!(h.orchestrator().run_full().await.is_ok());
    }

    #[tokio::test]
    async fn test_mirror_receives_copy() {
        let mut h = Harness::new().await;
        let mirror_dir = h.tmp.path().join("mirror");
        h.config.storage.mirror_dir = Some(mirror_dir.clone());

        h.orchestrator().run_full().await.unwrap();
        let mirrored = h.dir_entries(&mirror_dir);
        assert_eq!(mirrored.len(), 1);
        assert!(mirrored[0].starts_with("full_backup_"));
    }

    #[test]
    fn test_replica_set_from_uri() {
        assert_eq!(
            replica_set_from_uri("mongodb://a,b/?replicaSet=rs0&tls=true").as_deref(),
            Some("rs0")
        );
        assert_eq!(replica_set_from_uri("mongodb://a/db"), None);
    }
}
