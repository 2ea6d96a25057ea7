//! Persistence, mutation and queries over the manifest file.

use super::model::{BackupFilter, BackupKind, BackupRecord, Manifest, ManifestStatistics};
use crate::store::ReplicatedStore;
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
const MANIFEST_TEMP_SUFFIX: &str = ".tmp";

/// The single in-process owner of the manifest.
pub type SharedLedger = Arc<Mutex<ManifestLedger>>;

/// A break in an oplog chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainGap {
    /// Incremental whose window does not start where the previous one ended
    pub content_address: String,
    pub expected_start: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub full_address: String,
    pub incrementals: usize,
    pub gaps: Vec<ChainGap>,
}

impl ChainReport {
    pub fn is_contiguous(&self) -> bool {
        self.gaps.is_empty()
    }
}

pub struct ManifestLedger {
    path: PathBuf,
    manifest: Manifest,
    store: Arc<ReplicatedStore>,
}

impl ManifestLedger {
    /// Open the ledger in `storage_dir`, creating an empty manifest in memory if none exists.
    pub async fn open(storage_dir: &Path, store: Arc<ReplicatedStore>) -> Result<Self> {
        let mut ledger = Self {
            path: storage_dir.join(MANIFEST_FILE_NAME),
            manifest: Manifest::empty(),
            store,
        };
        ledger.load().await?;
        Ok(ledger)
    }

    pub fn into_shared(self) -> SharedLedger {
        Arc::new(Mutex::new(self))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// True for the manifest file and its temporary write file.
    pub fn is_manifest_file(name: &str) -> bool {
        name == MANIFEST_FILE_NAME || name == format!("{}{}", MANIFEST_FILE_NAME, MANIFEST_TEMP_SUFFIX)
    }

    /// Reload from disk. A missing file yields an empty manifest.
    pub async fn load(&mut self) -> Result<&Manifest> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                self.manifest = serde_json::from_str(&content).map_err(|e| {
                    BackupError::ManifestIo(format!("cannot parse {}: {}", self.path.display(), e))
                })?;
                tracing::debug!(backups = self.manifest.backups.len(), "Manifest loaded");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.manifest = Manifest::empty();
                tracing::debug!(path = %self.path.display(), "No manifest on disk, starting empty");
            }
            Err(e) => {
                return Err(BackupError::ManifestIo(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        }
        Ok(&self.manifest)
    }

    /// Write to a temporary file and rename it over the manifest.
    pub async fn save(&mut self) -> Result<()> {
        self.manifest.last_updated = Utc::now();
        self.manifest.statistics = ManifestStatistics::from_records(&self.manifest.backups);

        let json = serde_json::to_vec_pretty(&self.manifest)?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(MANIFEST_TEMP_SUFFIX);
        let tmp = PathBuf::from(tmp_name);

        let write = async {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        write.await.map_err(|e| {
            BackupError::ManifestIo(format!("cannot write {}: {}", self.path.display(), e))
        })?;

        tracing::debug!(backups = self.manifest.backups.len(), "Manifest saved");
        Ok(())
    }

    /// Save, upload and pin the manifest, then record its own address.
    pub async fn publish(&mut self) -> Result<String> {
        self.save().await?;
        let outcome = self.store.upload(&self.path).await?;
        self.manifest.manifest_content_address = Some(outcome.content_address.clone());
        self.save().await?;
        tracing::info!(address = %outcome.content_address, "Manifest published");
        Ok(outcome.content_address)
    }

    /// Add a record. Incrementals must reference a full record already present.
    pub async fn append(&mut self, record: BackupRecord) -> Result<()> {
        self.load().await?;

        if self.manifest.find(&record.content_address).is_some() {
            return Err(BackupError::ManifestIo(format!(
                "backup {} is already recorded",
                record.content_address
            )));
        }
        if record.kind == BackupKind::Incremental {
            let base_is_full = record
                .base_backup_address
                .as_deref()
                .and_then(|base| self.manifest.find(base))
                .is_some_and(|base| base.is_full());
            if !base_is_full {
                return Err(BackupError::NoBaseBackup);
            }
        }

        tracing::info!(kind = %record.kind, address = %record.content_address, "Backup added to manifest");
        self.manifest.backups.push(record);
        self.save().await
    }

    /// Remove a record. Unknown addresses are a no-op returning `None`.
    pub async fn remove(&mut self, address: &str) -> Result<Option<BackupRecord>> {
        self.load().await?;

        let Some(index) = self
            .manifest
            .backups
            .iter()
            .position(|b| b.content_address == address)
        else {
            tracing::warn!(address, "Backup not found in manifest");
            return Ok(None);
        };

        let removed = self.manifest.backups.remove(index);
        self.save().await?;
        tracing::info!(address, kind = %removed.kind, "Backup removed from manifest");
        Ok(Some(removed))
    }

    /// Clear `localPath` on records whose local copy was reclaimed.
    pub async fn forget_local_copies(&mut self, reclaimed: &[PathBuf]) -> Result<usize> {
        if reclaimed.is_empty() {
            return Ok(0);
        }
        self.load().await?;

        let mut cleared = 0;
        for record in &mut self.manifest.backups {
            if record
                .local_path
                .as_ref()
                .is_some_and(|p| reclaimed.contains(p))
            {
                record.local_path = None;
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.save().await?;
        }
        Ok(cleared)
    }

    /// Matching records, newest first.
    pub fn query(&self, filter: &BackupFilter) -> Vec<BackupRecord> {
        let mut records: Vec<BackupRecord> = self
            .manifest
            .backups
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn latest_full(&self) -> Option<BackupRecord> {
        self.query(&BackupFilter::kind(BackupKind::Full)).into_iter().next()
    }

    pub fn statistics(&self) -> ManifestStatistics {
        ManifestStatistics::from_records(&self.manifest.backups)
    }

    /// The full record followed by its incrementals in oplog order.
    pub fn lineage(&self, full_address: &str) -> Result<Vec<BackupRecord>> {
        let full = self
            .manifest
            .find(full_address)
            .filter(|r| r.is_full())
            .ok_or_else(|| {
                BackupError::ManifestIo(format!("no full backup with address {}", full_address))
            })?;

        let mut incrementals: Vec<BackupRecord> = self
            .manifest
            .backups
            .iter()
            .filter(|r| r.base_backup_address.as_deref() == Some(full_address))
            .cloned()
            .collect();
        incrementals.sort_by_key(|r| r.oplog_range_start.unwrap_or(r.created_at));

        let mut chain = Vec::with_capacity(incrementals.len() + 1);
        chain.push(full.clone());
        chain.extend(incrementals);
        Ok(chain)
    }

    /// Report every incremental whose window does not start where the previous ended.
    pub fn verify_chain(&self, full_address: &str) -> Result<ChainReport> {
        let chain = self.lineage(full_address)?;
        let mut expected = chain[0].created_at;
        let mut gaps = Vec::new();

        for record in &chain[1..] {
            if record.oplog_range_start != Some(expected) {
                gaps.push(ChainGap {
                    content_address: record.content_address.clone(),
                    expected_start: expected,
                    actual_start: record.oplog_range_start,
                });
            }
            expected = record.oplog_range_end.unwrap_or(record.created_at);
        }

        Ok(ChainReport {
            full_address: full_address.to_string(),
            incrementals: chain.len() - 1,
            gaps,
        })
    }

    /// Newest incremental based on `full_address`, if any.
    pub fn latest_in_lineage(&self, full_address: &str) -> Option<BackupRecord> {
        self.lineage(full_address)
            .ok()?
            .into_iter()
            .skip(1)
            .max_by_key(|r| r.oplog_range_end.unwrap_or(r.created_at))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::store::testing::memory_store;
    use tempfile::TempDir;

    async fn ledger(dir: &TempDir) -> ManifestLedger {
        let (store, _) = memory_store(2, 2);
        ManifestLedger::open(dir.path(), Arc::new(store)).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_without_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir).await;
        assert!(ledger.manifest().backups.is_empty());
        assert_eq!(ledger.manifest().version, "1.0");
        assert!(!ledger.path().exists());
        assert!(ledger.latest_full().is_none());
    }

    #[tokio::test]
    async fn test_append_persists_atomically() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir).await;
        ledger
            .append(full_record("bafyfull1", "2024-01-01T00:00:00Z", 100))
            .await
            .unwrap();

        assert!(ledger.path().exists());
        assert!(!dir.path().join("manifest.json.tmp").exists());

        let on_disk: serde_json::Value =
            serde_json::from_slice(&std::fs::read(ledger.path()).unwrap()).unwrap();
        assert_eq!(on_disk["backups"][0]["contentAddress"], "bafyfull1");
        assert_eq!(on_disk["statistics"]["totalBackups"], 1);
    }

    #[tokio::test]
    async fn test_append_rejects_duplicates_and_orphans() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir).await;
        let full = full_record("bafyfull1", "2024-01-01T00:00:00Z", 100);
        ledger.append(full.clone()).await.unwrap();

        assert!(matches!(ledger.append(full).await, Err(BackupError::ManifestIo(_))));

        let orphan = incremental_record("bafyinc1", "bafymissing", "2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z");
        assert!(matches!(ledger.append(orphan).await, Err(BackupError::NoBaseBackup)));

        let mut no_base = incremental_record("bafyinc2", "bafyfull1", "2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z");
        no_base.base_backup_address = None;
        assert!(matches!(ledger.append(no_base).await, Err(BackupError::NoBaseBackup)));
        assert_eq!(ledger.manifest().backups.len(), 1);
    }

    #[tokio::test]
    async fn test_append_reloads_changes_made_by_another_writer() {
        let dir = TempDir::new().unwrap();
        let mut first = ledger(&dir).await;
        let mut second = ledger(&dir).await;

        first.append(full_record("bafya", "2024-01-01T00:00:00Z", 1)).await.unwrap();
        second.append(full_record("bafyb", "2024-01-02T00:00:00Z", 2)).await.unwrap();

        first.load().await.unwrap();
        assert_eq!(first.manifest().backups.len(), 2);
    }

    #[tokio::test]
    async fn test_statistics() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir).await;
        ledger.append(full_record("bafy2", "2024-01-02T00:00:00Z", 200)).await.unwrap();
        ledger.append(full_record("bafy1", "2024-01-01T00:00:00Z", 100)).await.unwrap();
        ledger.append(full_record("bafy3", "2024-01-03T00:00:00Z", 300)).await.unwrap();

        let stats = ledger.statistics();
        assert_eq!(stats.total_backups, 3);
        assert_eq!(stats.total_size, 600);
        assert_eq!(stats.oldest, Some("2024-01-01T00:00:00Z".parse().unwrap()));
        assert_eq!(stats.newest, Some("2024-01-03T00:00:00Z".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_query_filters_and_orders_newest_first() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir).await;
        ledger.append(full_record("bafyf1", "2024-01-01T00:00:00Z", 1)).await.unwrap();
        ledger.append(full_record("bafyf2", "2024-01-08T00:00:00Z", 1)).await.unwrap();
        ledger
            .append(incremental_record("bafyi1", "bafyf2", "2024-01-08T00:00:00Z", "2024-01-09T00:00:00Z"))
            .await
            .unwrap();

        let all: Vec<_> = ledger
            .query(&BackupFilter::default())
            .into_iter()
            .map(|r| r.content_address)
            .collect();
        assert_eq!(all, vec!["bafyi1", "bafyf2", "bafyf1"]);

        let fulls = ledger.query(&BackupFilter::kind(BackupKind::Full));
        assert_eq!(fulls.len(), 2);
        assert_eq!(ledger.latest_full().unwrap().content_address, "bafyf2");

        let window = BackupFilter {
            since: Some("2024-01-02T00:00:00Z".parse().unwrap()),
            until: Some("2024-01-08T00:00:00Z".parse().unwrap()),
            ..BackupFilter::default()
        };
        let hits = ledger.query(&window);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content_address, "bafyf2");
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir).await;
        ledger.append(full_record("bafyf1", "2024-01-01T00:00:00Z", 1)).await.unwrap();

        assert!(ledger.remove("bafyunknown").await.unwrap().is_none());
        let removed = ledger.remove("bafyf1").await.unwrap().unwrap();
        assert_eq!(removed.content_address, "bafyf1");
        assert!(ledger.query(&BackupFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn test_lineage_and_chain_audit() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir).await;
        ledger.append(full_record("bafyf", "2024-01-01T00:00:00Z", 1)).await.unwrap();
        ledger
            .append(incremental_record("bafyi2", "bafyf", "2024-01-02T00:00:00Z", "2024-01-03T00:00:00Z"))
            .await
            .unwrap();
        ledger
            .append(incremental_record("bafyi1", "bafyf", "2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z"))
            .await
            .unwrap();

        let chain: Vec<_> = ledger
            .lineage("bafyf")
            .unwrap()
            .into_iter()
            .map(|r| r.content_address)
            .collect();
        assert_eq!(chain, vec!["bafyf", "bafyi1", "bafyi2"]);
        assert!(ledger.verify_chain("bafyf").unwrap().is_contiguous());
        assert_eq!(ledger.latest_in_lineage("bafyf").unwrap().content_address, "bafyi2");

        ledger
            .append(incremental_record("bafyi4", "bafyf", "2024-01-04T00:00:00Z", "2024-01-05T00:00:00Z"))
            .await
            .unwrap();
        let report = ledger.verify_chain("bafyf").unwrap();
        assert_eq!(report.incrementals, 3);
        assert_eq!(report.gaps.len(), 1);
        assert_eq!(report.gaps[0].content_address, "bafyi4");
        assert_eq!(report.gaps[0].expected_start, "2024-01-03T00:00:00Z".parse::<DateTime<Utc>>().unwrap());

        assert!(ledger.lineage("bafyi1").is_err());
    }

    #[tokio::test]
    async fn test_publish_records_own_address() {
        let dir = TempDir::new().unwrap();
        let (store, nodes) = memory_store(2, 2);
        let mut ledger = ManifestLedger::open(dir.path(), Arc::new(store)).await.unwrap();
        ledger.append(full_record("bafyf", "2024-01-01T00:00:00Z", 1)).await.unwrap();

        let address = ledger.publish().await.unwrap();
        assert_eq!(ledger.manifest().manifest_content_address.as_deref(), Some(address.as_str()));
        assert!(nodes.iter().all(|n| n.has_pin(&address)));

        ledger.load().await.unwrap();
        assert_eq!(ledger.manifest().manifest_content_address.as_deref(), Some(address.as_str()));
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), b"{not json").unwrap();
        let (store, _) = memory_store(1, 1);
        let result = ManifestLedger::open(dir.path(), Arc::new(store)).await;
        assert!(matches!(result, Err(BackupError::ManifestIo(_))));
    }

    #[tokio::test]
    async fn test_forget_local_copies() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir).await;
        let mut record = full_record("bafyf", "2024-01-01T00:00:00Z", 1);
        record.local_path = Some(dir.path().join("full_backup_a.tar.zst.enc"));
        ledger.append(record).await.unwrap();

        let cleared = ledger
            .forget_local_copies(&[dir.path().join("full_backup_a.tar.zst.enc")])
            .await
            .unwrap();
        assert_eq!(cleared, 1);
        assert!(ledger.manifest().backups[0].local_path.is_none());
        assert_eq!(ledger.forget_local_copies(&[]).await.unwrap(), 0);
    }

    #[test]
    fn test_manifest_file_names() {
        assert!(ManifestLedger::is_manifest_file("manifest.json"));
        assert!(ManifestLedger::is_manifest_file("manifest.json.tmp"));
        assert!(!ManifestLedger::is_manifest_file("full_backup_1.tar.zst.enc"));
    }
}
