//! Assembles every pipeline component from one configuration.

use crate::config::Config;
use crate::crypto::Cipher;
use crate::dump::DumpProducer;
use crate::manifest::{ManifestLedger, SharedLedger};
use crate::notify::Notifier;
use crate::orchestrator::BackupOrchestrator;
use crate::restore::tool::RestoreTool;
use crate::restore::RestorePipeline;
use crate::retention::RetentionSweeper;
use crate::store::ReplicatedStore;
use crate::utils::Result;
use std::sync::Arc;

/// Shared handles to the components of a configured pipeline.
pub struct Pipeline {
    pub config: Config,
    pub store: Arc<ReplicatedStore>,
    pub ledger: SharedLedger,
    pub cipher: Cipher,
    pub notifier: Notifier,
    pub orchestrator: BackupOrchestrator,
    pub sweeper: RetentionSweeper,
    pub restore: RestorePipeline,
}

impl Pipeline {
    /// Build from a validated configuration; creates the work directories.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = Arc::new(ReplicatedStore::from_config(&config.store)?);
        Self::with_store(config, store).await
    }

    /// Build around an already constructed store; creates the work directories.
    pub async fn with_store(config: Config, store: Arc<ReplicatedStore>) -> Result<Self> {
        config.ensure_dirs()?;
        let cipher = Cipher::from_config(&config.encryption)?;
        let notifier = Notifier::from_config(&config.notifications)?;
        let ledger = ManifestLedger::open(&config.storage.storage_dir, store.clone())
            .await?
            .into_shared();

        let orchestrator = BackupOrchestrator::new(
            &config,
            DumpProducer::from_config(&config.database),
            cipher.clone(),
            store.clone(),
            ledger.clone(),
            notifier.clone(),
        );
        let sweeper = RetentionSweeper::new(
            store.clone(),
            ledger.clone(),
            notifier.clone(),
            config.storage.storage_dir.clone(),
            config.schedule.retention_days,
            config.storage.local_retention_days,
        );
        let restore = RestorePipeline::new(
            store.clone(),
            cipher.clone(),
            ledger.clone(),
            RestoreTool::new(config.database.restore_tool.clone(), config.database.uri.clone()),
            config.storage.temp_dir.clone(),
        );

        tracing::info!(
            endpoints = store.endpoint_urls().len(),
            replication_factor = store.replication_factor(),
            notifications = notifier.is_enabled(),
            "Pipeline ready"
        );

        Ok(Self {
            config,
            store,
            ledger,
            cipher,
            notifier,
            orchestrator,
            sweeper,
            restore,
        })
    }
}
