//! Manifest ledger: the catalog of every backup and its lineage.

pub mod ledger;
pub mod model;

pub use ledger::{ChainGap, ChainReport, ManifestLedger, SharedLedger, MANIFEST_FILE_NAME};
pub use model::{BackupFilter, BackupKind, BackupRecord, Manifest, ManifestStatistics};
