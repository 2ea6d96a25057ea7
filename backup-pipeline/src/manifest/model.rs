//! Manifest data model, serialized as camelCase JSON.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const MANIFEST_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            other => Err(format!("unknown backup type '{}', expected full or incremental", other)),
        }
    }
}

/// One backup as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub content_address: String,
    /// Start of the dump that produced this backup
    pub created_at: DateTime<Utc>,
    /// Size of the encrypted archive
    pub size_bytes: u64,
    pub duration_seconds: f64,
    pub databases: Vec<String>,
    #[serde(default = "always_encrypted")]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_set: Option<String>,
    /// Locally retained encrypted copy, cleared once reclaimed
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backup_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oplog_range_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oplog_range_end: Option<DateTime<Utc>>,
}

fn always_encrypted() -> bool {
    true
}

impl BackupRecord {
    pub fn is_full(&self) -> bool {
        self.kind == BackupKind::Full
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStatistics {
    pub total_backups: usize,
    pub total_size: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl ManifestStatistics {
    pub fn from_records(records: &[BackupRecord]) -> Self {
        Self {
            total_backups: records.len(),
            total_size: records.iter().map(|r| r.size_bytes).sum(),
            oldest: records.iter().map(|r| r.created_at).min(),
            newest: records.iter().map(|r| r.created_at).max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub manifest_content_address: Option<String>,
    #[serde(default)]
    pub backups: Vec<BackupRecord>,
    #[serde(default)]
    pub statistics: ManifestStatistics,
}

impl Manifest {
    pub fn empty() -> Self {
        let now = Utc::now();
        Self {
            version: MANIFEST_VERSION.to_string(),
            created_at: now,
            last_updated: now,
            manifest_content_address: None,
            backups: Vec::new(),
            statistics: ManifestStatistics::default(),
        }
    }

    pub fn find(&self, address: &str) -> Option<&BackupRecord> {
        self.backups.iter().find(|b| b.content_address == address)
    }
}

/// Criteria for [`super::ManifestLedger::query`]; unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupFilter {
    #[serde(rename = "type")]
    pub kind: Option<BackupKind>,
    /// Inclusive lower bound on `createdAt`
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `createdAt`
    pub until: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `createdAt`
    #[serde(skip)]
    pub created_before: Option<DateTime<Utc>>,
}

impl BackupFilter {
    pub fn kind(kind: BackupKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Records created more than `days` days ago.
    pub fn older_than_days(days: u32) -> Self {
        Self {
            created_before: Some(Utc::now() - Duration::days(i64::from(days))),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &BackupRecord) -> bool {
        self.kind.map_or(true, |k| record.kind == k)
            && self.since.map_or(true, |t| record.created_at >= t)
            && self.until.map_or(true, |t| record.created_at <= t)
            && self.created_before.map_or(true, |t| record.created_at < t)
    }
}
