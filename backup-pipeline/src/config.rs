//! Configuration management for the backup pipeline.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! A `.env` file in the working directory is honoured as well.

use crate::crypto::EncryptionKey;
use crate::utils::redact::{mask_secret, mask_uri};
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub encryption: EncryptionConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// MongoDB connection URI
    pub uri: String,

    /// Restrict full dumps to a single database
    #[serde(default)]
    pub database: Option<String>,

    /// Path to the mongodump binary
    #[serde(default = "default_dump_tool")]
    pub dump_tool: String,

    /// Path to the mongorestore binary
    #[serde(default = "default_restore_tool")]
    pub restore_tool: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Base64-encoded 256-bit key
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// IPFS RPC endpoints; the first one is the primary used for adds
    pub endpoints: Vec<String>,

    /// Minimum number of endpoints that must pin each upload
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Upper bound for a single pin call
    #[serde(default = "default_pin_timeout_secs")]
    pub pin_timeout_secs: u64,

    /// Upper bound for a single pin verification call
    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Cron expression (seconds first) for full backups
    #[serde(default = "default_full_schedule")]
    pub full: String,

    /// Cron expression for incremental backups
    #[serde(default = "default_incremental_schedule")]
    pub incremental: String,

    /// Cron expression for retention sweeps
    #[serde(default = "default_retention_schedule")]
    pub retention: String,

    /// Remote retention horizon in days
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Scratch space for dumps and intermediate archives
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Encrypted archives and the manifest live here
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Local retention horizon in days, independent of remote retention
    #[serde(default = "default_local_retention_days")]
    pub local_retention_days: u32,

    /// Optional secondary copy of every encrypted archive
    #[serde(default)]
    pub mirror_dir: Option<PathBuf>,

    /// zstd compression level (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_dump_tool() -> String {
    "mongodump".to_string()
}

fn default_restore_tool() -> String {
    "mongorestore".to_string()
}

fn default_replication_factor() -> usize {
    2
}

fn default_pin_timeout_secs() -> u64 {
    30
}

fn default_verify_timeout_secs() -> u64 {
    10
}

fn default_full_schedule() -> String {
    "0 0 2 * * Sun".to_string()
}

fn default_incremental_schedule() -> String {
    "0 0 2 * * *".to_string()
}

fn default_retention_schedule() -> String {
    "0 30 2 * * *".to_string()
}

fn default_retention_days() -> u32 {
    90
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/mongodb-backups")
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/data/backups")
}

fn default_local_retention_days() -> u32 {
    7
}

fn default_compression_level() -> i32 {
    3
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            database: None,
            dump_tool: default_dump_tool(),
            restore_tool: default_restore_tool(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            replication_factor: default_replication_factor(),
            pin_timeout_secs: default_pin_timeout_secs(),
            verify_timeout_secs: default_verify_timeout_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            full: default_full_schedule(),
            incremental: default_incremental_schedule(),
            retention: default_retention_schedule(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            storage_dir: default_storage_dir(),
            local_retention_days: default_local_retention_days(),
            mirror_dir: None,
            compression_level: default_compression_level(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the optional TOML file, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from environment variables onto this configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Some(uri) = env_var("MONGODB_URI") {
            self.database.uri = uri;
        }
        if let Some(db) = env_var("MONGODB_DATABASE") {
            self.database.database = Some(db);
        }
        if let Some(tool) = env_var("MONGODUMP_PATH") {
            self.database.dump_tool = tool;
        }
        if let Some(tool) = env_var("MONGORESTORE_PATH") {
            self.database.restore_tool = tool;
        }

        if let Some(key) = env_var("BACKUP_ENCRYPTION_KEY") {
            self.encryption.key = key;
        }

        if let Some(urls) = env_var("IPFS_NODE_URLS") {
            self.store.endpoints = urls
                .split(',')
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
        } else {
            let numbered: Vec<String> = ["IPFS_NODE_1_URL", "IPFS_NODE_2_URL", "IPFS_NODE_3_URL"]
                .iter()
                .filter_map(|name| env_var(name))
                .collect();
            if !numbered.is_empty() {
                self.store.endpoints = numbered;
            }
        }
        if let Some(factor) = env_parse("IPFS_REPLICATION_FACTOR") {
            self.store.replication_factor = factor;
        }
        if let Some(secs) = env_parse("IPFS_PIN_TIMEOUT_SECS") {
            self.store.pin_timeout_secs = secs;
        }

        if let Some(cron) = env_var("FULL_BACKUP_SCHEDULE") {
            self.schedule.full = cron;
        }
        if let Some(cron) = env_var("INCREMENTAL_BACKUP_SCHEDULE") {
            self.schedule.incremental = cron;
        }
        if let Some(cron) = env_var("RETENTION_SCHEDULE") {
            self.schedule.retention = cron;
        }
        if let Some(days) = env_parse("BACKUP_RETENTION_DAYS") {
            self.schedule.retention_days = days;
        }

        if let Some(dir) = env_var("BACKUP_TEMP_DIR") {
            self.storage.temp_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_var("BACKUP_STORAGE_DIR") {
            self.storage.storage_dir = PathBuf::from(dir);
        }
        if let Some(days) = env_parse("BACKUP_LOCAL_RETENTION_DAYS") {
            self.storage.local_retention_days = days;
        }
        if let Some(dir) = env_var("BACKUP_MIRROR_DIR") {
            self.storage.mirror_dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = env_parse("BACKUP_COMPRESSION_LEVEL") {
            self.storage.compression_level = level;
        }

        if let Some(url) = env_var("WEBHOOK_URL") {
            self.notifications.webhook_url = Some(url);
        }
        if let Some(enabled) = env_var("WEBHOOK_ENABLED") {
            self.notifications.enabled = enabled == "true";
        }

        if let Some(level) = env_var("LOG_LEVEL") {
            self.log.level = level;
        }
    }

    /// Check required values and cross-field constraints.
    ///
    /// The encryption key is decoded here so a bad key is rejected at
    /// startup rather than on the first encryption.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.database.uri.is_empty() {
            missing.push("MONGODB_URI");
        }
        if self.encryption.key.is_empty() {
            missing.push("BACKUP_ENCRYPTION_KEY");
        }
        if self.store.endpoints.is_empty() {
            missing.push("IPFS_NODE_URLS");
        }
        if !missing.is_empty() {
            return Err(BackupError::Config(format!(
                "Missing required settings: {}",
                missing.join(", ")
            )));
        }

        EncryptionKey::from_base64(&self.encryption.key)?;

        let endpoints = self.store.endpoints.len();
        if self.store.replication_factor == 0 || self.store.replication_factor > endpoints {
            return Err(BackupError::Config(format!(
                "replication_factor must be between 1 and the number of endpoints ({}), got {}",
                endpoints, self.store.replication_factor
            )));
        }

        if !(1..=22).contains(&self.storage.compression_level) {
            return Err(BackupError::Config(format!(
                "compression_level must be between 1 and 22, got {}",
                self.storage.compression_level
            )));
        }

        if self.notifications.enabled && self.notifications.webhook_url.is_none() {
            return Err(BackupError::Config(
                "notifications are enabled but no webhook_url is set".to_string(),
            ));
        }

        Ok(())
    }

    /// Create the temp and storage directories if they don't exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.storage.temp_dir)?;
        std::fs::create_dir_all(&self.storage.storage_dir)?;
        Ok(())
    }

    /// Copy of this configuration that is safe to log.
    pub fn redacted(&self) -> Self {
        let mut safe = self.clone();
        safe.database.uri = mask_uri(&safe.database.uri);
        safe.encryption.key = mask_secret(&safe.encryption.key);
        safe.notifications.webhook_url = safe.notifications.webhook_url.as_deref().map(mask_secret);
        safe
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_var(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}
