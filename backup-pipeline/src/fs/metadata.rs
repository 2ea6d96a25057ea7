//! File metadata used for local retention decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Size and modification time of a single file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time
    pub modified: DateTime<Utc>,

    pub is_file: bool,
}

impl FileMetadata {
    /// Extract metadata from a file path without following symlinks
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;

        Ok(Self {
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
            is_file: metadata.is_file(),
        })
    }

    /// True when the file was last modified strictly before `cutoff`.
    pub fn modified_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.modified < cutoff
    }
}
