//! Optional secondary copy of every encrypted archive.

use crate::utils::{BackupError, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SecondaryMirror {
    dir: PathBuf,
}

impl SecondaryMirror {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Copy `file` into the mirror directory under the same name.
    pub async fn copy(&self, file: &Path) -> Result<PathBuf> {
        let name = file
            .file_name()
            .ok_or_else(|| BackupError::SecondaryMirror(format!("{} has no file name", file.display())))?;
        let target = self.dir.join(name);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| BackupError::SecondaryMirror(format!("cannot create {}: {}", self.dir.display(), e)))?;
        tokio::fs::copy(file, &target)
            .await
            .map_err(|e| BackupError::SecondaryMirror(format!("cannot copy to {}: {}", target.display(), e)))?;
        Ok(target)
    }
}
