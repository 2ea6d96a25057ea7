//! Invocation of `mongorestore`.

use crate::utils::process::run_tool;
use crate::utils::redact::mask_uri;
use crate::utils::{BackupError, Result};
use std::path::{Path, PathBuf};

/// How the restore tool applies a source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreMode {
    /// Restore a full dump, optionally dropping existing collections first
    Snapshot { drop_existing: bool },
    /// Replay an oplog file on top of what is already restored
    OplogReplay { oplog_file: PathBuf },
}

#[derive(Debug, Clone)]
pub struct RestoreTool {
    program: String,
    uri: String,
}

impl RestoreTool {
    pub fn new(program: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            uri: uri.into(),
        }
    }

    /// Same tool against a different database.
    pub fn with_uri(&self, uri: impl Into<String>) -> Self {
        Self::new(self.program.clone(), uri)
    }

    pub fn build_args(&self, mode: &RestoreMode, source_dir: &Path) -> Vec<String> {
        let mut args = vec!["--uri".to_string(), self.uri.clone(), "--gzip".to_string()];
        match mode {
            RestoreMode::Snapshot { drop_existing } => {
                if *drop_existing {
                    args.push("--drop".to_string());
                }
            }
            RestoreMode::OplogReplay { oplog_file } => {
                args.push("--oplogReplay".to_string());
                args.push("--oplogFile".to_string());
                args.push(oplog_file.to_string_lossy().into_owned());
            }
        }
        args.push(source_dir.to_string_lossy().into_owned());
        args
    }

    /// Run the tool; its exit status decides success.
    pub async fn run(&self, mode: &RestoreMode, source_dir: &Path) -> Result<()> {
        let args = self.build_args(mode, source_dir);
        let printable: Vec<String> = args.iter().map(|a| mask_uri(a)).collect();
        tracing::info!(source = %source_dir.display(), "Running restore tool");
        tracing::debug!("Executing {} {}", self.program, printable.join(" "));

        let output = run_tool(&self.program, &args)
            .await
            .map_err(|e| BackupError::RestoreToolFailed {
                exit_code: None,
                stderr: format!("failed to start {}: {}", self.program, e),
            })?;
        if !output.success() {
            return Err(BackupError::RestoreToolFailed {
                exit_code: output.exit_code(),
                stderr: output.stderr_tail,
            });
        }
        Ok(())
    }
}
