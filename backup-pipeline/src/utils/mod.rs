//! Utility modules for the backup pipeline.

pub mod errors;
pub mod logger;
pub mod process;
pub mod redact;

pub use errors::{BackupError, Result};
