//! Backup Pipeline Library
//!
//! Encrypted MongoDB backups replicated across IPFS nodes, with a manifest
//! ledger, retention sweeps and restore.

pub mod archive;
pub mod config;
pub mod crypto;
pub mod dump;
pub mod fs;
pub mod manifest;
pub mod notify;
pub mod orchestrator;
pub mod pipeline;
pub mod restore;
pub mod retention;
pub mod store;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use pipeline::Pipeline;
pub use utils::errors::{BackupError, Result};
