//! ipfs-backup - manual backup operations
//!
//! One-shot commands around the backup pipeline: run a backup, sweep
//! retention, inspect the manifest, fetch and restore backups.

use anyhow::{bail, Context, Result};
use backup_pipeline::manifest::{BackupFilter, BackupKind};
use backup_pipeline::restore::RestoreOptions;
use backup_pipeline::transfer::{format_bytes, format_duration};
use backup_pipeline::{utils, Config, Pipeline};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a backup now
    Backup {
        /// full or incremental
        #[arg(value_name = "TYPE")]
        kind: BackupKind,
    },
    /// Remove backups past the retention horizons
    Cleanup,
    /// List backups in the manifest, newest first
    List {
        #[arg(long = "type", value_name = "TYPE")]
        kind: Option<BackupKind>,
        /// RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// RFC 3339 timestamp
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
    /// Download a backup by content address
    Download {
        address: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Decrypt a downloaded backup file
    Decrypt {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Restore an extracted dump directory
    Restore {
        dir: PathBuf,
        /// Target connection URI (defaults to the configured one)
        #[arg(long)]
        uri: Option<String>,
        /// Drop existing collections first
        #[arg(long)]
        drop: bool,
    },
    /// Download, decrypt, extract and restore one backup
    RestoreFull {
        address: String,
        #[arg(long)]
        uri: Option<String>,
        #[arg(long)]
        drop: bool,
        #[arg(long)]
        keep_files: bool,
    },
    /// Restore a full backup and replay its incrementals
    RestoreChain {
        full_address: String,
        #[arg(long)]
        uri: Option<String>,
        #[arg(long)]
        drop: bool,
        #[arg(long)]
        keep_files: bool,
    },
    /// Check that a backup is pinned on every endpoint
    Verify { address: String },
    /// Check every store endpoint
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!(config = ?config.redacted(), "Configuration loaded");

    let pipeline = Pipeline::from_config(config).await?;

    match args.command {
        Command::Backup { kind } => {
            let outcome = pipeline.orchestrator.run(kind).await?;
            println!("{} backup complete", outcome.kind);
            println!("  address:  {}", outcome.content_address);
            println!("  size:     {}", format_bytes(outcome.size_bytes));
            println!("  duration: {}", format_duration(outcome.duration_seconds));
        }
        Command::Cleanup => {
            let report = pipeline.sweeper.sweep().await?;
            println!(
                "Deleted {} backups ({}), {} local files ({})",
                report.deleted_count,
                format_bytes(report.freed_bytes),
                report.local_deleted,
                format_bytes(report.local_freed_bytes)
            );
            for err in &report.errors {
                eprintln!(
                    "  {:?} {}: {}",
                    err.step,
                    err.content_address.as_deref().unwrap_or("-"),
                    err.message
                );
            }
        }
        Command::List { kind, since, until } => {
            let filter = BackupFilter {
                kind,
                since,
                until,
                ..BackupFilter::default()
            };
            let mut ledger = pipeline.ledger.lock().await;
            ledger.load().await?;
            let records = ledger.query(&filter);
            if records.is_empty() {
                println!("No backups found");
            }
            for record in &records {
                println!(
                    "{}  {:<11}  {:>10}  {}{}",
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.kind,
                    format_bytes(record.size_bytes),
                    record.content_address,
                    record
                        .base_backup_address
                        .as_deref()
                        .map(|b| format!("  (base {})", b))
                        .unwrap_or_default()
                );
            }
            let stats = ledger.statistics();
            println!(
                "{} backups, {} total",
                stats.total_backups,
                format_bytes(stats.total_size)
            );
        }
        Command::Download { address, output } => {
            let dest = output.unwrap_or_else(|| PathBuf::from(format!("{}.tar.zst.enc", address)));
            let bytes = pipeline.store.download(&address, &dest).await?;
            println!("Downloaded {} to {}", format_bytes(bytes), dest.display());
        }
        Command::Decrypt { file, output } => {
            let dest = match output {
                Some(dest) => dest,
                None => default_decrypt_output(&file)?,
            };
            let bytes = pipeline.cipher.decrypt(file, dest.clone()).await?;
            println!("Decrypted {} to {}", format_bytes(bytes), dest.display());
        }
        Command::Restore { dir, uri, drop } => {
            let restore = match uri {
                Some(uri) => pipeline.restore.with_uri(uri),
                None => pipeline.restore.clone(),
            };
            restore.restore_directory(&dir, drop).await?;
            println!("Restored {}", dir.display());
        }
        Command::RestoreFull {
            address,
            uri,
            drop,
            keep_files,
        } => {
            let restore = match uri {
                Some(uri) => pipeline.restore.with_uri(uri),
                None => pipeline.restore.clone(),
            };
            let options = RestoreOptions {
                drop_existing: drop,
                keep_files,
            };
            let report = restore.restore(&address, &options).await?;
            println!("Restored {}", address);
            if let Some(dir) = report.work_dir {
                println!("Work files kept in {}", dir.display());
            }
        }
        Command::RestoreChain {
            full_address,
            uri,
            drop,
            keep_files,
        } => {
            let restore = match uri {
                Some(uri) => pipeline.restore.with_uri(uri),
                None => pipeline.restore.clone(),
            };
            let options = RestoreOptions {
                drop_existing: drop,
                keep_files,
            };
            let report = restore.restore_lineage(&full_address, &options).await?;
            println!("Applied {} backups:", report.restored.len());
            for address in &report.restored {
                println!("  {}", address);
            }
            if report.gaps > 0 {
                eprintln!("Warning: {} gaps in the oplog chain", report.gaps);
            }
            if let Some(dir) = report.work_dir {
                println!("Work files kept in {}", dir.display());
            }
        }
        Command::Verify { address } => {
            let verification = pipeline.store.verify_pin(&address).await;
            for status in &verification.endpoints {
                println!("{}", serde_json::to_string(status)?);
            }
            if !verification.all_pinned {
                bail!("{} is not pinned on every endpoint", address);
            }
            println!("{} is pinned on all endpoints", address);
        }
        Command::Health => {
            let health = pipeline.store.check_health().await;
            let mut healthy = 0;
            for endpoint in &health {
                if endpoint.healthy {
                    healthy += 1;
                    println!(
                        "ok    {}  {}",
                        endpoint.endpoint,
                        endpoint.peer_id.as_deref().unwrap_or("")
                    );
                } else {
                    println!(
                        "down  {}  {}",
                        endpoint.endpoint,
                        endpoint.error.as_deref().unwrap_or("")
                    );
                }
            }
            let required = pipeline.store.replication_factor();
            if healthy < required {
                bail!(
                    "only {} of {} endpoints healthy, {} required for uploads",
                    healthy,
                    health.len(),
                    required
                );
            }
        }
    }

    Ok(())
}

/// `backup.tar.zst.enc` decrypts to `backup.tar.zst`.
fn default_decrypt_output(file: &Path) -> Result<PathBuf> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("input file has no name")?;
    let stem = name.strip_suffix(".enc").unwrap_or(name);
    let out = file.with_file_name(if stem == name {
        format!("{}.dec", name)
    } else {
        stem.to_string()
    });
    Ok(out)
}
