//! Cleanup daemon - main entry point
//!
//! Drives the backup engine from the command line and runs the resource
//! monitor until shutdown.

mod config;
mod shutdown;

use anyhow::{bail, Result};
use backup_engine::monitor::{MonitorConfig, MonitorHandle, SysinfoSampler, TracingNotifier};
use backup_engine::{utils, BackupEngine, Config, CreateBackupRequest, RetentionPolicy};
use clap::{Parser, Subcommand};
use shutdown::ShutdownCoordinator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up a directory and print the new backup id
    Create {
        source: PathBuf,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Encrypt the archive
        #[arg(long, conflicts_with = "no_encrypt")]
        encrypt: bool,

        /// Store the archive unencrypted
        #[arg(long)]
        no_encrypt: bool,
    },

    /// Restore a backup into a directory
    Restore { id: String, destination: PathBuf },

    /// List backups, newest first
    List {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a backup's archive against its recorded checksum
    Verify { id: String },

    /// Delete a backup and its archive
    Delete { id: String },

    /// Delete backups older than the retention period
    Prune {
        #[arg(long)]
        days: Option<u32>,

        /// Always keep this many newest backups
        #[arg(long)]
        keep_last: Option<usize>,
    },

    /// Report catalog records whose archives are missing or damaged
    Audit,

    /// Run the resource monitor until interrupted
    Monitor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = config::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!(
        "Starting cleanup-daemon v{} (data_dir: {})",
        env!("CARGO_PKG_VERSION"),
        config.storage.data_dir.display()
    );

    match args.command {
        Command::Monitor => run_monitor(MonitorConfig::from(&config.monitor)).await,
        command => run_command(&config, command).await,
    }
}

async fn run_command(config: &Config, command: Command) -> Result<()> {
    let engine = BackupEngine::from_config(config).await?;

    match command {
        Command::Create {
            source,
            description,
            encrypt,
            no_encrypt,
        } => {
            let encrypt = if encrypt {
                true
            } else if no_encrypt {
                false
            } else {
                config.encryption.encrypt_by_default
            };
            let request = CreateBackupRequest::new(source)
                .description(description)
                .encrypted(encrypt);
            let id = engine.create_backup(request).await?;
            println!("{}", id);
        }

        Command::Restore { id, destination } => {
            let summary = engine.restore_backup(&id, &destination).await?;
            println!(
                "Restored {} files ({} bytes) to {}",
                summary.files_written,
                summary.bytes_written,
                destination.display()
            );
        }

        Command::List { json } => {
            let records = engine.list_backups().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in records {
                    println!(
                        "{}  {}  {:>10} B  {}{}  {}",
                        r.id,
                        r.created_at.format("%Y-%m-%d %H:%M:%S"),
                        r.size_bytes,
                        if r.encrypted { "enc " } else { "" },
                        r.source_path.display(),
                        r.description
                    );
                }
            }
        }

        Command::Verify { id } => {
            let record = engine.verify_backup(&id).await?;
            println!("{} OK ({})", record.id, record.checksum);
        }

        Command::Delete { id } => {
            engine.delete_backup(&id).await?;
            println!("Deleted {}", id);
        }

        Command::Prune { days, keep_last } => {
            let mut policy = RetentionPolicy::from(&config.retention);
            if let Some(days) = days {
                policy.retention_days = days;
            }
            if keep_last.is_some() {
                policy.keep_last = keep_last;
            }

            let report = engine.prune_backups(&policy).await;
            for id in &report.deleted {
                println!("Deleted {}", id);
            }
            for (id, reason) in &report.failed {
                eprintln!("Failed {}: {}", id, reason);
            }
            if !report.is_clean() {
                bail!("{} backup(s) could not be pruned", report.failed.len());
            }
        }

        Command::Audit => {
            let issues = engine.audit_catalog().await;
            for issue in &issues {
                println!("{}  {}  {}", issue.id, issue.storage_path.display(), issue.problem);
            }
            if !issues.is_empty() {
                bail!("{} corrupt catalog record(s)", issues.len());
            }
            println!("Catalog OK");
        }

        Command::Monitor => return run_monitor(MonitorConfig::from(&config.monitor)).await,
    }

    Ok(())
}

async fn run_monitor(config: MonitorConfig) -> Result<()> {
    let coordinator = ShutdownCoordinator::new();

    let handle = MonitorHandle::spawn(
        config,
        SysinfoSampler::new,
        Arc::new(TracingNotifier),
        coordinator.token(),
    );

    coordinator.wait_for_signal().await;

    match tokio::time::timeout(Duration::from_secs(5), handle.shutdown()).await {
        Ok(Ok(())) => tracing::info!("Monitor shutdown complete"),
        Ok(Err(e)) => tracing::error!("Monitor task panicked: {}", e),
        Err(_) => tracing::warn!("Monitor shutdown timeout, forcing exit"),
    }

    Ok(())
}
