// Operator tool for IP cache snapshots
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, error};

use ipcache_rs::config::AppConfig;
use ipcache_rs::logging::LoggingManager;
use ipcache_rs::storage::snapshot;
use ipcache_rs::{validate_persistence_path, IpEntry, SnapshotRecord, FORCED_REFRESH_AGE};

/// IP cache operator tool
#[derive(Parser)]
#[command(name = "ipcache")]
#[command(about = "Inspect IP cache snapshots and check persistence paths")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a snapshot file and print its contents
    Inspect(InspectArgs),

    /// Check whether a path is usable for cache persistence
    CheckPath {
        /// Candidate snapshot path
        path: String,
    },
}

#[derive(Args)]
struct InspectArgs {
    /// Snapshot file
    file: PathBuf,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Print at most this many entries
    #[arg(short, long)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct InspectReport<'a> {
    capacity: u64,
    entries: usize,
    items: Vec<InspectItem<'a>>,
}

#[derive(Serialize)]
struct InspectItem<'a> {
    ip: IpAddr,
    #[serde(flatten)]
    entry: &'a IpEntry,
    stale: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match cli.config.as_deref() {
        Some(path) => match AppConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("ipcache: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => AppConfig::default(),
    };
    config.apply_env();
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    if let Err(e) = LoggingManager::new(config.logging.clone()).initialize() {
        eprintln!("ipcache: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Inspect(args) => inspect(&args),
        Commands::CheckPath { path } => check_path(&path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn inspect(args: &InspectArgs) -> Result<(), String> {
    let bytes = std::fs::read(&args.file)
        .map_err(|e| format!("read {}: {e}", args.file.display()))?;
    let record: SnapshotRecord<IpAddr, IpEntry> = snapshot::decode(&bytes)
        .map_err(|e| format!("decode {}: {e}", args.file.display()))?;
    debug!(bytes = bytes.len(), "snapshot decoded");

    let now = Utc::now();
    let shown = args.limit.unwrap_or(record.entries.len());
    let items: Vec<InspectItem<'_>> = record
        .entries
        .iter()
        .take(shown)
        .map(|pair| InspectItem {
            ip: pair.key,
            entry: &pair.value,
            stale: pair.value.is_stale(FORCED_REFRESH_AGE, now),
        })
        .collect();

    if args.json {
        let report = InspectReport {
            capacity: record.capacity,
            entries: record.entries.len(),
            items,
        };
        let text = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{text}");
        return Ok(());
    }

    println!("capacity: {}", record.capacity);
    println!("entries:  {}", record.entries.len());
    for item in &items {
        println!(
            "{:<40} {:<3} {}{}",
            item.ip,
            item.entry.country,
            item.entry.resolved_at.to_rfc3339(),
            if item.stale { " (stale)" } else { "" }
        );
    }
    if items.len() < record.entries.len() {
        println!("... {} more", record.entries.len() - items.len());
    }
    Ok(())
}

fn check_path(raw: &str) -> Result<(), String> {
    match validate_persistence_path(raw) {
        Ok(Some(path)) => {
            println!("ok: {}", path.display());
            Ok(())
        }
        Ok(None) => {
            println!("persistence disabled: no path given");
            Ok(())
        }
        Err(e) => Err(format!("persistence would be disabled: {e}")),
    }
}
