// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! templog — crash-safe temperature datalogger
//!
//! Usage:
//!   templog run    --config config.toml
//!   templog status --config config.toml [--json]
//!   templog dump   --config config.toml

use std::path::PathBuf;

use chrono::Offset;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use templog::config::Config;
use templog::error::LogError;
use templog::manager::Datalogger;
use templog::nvram::FileNvram;
use templog::record::{self, CSV_HEADER};
use templog::sensor::SimulatedPt100;
use templog::sink::StdoutSink;
use templog::storage::ring::DurableRing;

#[derive(Parser)]
#[command(name = "templog", about = "Crash-safe temperature datalogger", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start logging with the simulated sensor until CTRL+C.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print a snapshot of the NVRAM ring and the media directory.
    Status {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Emit the snapshot as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print buffered ring records as CSV rows without consuming them.
    Dump {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            run_logger(config).await;
        }
        Command::Status { config, json } => {
            run_status(config, json);
        }
        Command::Dump { config } => {
            run_dump(config);
        }
    }
}

fn load_config(path: &PathBuf) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    }
}

async fn run_logger(config_path: PathBuf) {
    let cfg = load_config(&config_path);

    info!(
        node_id = cfg.node_id,
        log_period_ms = cfg.sensor.log_period_ms,
        nvram = ?cfg.nvram.path,
        mount = ?cfg.storage.mount_point,
        "Starting datalogger"
    );

    let logger = match Datalogger::start(
        &cfg,
        Box::new(SimulatedPt100::new()),
        Some(Box::new(StdoutSink::new())),
        None,
    ) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to start datalogger");
            std::process::exit(1);
        }
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received CTRL+C, shutting down…");
        }
        Err(e) => {
            error!(error = %e, "Signal error");
        }
    }
    logger.shutdown().await;
}

#[derive(Serialize)]
struct RingStatus {
    nvram_image: PathBuf,
    capacity: u32,
    buffered: u32,
    next_sequence: u32,
    next_record_id: u64,
    overrun_records_total: u64,
    saw_corruption: bool,
    day_files: Vec<DayFileEntry>,
}

#[derive(Serialize)]
struct DayFileEntry {
    name: String,
    bytes: u64,
}

fn open_ring(cfg: &Config) -> DurableRing<FileNvram> {
    let ring = FileNvram::open(&cfg.nvram.path, cfg.nvram.size_bytes)
        .and_then(|nv| DurableRing::open(nv, cfg.nvram.persist_every));
    match ring {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error opening ring: {e}");
            std::process::exit(1);
        }
    }
}

fn list_day_files(cfg: &Config) -> Vec<DayFileEntry> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&cfg.storage.mount_point) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".csv") {
                continue;
            }
            let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push(DayFileEntry { name, bytes });
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
}

fn run_status(config_path: PathBuf, json: bool) {
    let cfg = load_config(&config_path);
    let ring = open_ring(&cfg);

    let status = RingStatus {
        nvram_image: cfg.nvram.path.clone(),
        capacity: ring.capacity(),
        buffered: ring.count(),
        next_sequence: ring.next_sequence(),
        next_record_id: ring.next_record_id(),
        overrun_records_total: ring.overrun_records_total(),
        saw_corruption: ring.saw_corruption(),
        day_files: list_day_files(&cfg),
    };

    if json {
        match serde_json::to_string_pretty(&status) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    println!("=== templog status ===");
    println!("NVRAM image : {} ({} slots)", status.nvram_image.display(), status.capacity);
    println!("Buffered    : {} records", status.buffered);
    println!("Next seq/id : {} / {}", status.next_sequence, status.next_record_id);
    println!("Overruns    : {}", status.overrun_records_total);
    println!("Corruption  : {}", if status.saw_corruption { "seen" } else { "none" });
    println!("Day files   : {}", status.day_files.len());
    for f in &status.day_files {
        println!("  {}  {} bytes", f.name, f.bytes);
    }
}

fn run_dump(config_path: PathBuf) {
    let cfg = load_config(&config_path);
    let mut ring = open_ring(&cfg);

    let local_offset = chrono::FixedOffset::east_opt(cfg.storage.local_offset_minutes * 60)
        .unwrap_or_else(|| chrono::Utc.fix());

    print!("{CSV_HEADER}");
    for k in 0..ring.count() {
        match ring.peek_offset(k) {
            Ok(rec) => {
                print!("{}", record::format_csv_row(&rec, cfg.node_id, local_offset));
            }
            Err(LogError::Corrupt(e)) => {
                println!("# slot {k}: {e}");
            }
            Err(e) => {
                eprintln!("Error reading slot {k}: {e}");
                std::process::exit(1);
            }
        }
    }
}
