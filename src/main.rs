//! CLI binary for finding and downloading cluster snapshots.

use anyhow::Result;
use clap::{Parser, Subcommand};
use snapshot_finder::local::latest_full_snapshot;
use snapshot_finder::{Config, FindStatus, SnapshotFinder};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "snapshot-finder")]
#[command(about = "Find and download the freshest snapshot served by cluster RPC nodes")]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Find a snapshot and download it (default)
    Find,

    /// Probe peers once and write the scan report without downloading
    Scan {
        /// Number of ranked candidates to print
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// Show the newest local full snapshot
    Local,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "snapshot_finder=debug"
    } else {
        "snapshot_finder=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command.unwrap_or(Commands::Find) {
        Commands::Find => find(cli.config).await,
        Commands::Scan { top } => scan(cli.config, top).await,
        Commands::Local => {
            show_local(&cli.config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn find(config: Config) -> Result<ExitCode> {
    let finder = SnapshotFinder::new(config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping");
            on_signal.cancel();
        }
    });

    let outcome = finder.run(cancel).await?;

    for path in outcome.downloaded() {
        println!("{}", path.display());
    }

    match outcome.status {
        FindStatus::Success => Ok(ExitCode::SUCCESS),
        FindStatus::Exhausted => {
            eprintln!(
                "no suitable snapshot found after {} attempts",
                outcome.attempts
            );
            Ok(ExitCode::FAILURE)
        }
        FindStatus::Cancelled => Ok(ExitCode::from(130)),
    }
}

async fn scan(config: Config, top: usize) -> Result<ExitCode> {
    let finder = SnapshotFinder::new(config)?;
    let outcome = finder.scan_once().await?;
    let summary = &outcome.summary;

    println!("Scan Summary");
    if let Some(slot) = summary.current_slot {
        println!("  Current slot: {}", slot);
    }
    println!("  Peers scanned: {}", summary.peers);
    println!("  Candidates: {}", summary.candidates);
    println!("  Discarded: {}", summary.discarded);
    if let Some(report) = &summary.report {
        println!("  Report: {}", report.display());
    }

    if !outcome.candidates.is_empty() {
        println!();
        println!("Top candidates:");
        for candidate in outcome.candidates.iter().take(top) {
            println!(
                "  {} latency {:.1}ms, slots behind {}",
                candidate.snapshot_address, candidate.latency, candidate.slots_diff
            );
            for file in &candidate.files_to_download {
                println!("    - {}", file);
            }
        }
    }

    Ok(if summary.failure.is_none() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn show_local(config: &Config) {
    match latest_full_snapshot(&config.snapshot_dir) {
        Some(local) => {
            println!("Local full snapshot: {}", local.path.display());
            println!("  Slot: {}", local.slot);
        }
        None => println!(
            "No usable full snapshot in {}",
            config.snapshot_dir.display()
        ),
    }
}
