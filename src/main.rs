//! capture-replay
//!
//! Records HTTP traffic through a forwarding proxy into an HTTP Archive, then
//! replays the archive against a target with the recorded timing and live
//! session state.
//!
//! # Architecture Overview
//!
//! ```text
//!  record:
//!     client ──▶ capture proxy ──▶ upstream
//!                    │
//!                    ▼
//!              capture decoder ──▶ archive writer ──▶ traffic.har
//!
//!  replay:
//!     traffic.har ──▶ archive reader ──▶ dispatcher ──▶ session resolver
//!                                            │
//!                                            ▼
//!                                       exchange ──▶ target
//!                                            │
//!                                            ▼
//!                                     result listeners
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use capture_replay::archive::ArchiveWriter;
use capture_replay::capture::CaptureProxy;
use capture_replay::config::{load_config, ToolConfig};
use capture_replay::lifecycle::{spawn_signal_handler, Shutdown};
use capture_replay::observability::{logging, metrics};
use capture_replay::replay::{replay_archive, FanoutListener, ReplayStats, TracingListener};

#[derive(Parser)]
#[command(name = "capture-replay")]
#[command(about = "Record HTTP traffic into an archive and replay it with timing fidelity", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capturing proxy until interrupted
    Record {
        /// Proxy bind address
        #[arg(long)]
        listen: Option<String>,
        /// Upstream host:port requests are forwarded to
        #[arg(long)]
        upstream: Option<String>,
        /// Archive file to write
        #[arg(long)]
        archive: Option<PathBuf>,
        /// Write a lightweight archive
        #[arg(long)]
        lightweight: bool,
    },
    /// Replay an archive against a target
    Replay {
        /// Target host:port every request is sent to
        #[arg(long)]
        target: Option<String>,
        /// Archive file to read
        #[arg(long)]
        archive: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ToolConfig::default(),
    };
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }

    logging::init(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "capture-replay starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    match cli.command {
        Commands::Record {
            listen,
            upstream,
            archive,
            lightweight,
        } => {
            if let Some(listen) = listen {
                config.capture.listen_address = listen;
            }
            if let Some(upstream) = upstream {
                config.capture.upstream = upstream;
            }
            if let Some(archive) = archive {
                config.archive.path = archive;
            }
            config.archive.lightweight |= lightweight;
            record(config, &shutdown).await?;
        }
        Commands::Replay { target, archive } => {
            if let Some(target) = target {
                config.replay.target = target;
            }
            if let Some(archive) = archive {
                config.archive.path = archive;
            }
            replay(config, &shutdown).await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn record(config: ToolConfig, shutdown: &Shutdown) -> Result<(), Box<dyn std::error::Error>> {
    let writer = Arc::new(ArchiveWriter::create(&config.archive).await?);
    let listener = TcpListener::bind(&config.capture.listen_address).await?;

    tracing::info!(
        upstream = %config.capture.upstream,
        archive = %config.archive.path.display(),
        "Recording"
    );

    let proxy = CaptureProxy::new(config.capture.clone(), Arc::clone(&writer));
    let served = proxy.run(listener, shutdown.subscribe()).await;

    // Close the archive even when the proxy failed.
    let written = writer.stop().await?;
    served?;

    println!("Recorded {written} entries to {}", config.archive.path.display());
    Ok(())
}

async fn replay(config: ToolConfig, shutdown: &Shutdown) -> Result<(), Box<dyn std::error::Error>> {
    let stats = Arc::new(ReplayStats::new());
    let listener = Arc::new(
        FanoutListener::new()
            .with(stats.clone())
            .with(Arc::new(TracingListener)),
    );

    let summary = replay_archive(&config, &config.archive.path, listener, shutdown.subscribe()).await?;
    let totals = stats.snapshot();

    println!(
        "Replayed {} of {} requests: {} succeeded, {} failed, {} bytes read{}",
        totals.total(),
        summary.submitted,
        totals.succeeded,
        totals.failed,
        totals.bytes_read,
        if summary.interrupted { " (interrupted)" } else { "" }
    );
    Ok(())
}
