//! CLI Entry Point for live-telemetry
//!
//! Provides command-line access to:
//! - Running a live session against a telemetry stream and printing snapshots
//! - Decoding raw frames from stdin (one per line) for diagnostics
//!
//! # Usage
//!
//! Watch a stream:
//! ```bash
//! LIVE_TELEMETRY_TOKEN=... live-telemetry watch --device dev-01
//! ```
//!
//! Decode captured frames:
//! ```bash
//! live-telemetry decode < frames.jsonl
//! ```
//!
//! `--no-ansi` and `--span-events` adjust the configured log output.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use live_telemetry::auth::SharedToken;
use live_telemetry::codec::{decode_frame, FrameEvent};
use live_telemetry::config::{LiveConfig, DEFAULT_CONFIG_PATH};
use live_telemetry::logging::{self, LoggingConfig};
use live_telemetry::session::{DashboardSnapshot, LiveSession};
use live_telemetry::AppResult;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Environment variable holding the bearer token.
const TOKEN_ENV: &str = "LIVE_TELEMETRY_TOKEN";

#[derive(Parser)]
#[command(name = "live-telemetry")]
#[command(about = "Real-time device telemetry ingestion", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Disable colored log output
    #[arg(long, global = true)]
    no_ansi: bool,

    /// Log span close events with their timings
    #[arg(long, global = true)]
    span_events: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a live session and print dashboard snapshots
    Watch {
        /// Bearer token (defaults to $LIVE_TELEMETRY_TOKEN)
        #[arg(long)]
        token: Option<String>,

        /// Device the polling fallback follows
        #[arg(long)]
        device: Option<String>,

        /// Print snapshots as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Decode frames from stdin, one per line, and print the result as JSON
    Decode,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LiveConfig::load_validated(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let settings = LoggingConfig::from_live_config(&config)?
        .with_ansi(!cli.no_ansi)
        .with_span_events(cli.span_events);
    logging::init(settings)?;

    match cli.command {
        Commands::Watch {
            token,
            device,
            json,
        } => watch(&config, token, device, json).await?,
        Commands::Decode => decode_stdin().await?,
    }
    Ok(())
}

async fn watch(
    config: &LiveConfig,
    token: Option<String>,
    device: Option<String>,
    as_json: bool,
) -> AppResult<()> {
    let shared = SharedToken::new();
    if let Some(token) = token.or_else(|| std::env::var(TOKEN_ENV).ok()) {
        shared.set(token);
    }

    let session = LiveSession::from_config(config, Arc::new(shared));
    let mut handle = session.start()?;
    if device.is_some() {
        handle.select_device(device);
    }

    let mut snapshots = handle.subscribe_snapshots();
    let mut last_line = String::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let line = if as_json {
                    serde_json::to_string(&snapshot)?
                } else {
                    summary(&snapshot)
                };
                if line != last_line {
                    println!("{line}");
                    last_line = line;
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn summary(snapshot: &DashboardSnapshot) -> String {
    let latest = snapshot.latest.as_ref().map_or_else(
        || "no data".to_string(),
        |r| {
            let ts = r
                .device_timestamp
                .as_ref()
                .map_or_else(|| "--".to_string(), |t| t.display());
            format!("{} @ {} heading {:.1}°", r.device_id, ts, r.heading_degrees)
        },
    );
    let error = snapshot
        .last_error
        .as_deref()
        .map(|e| format!(" | error: {e}"))
        .unwrap_or_default();
    format!(
        "[{}] {} | {} | history {}{}",
        snapshot.connection.label(),
        latest,
        snapshot.calibration.label(),
        snapshot.history.len(),
        error
    )
}

async fn decode_stdin() -> AppResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let output = match decode_frame(&line) {
            FrameEvent::Telemetry(record) => json!({ "kind": "telemetry", "record": record }),
            FrameEvent::TrainingStats(stats) => json!({ "kind": "training_live", "stats": stats }),
            FrameEvent::Discard(reason) => json!({ "kind": "discard", "reason": reason.to_string() }),
        };
        println!("{output}");
    }
    Ok(())
}
