//! inreach-cot - Garmin inReach → TAK bridge
//!
//! Polls an inReach MapShare KML feed and streams each placemark to a TAK
//! server as a Cursor-on-Target event.
//!
//! # Usage
//!
//! ```bash
//! # Run against ./config.toml
//! inreach-cot
//!
//! # Explicit config, log to a file
//! inreach-cot --config /etc/inreach-cot.toml --log-file inrtocot.log
//!
//! # One poll cycle, print events instead of sending them
//! inreach-cot --once --dry-run
//! ```
//!
//! # Environment Variables
//!
//! - `INREACH_COT_CONFIG`: Path to the TOML config (when `--config` is not given)
//! - `RUST_LOG`: Logging level (default: info)

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use inreach_cot::config::Settings;
use inreach_cot::pipeline::{outbound_queue, DeliveryPolicy, DeliveryWorker};
use inreach_cot::transport::{self, run_sender, CotTransport, StdoutTransport};
use inreach_cot::FeedClient;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "inreach-cot")]
#[command(about = "Stream Garmin inReach positions to a TAK server as CoT events")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config (default: $INREACH_COT_CONFIG, then ./config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Run a single poll cycle, deliver its events, then exit
    #[arg(long)]
    once: bool,

    /// Write events to stdout instead of the TAK server (skips the reachability check)
    #[arg(long)]
    dry_run: bool,
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    DeliveryWorker,
    TakSender,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::DeliveryWorker => write!(f, "DeliveryWorker"),
            TaskName::TakSender => write!(f, "TakSender"),
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

// ============================================================================
// Supervisor
// ============================================================================

/// Monitor tasks; the first failure cancels everything and becomes the exit error.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("Supervisor: task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("Supervisor: task failed: {:#}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Supervisor: task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        return Ok(());
                    }
                }
            }
        }
    }

    // Tasks observe the token; give them a moment to close connections.
    let drain = async {
        while let Some(result) = task_set.join_next().await {
            if let Ok(Err(e)) = result {
                warn!("Supervisor: task error during shutdown: {:#}", e);
            }
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(5), drain)
        .await
        .is_err()
    {
        warn!("Supervisor: tasks did not stop in time, aborting");
        task_set.abort_all();
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_file.as_deref())?;

    let mut settings =
        Settings::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.once {
        settings.delivery.max_cycles = Some(1);
    }

    info!("inreach-cot {}", env!("CARGO_PKG_VERSION"));

    // Transport first: a missing or unreachable server is fatal before any polling.
    let transport: Box<dyn CotTransport> = if args.dry_run {
        info!("Dry run: events go to stdout");
        Box::new(StdoutTransport::new())
    } else {
        let tak = &settings.tak_connection;
        let Some(endpoint) = tak.endpoint() else {
            anyhow::bail!("TAK server address not configured (set tak_connection.host)");
        };
        let target = tak.preflight_target(&endpoint);
        if let Err(e) = transport::probe(&target, tak.connect_timeout()).await {
            error!(endpoint = %endpoint, probed = %target, error = %e, "Pre-flight check failed");
            anyhow::bail!("TAK server offline: {e}");
        }
        transport::connect_transport(tak, &endpoint).context("Failed to set up TAK transport")?
    };

    let feed = &settings.feed;
    let client = FeedClient::new(
        &feed.url,
        &feed.username,
        &feed.password,
        feed.request_timeout(),
    )
    .context("Failed to build feed HTTP client")?;

    let (queue, rx) = outbound_queue(settings.delivery.queue_capacity);

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    let worker = DeliveryWorker::new(
        client,
        settings.event_template(),
        DeliveryPolicy::from_settings(&settings),
        queue,
        cancel_token.clone(),
    )
    .context("Invalid CoT settings")?;

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    task_set.spawn(async move {
        let report = worker.run().await?;
        info!(
            cycles = report.cycles,
            events_queued = report.events_queued,
            "Delivery worker finished ({:?})",
            report.stop_reason
        );
        Ok(TaskName::DeliveryWorker)
    });

    let sender_cancel = cancel_token.clone();
    task_set.spawn(async move {
        let sent = run_sender(rx, transport, sender_cancel).await?;
        info!(sent, "TAK sender finished");
        Ok(TaskName::TakSender)
    });

    run_supervisor(&mut task_set, cancel_token).await?;

    info!("inreach-cot shutdown complete");
    Ok(())
}
