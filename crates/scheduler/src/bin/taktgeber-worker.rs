//! taktgeber-worker: runs the background scheduler in its own process.
//!
//! Registers the platform's housekeeping tasks:
//! - `heartbeat` (periodic, low): liveness log line
//! - `flag-sweep` (periodic, medium): publishes `chat.message.flagged` for
//!   conversations awaiting review
//! - `risk-rescan` (event, high): re-scores a flagged conversation
//!
//! SIGINT/SIGTERM trigger a graceful interrupt.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use taktgeber_bus::{EventPublisher, LocalBus, Message};
use taktgeber_scheduler::{
    CancellationToken, Priority, Scheduler, SchedulerConfig, TaskDefinition, TaskError,
};

const FLAGGED_TOPIC: &str = "chat.message.flagged";

// ── CLI ─────────────────────────────────────────────────────────────

/// Background task scheduler worker.
#[derive(Parser, Debug)]
#[command(name = "taktgeber-worker", version, about)]
struct Cli {
    /// Path to taktgeber.toml config file.
    #[arg(long, env = "TAKTGEBER_CONFIG", default_value = "config/taktgeber.toml")]
    config: PathBuf,

    /// Heartbeat interval in seconds.
    #[arg(long, env = "TAKTGEBER_HEARTBEAT_INTERVAL", default_value_t = 30)]
    heartbeat_interval: u64,

    /// Flag sweep interval in seconds.
    #[arg(long, env = "TAKTGEBER_SWEEP_INTERVAL", default_value_t = 15)]
    sweep_interval: u64,

    /// Override the shutdown grace period (milliseconds).
    #[arg(long)]
    grace_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FlaggedConversation {
    tenant: String,
    conversation_id: u64,
}

// ── Tasks ───────────────────────────────────────────────────────────

fn heartbeat(interval: Duration) -> TaskDefinition {
    TaskDefinition::periodic("heartbeat", interval, Priority::Low, |_| async {
        info!("scheduler alive");
        Ok(())
    })
}

fn flag_sweep(interval: Duration, bus: LocalBus) -> TaskDefinition {
    TaskDefinition::periodic("flag-sweep", interval, Priority::Medium, move |_| {
        let bus = bus.clone();
        async move {
            let event = FlaggedConversation {
                tenant: "default".into(),
                conversation_id: rand::random::<u32>() as u64,
            };
            let msg = Message::new(FLAGGED_TOPIC, &event)
                .map_err(|e| TaskError::permanent(format!("encode flagged event: {e}")))?;
            bus.publish(msg)
                .await
                .map_err(|e| TaskError::transient(e.to_string()))
        }
    })
    .with_max_retries(2)
}

fn risk_rescan() -> TaskDefinition {
    TaskDefinition::on_event(
        "risk-rescan",
        FLAGGED_TOPIC,
        Priority::High,
        |token: CancellationToken| async move {
            tokio::select! {
                _ = token.cancelled() => Err(TaskError::transient("rescan cancelled")),
                _ = tokio::time::sleep(Duration::from_millis(250)) => {
                    info!("rescan complete");
                    Ok(())
                }
            }
        },
    )
    .with_timeout(Duration::from_secs(10))
    .with_max_retries(5)
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taktgeber_core::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match SchedulerConfig::from_file(&cli.config) {
        Ok(cfg) => {
            info!(path = %cli.config.display(), "loaded scheduler config");
            cfg
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %cli.config.display(),
                "failed to load config, using defaults"
            );
            SchedulerConfig::from_env()?
        }
    };
    if let Some(grace_ms) = cli.grace_ms {
        config.shutdown.grace_period_ms = grace_ms;
    }
    config.log_summary();

    let bus = LocalBus::default();
    let mut scheduler = Scheduler::new(config).with_event_subscriber(Arc::new(bus.subscriber()));
    scheduler.schedule(heartbeat(Duration::from_secs(cli.heartbeat_interval)))?;
    scheduler.schedule(flag_sweep(Duration::from_secs(cli.sweep_interval), bus.clone()))?;
    scheduler.schedule(risk_rescan())?;

    let handle = scheduler.start().await?;
    info!("taktgeber-worker running");

    shutdown_signal().await?;

    let report = handle.interrupt().await;
    let metrics = handle.metrics();
    info!(
        drained = report.drained,
        discarded = report.discarded,
        executed = metrics.tasks_executed.values().sum::<u64>(),
        dead_lettered = metrics.dead_lettered,
        "taktgeber-worker exited"
    );
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received ctrl-c");
        Ok(())
    }
}
