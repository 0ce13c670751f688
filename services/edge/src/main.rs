//! Doorcam edge agent binary.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with EDGE_)
//!
//! Send `SIGUSR1` to pause motion alerts (a second signal resumes early).

#[cfg(unix)]
use doorcam_edge::agent::OperatorCommand;
use doorcam_edge::agent::{AgentStats, EdgeAgent, EdgeComponents};
use doorcam_edge::api_client::HttpEventApi;
use doorcam_edge::config::{self, EdgeConfig};
use doorcam_edge::scheduler::RecurringTask;
use doorcam_edge::sources::{
    FileFrameSource, FrameSource, LogAlertSink, SimulatedFrameSource, SimulatedSensor,
};

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
#[cfg(unix)]
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "doorcam-edge",
        version = env!("CARGO_PKG_VERSION"),
        device_id = %config.device.device_id,
        "Starting doorcam edge agent"
    );

    // Validate configuration
    config.validate()?;

    let components = build_components(&config)?;
    let cancel = CancellationToken::new();

    let agent = EdgeAgent::start(&config, components, cancel.clone())
        .context("Failed to open spool")?;

    #[cfg(unix)]
    let pause_handle = spawn_pause_listener(agent.commands(), cancel.clone())?;

    let stats_handle = RecurringTask::new(
        "stats-report",
        Duration::from_secs(config.health.interval_secs),
        cancel.clone(),
    )
    .spawn({
        let stats = agent.stats_probe();
        move || {
            let snapshot = stats();
            async move { log_stats(&snapshot, "Edge agent stats") }
        }
    });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Initiating graceful shutdown...");
        }
        _ = cancel.cancelled() => {
            error!("Agent stopped itself after a fatal error");
        }
    }

    let final_stats = agent.shutdown().await;
    let _ = stats_handle.await;
    #[cfg(unix)]
    pause_handle.abort();

    info!("=== Final Statistics ===");
    log_stats(&final_stats, "Edge agent final stats");

    if final_stats.spool.depth() > 0 {
        warn!(
            pending = final_stats.spool.depth(),
            "Undelivered jobs remain in the spool; they will be retried on next start"
        );
    }

    info!("Shutdown complete");
    Ok(())
}

/// Load configuration.
fn load_config() -> anyhow::Result<EdgeConfig> {
    // Try loading from files first, fall back to environment
    let config = EdgeConfig::load().or_else(|e| {
        eprintln!("Failed to load config from files ({}), trying environment", e);
        EdgeConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("doorcam_edge={}", level).parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Build the sensor, frame source, alert sink and API client from config.
fn build_components(config: &EdgeConfig) -> anyhow::Result<EdgeComponents> {
    let sensor = Box::new(SimulatedSensor::new(
        Duration::from_millis(config.sources.frame_interval_ms),
        Duration::from_secs(config.sources.simulated_interval_secs),
        config.motion.sensitivity,
        config.motion.min_area,
    ));

    let frame_source: Arc<dyn FrameSource> = match (
        config.sources.frame_mode.as_str(),
        &config.sources.snapshot_path,
    ) {
        ("file", Some(path)) => {
            info!(path = %path, "Serving snapshots from file");
            Arc::new(FileFrameSource::new(path, config.capture.format.clone()))
        }
        _ => {
            info!("Using simulated frame source");
            Arc::new(SimulatedFrameSource)
        }
    };

    let api = HttpEventApi::new(&config.upload, &config.device)
        .context("Failed to build event API client")?;

    Ok(EdgeComponents {
        sensor,
        frame_source,
        alert_sink: Arc::new(LogAlertSink),
        api: Arc::new(api),
    })
}

fn log_stats(stats: &AgentStats, message: &str) {
    info!(
        frames = stats.trigger.frames_observed,
        triggers = stats.trigger.triggers,
        suppressed = stats.trigger.suppressed,
        captured = stats.capture.captured,
        abandoned = stats.capture.abandoned,
        delivered = stats.upload.delivered,
        retries = stats.upload.retries,
        dead_lettered = stats.upload.dead_lettered,
        spool_pending = stats.spool.pending,
        spool_dead = stats.spool.dead,
        "{}",
        message
    );
}

/// Forward SIGUSR1 to the agent as a pause command.
#[cfg(unix)]
fn spawn_pause_listener(
    commands: mpsc::Sender<OperatorCommand>,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut usr1 = signal::unix::signal(signal::unix::SignalKind::user_defined1())
        .context("Failed to install SIGUSR1 handler")?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = usr1.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received SIGUSR1, toggling pause");
                    if commands.send(OperatorCommand::Pause).await.is_err() {
                        break;
                    }
                }
            }
        }
    }))
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
