use anyhow::{Context, Result};
use doorcam_events::api::start_api_server;
use doorcam_events::inference::InferenceSettings;
use doorcam_events::{
    AppState, Config, EventLifecycle, EventStore, ExpirySweeper, HttpDetector, InferenceWorker,
    LifecycleSettings, ObjectStorage, PgEventStore, S3ObjectStorage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting Doorcam Event Service"
    );

    init_metrics(config.service.metrics_port)?;

    let pg_store = PgEventStore::new(&config.database)
        .await
        .context("Failed to initialize event store")?;

    if config.database.run_migrations {
        pg_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let store: Arc<dyn EventStore> = Arc::new(pg_store);

    for device in &config.devices {
        store
            .upsert_device(&device.device_id, device.name.as_deref(), &device.api_key_hash)
            .await
            .with_context(|| format!("Failed to register device {}", device.device_id))?;
        info!(device_id = %device.device_id, "Registered device");
    }

    let s3 = S3ObjectStorage::new(&config.s3)
        .await
        .context("Failed to initialize object storage")?;

    // A missing bucket only breaks uploads; keep serving reads.
    if config.s3.create_bucket {
        if let Err(e) = s3.ensure_bucket().await {
            warn!(bucket = %s3.bucket(), error = %e, "Could not ensure bucket exists");
        }
    }

    let storage: Arc<dyn ObjectStorage> = Arc::new(s3);

    let lifecycle = Arc::new(EventLifecycle::new(
        store.clone(),
        storage.clone(),
        LifecycleSettings::from(&config),
    ));

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let sweeper = Arc::new(ExpirySweeper::from_config(
        &config,
        store.clone(),
        storage.clone(),
    ));
    tasks.push(sweeper.spawn(config.sweep_interval(), cancel.clone()));

    if config.inference.enabled {
        if let Some(url) = &config.inference.detector_url {
            let detector = HttpDetector::new(
                url.clone(),
                Duration::from_secs(config.inference.request_timeout_secs),
            )
            .context("Failed to build detector client")?;

            let worker = Arc::new(InferenceWorker::new(
                store.clone(),
                storage.clone(),
                Arc::new(detector),
                InferenceSettings::from_config(&config.inference, config.read_url_expiry()),
            ));
            tasks.push(worker.spawn(
                Duration::from_secs(config.inference.poll_interval_secs),
                cancel.clone(),
            ));
            info!(detector_url = %url, "Inference dispatch enabled");
        }
    } else {
        info!("Inference dispatch disabled");
    }

    let api_state = AppState { lifecycle };
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_cancel).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Event service started successfully");

    shutdown_signal().await;

    info!("Shutting down event service");

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    if tokio::time::timeout(Duration::from_secs(10), api_handle)
        .await
        .is_err()
    {
        warn!("API server did not drain in time");
    }

    info!("Event service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
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
