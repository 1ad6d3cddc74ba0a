use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use video_intake::{
    build_dispatcher, Config, IntakeController, IntakeError, PgSubmissionStore, S3Uploader, StreamingUploader,
    SubmissionWorker, TelegramClient, TransportNotifier,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()
        .map_err(IntakeError::Configuration)
        .context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        dispatch = ?config.dispatch.strategy,
        "Starting video intake service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store = PgSubmissionStore::new(&config.database)
        .await
        .context("Failed to initialize submission store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let s3_uploader = Arc::new(
        S3Uploader::new(&config.s3)
            .await
            .context("Failed to initialize S3 uploader")?,
    );
    s3_uploader
        .check_bucket()
        .await
        .context("S3 bucket is not reachable")?;

    let dispatcher =
        build_dispatcher(&config.dispatch).context("Failed to initialize dispatcher")?;

    let telegram = Arc::new(
        TelegramClient::new(&config.telegram).context("Failed to initialize Telegram client")?,
    );
    let notifier = Arc::new(TransportNotifier::new(telegram.clone()));

    let uploader = StreamingUploader::new(
        s3_uploader,
        &config.s3.key_namespace,
        config.s3.part_size_bytes,
        &config.service.source_tag,
    )
    .with_chunk_idle_timeout(config.download_idle_timeout());

    let worker = SubmissionWorker::new(
        Arc::new(store),
        uploader,
        telegram.clone(),
        dispatcher,
        notifier,
    );

    let controller = Arc::new(IntakeController::new(Arc::new(worker), &config.intake));
    let shutdown = CancellationToken::new();

    // Spawn event loop task
    let intake_handle = {
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            controller.run(telegram.as_ref(), shutdown).await;
        })
    };

    info!(
        max_concurrent_tasks = config.intake.max_concurrent_tasks,
        "Intake service started successfully"
    );

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down intake service");

    shutdown.cancel();
    if let Err(e) = intake_handle.await {
        error!(error = %e, "Intake loop terminated abnormally");
    }

    if !controller.drain().await {
        warn!(
            grace_secs = config.shutdown_grace().as_secs(),
            "Shutdown grace period elapsed with submissions still running"
        );
    }

    info!("Intake service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
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
