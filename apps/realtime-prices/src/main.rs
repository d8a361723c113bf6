//! Realtime Prices Binary
//!
//! Runs the price simulator and logs every sample it produces.
//!
//! # Usage
//!
//! ```bash
//! PRICE_SIM_MINTS=mint-A,mint-B cargo run --bin realtime-prices
//! ```
//!
//! # Environment Variables
//!
//! - `PRICE_SIM_INTERVAL_MS`: Tick period in milliseconds (default: 3000)
//! - `PRICE_SIM_BROADCAST_CAPACITY`: Broadcast channel capacity (default: 1024)
//! - `PRICE_SIM_MINTS`: Comma-separated mints to track (default: none)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: realtime-prices)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use realtime_prices::infrastructure::telemetry;
use realtime_prices::{PriceService, PriceWatch, SimulatorConfig, init_metrics};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (tracing + optional OTLP)
    let telemetry_guard = telemetry::init();

    tracing::info!(
        otlp_export = telemetry_guard.is_exporting(),
        "Starting price simulator"
    );

    let metrics_handle = init_metrics()?;

    let config = SimulatorConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let service = PriceService::start(&config)?;

    if config.mints.is_empty() {
        tracing::warn!("PRICE_SIM_MINTS is empty, no prices will be generated");
    }
    for mint in &config.mints {
        service.track(mint);
    }

    // Watch the configured mints the way a UI component would
    let watch = service.watch(config.mints.iter().cloned());

    // Spawn sample logger
    let logger = tokio::spawn(log_samples(Arc::clone(&service), shutdown_token.clone()));

    // Spawn watch reporter
    let reporter = tokio::spawn(report_watch(watch, shutdown_token.clone()));

    tracing::info!(mints = config.mints.len(), "Price simulator ready");

    await_shutdown(shutdown_token).await;

    service.destroy();
    let _ = logger.await;
    let _ = reporter.await;

    tracing::debug!(metrics = %metrics_handle.render(), "Final metrics");
    tracing::info!(stats = ?service.stats(), "Price simulator stopped");
    Ok(())
}

/// Log every sample from the broadcast channel as JSON.
async fn log_samples(service: Arc<PriceService>, shutdown_token: CancellationToken) {
    let mut rx = service.receiver();
    drop(service);

    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            result = rx.recv() => match result {
                Ok(sample) => match serde_json::to_string(&sample) {
                    Ok(json) => tracing::info!(sample = %json, "Price update"),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize sample"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Sample logger lagged behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    tracing::debug!("Sample logger stopped");
}

/// Log each change seen by a watch until shutdown.
async fn report_watch(watch: PriceWatch, shutdown_token: CancellationToken) {
    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            changed = watch.changed() => {
                if !changed {
                    break;
                }
                for mint in watch.mints() {
                    if let Some(sample) = watch.price(&mint) {
                        tracing::debug!(
                            consumer = watch.consumer_id(),
                            mint = %sample.mint,
                            price = sample.price,
                            change_pct = sample.change_pct,
                            up = sample.is_up(),
                            "Watch updated"
                        );
                    }
                }
            }
        }
    }

    watch.detach();
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &SimulatorConfig) {
    tracing::info!(
        tick_interval_ms = u64::try_from(config.scheduler.tick_interval.as_millis())
            .unwrap_or(u64::MAX),
        channel_capacity = config.broadcast.channel_capacity,
        mints = ?config.mints,
        "Configuration loaded"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
