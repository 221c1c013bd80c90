//! Telemetry Control-Plane Service
//!
//! Wires the store, acquisition supervisor, anomaly detector and command bus
//! into one process driven by MQTT commands.

mod settings;

pub use settings::{LogSettings, MetricsSettings, ModelSettings, Settings, StoreSettings, DEFAULT_CONFIG_PATH};

use acquisition_supervisor::Supervisor;
use anyhow::Context;
use command_dispatcher::{CommandBus, Dispatcher};
use feature_engine::{ExtractorConfig, WindowExtractor};
use inference_engine::{AnomalyDetector, ModelRegistry};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use storage::{SqliteStore, TelemetryStore};
use telemetry::{LiveCache, TelemetrySample};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Worker samples buffered ahead of the store
const INGEST_QUEUE: usize = 1024;

const INGEST_DRAIN: Duration = Duration::from_secs(2);

/// Initialize logging
pub fn init_logging(settings: &LogSettings) -> anyhow::Result<()> {
    let level: Level = settings
        .level
        .parse()
        .with_context(|| format!("invalid log level '{}'", settings.level))?;

    let builder = FmtSubscriber::builder().with_max_level(level).with_target(true);
    let installed = if settings.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.context("failed to set tracing subscriber")
}

/// Install the Prometheus exporter when a listen address is configured
pub fn init_metrics(settings: &MetricsSettings) -> anyhow::Result<()> {
    if let Some(addr) = settings.listen {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Serving metrics on http://{}/metrics", addr);
    }
    Ok(())
}

/// Persist worker samples until every sender is dropped
pub async fn run_ingest<S: TelemetryStore>(store: Arc<S>, mut samples: mpsc::Receiver<TelemetrySample>) {
    let mut stored = 0u64;
    while let Some(sample) = samples.recv().await {
        match store.insert_sample(&sample).await {
            Ok(()) => stored += 1,
            Err(e) => warn!("Dropping sample for vehicle {}: {}", sample.vehicle_id, e),
        }
    }
    info!("Ingest stopped after {} samples", stored);
}

/// Run the service until Ctrl-C
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let store = Arc::new(
        SqliteStore::connect(&settings.store.database_url)
            .await
            .with_context(|| format!("failed to open store {}", settings.store.database_url))?,
    );

    let (sample_tx, sample_rx) = mpsc::channel(INGEST_QUEUE);
    let ingest = tokio::spawn(run_ingest(Arc::clone(&store), sample_rx));

    let supervisor = Arc::new(
        Supervisor::new(settings.worker.clone(), LiveCache::new()).with_sample_sink(sample_tx),
    );

    let extractor = WindowExtractor::new(
        Arc::clone(&store),
        ExtractorConfig {
            query_timeout_ms: settings.store.query_timeout_ms,
            ..Default::default()
        },
    );
    let detector = AnomalyDetector::new(
        extractor,
        ModelRegistry::new(&settings.models.root),
        settings.models.forest.clone(),
    );
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&supervisor), detector));

    CommandBus::new(settings.mqtt.clone(), dispatcher)
        .run(shutdown_signal())
        .await;

    match supervisor.stop().await {
        Ok(outcome) if outcome.stopped_anything() => info!("Acquisition worker stopped: {:?}", outcome),
        Ok(_) => {}
        Err(e) => error!("Failed to stop acquisition worker on shutdown: {}", e),
    }

    // Output readers hold the remaining senders and finish once the worker's pipes close.
    drop(supervisor);
    match tokio::time::timeout(INGEST_DRAIN, ingest).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Ingest task failed: {}", e),
        Err(_) => warn!("Ingest still draining after {:?}; abandoning", INGEST_DRAIN),
    }
    store.close().await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received"),
        Err(e) => {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
