//! Telemetry Server - Main Entry Point

use server::{init_logging, init_metrics, run, Settings};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    init_logging(&settings.log)?;

    info!("=== Telemetry Server v{} ===", env!("CARGO_PKG_VERSION"));
    init_metrics(&settings.metrics)?;

    run(settings).await
}
