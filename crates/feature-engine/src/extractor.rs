//! Feature Window Extractor

use crate::report::ChannelReport;
use crate::window::FeatureWindow;
use crate::FeatureError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use storage::{SampleQuery, SortOrder, TelemetryStore};
use telemetry::{Channel, TelemetrySample};
use tracing::{debug, info, warn};

/// Extractor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Row cap for live windows
    pub live_limit: usize,
    /// Row cap for aggregate reports
    pub report_limit: usize,
    /// Upper bound on a single store query (milliseconds)
    pub query_timeout_ms: u64,
    /// Minimum warm-idle rows required to train
    pub min_training_rows: usize,
    /// Coolant temperature band (°C) considered warm idle
    pub idle_coolant_band: (f64, f64),
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            live_limit: 100,
            report_limit: 1000,
            query_timeout_ms: 10_000,
            min_training_rows: 60,
            idle_coolant_band: (70.0, 105.0),
        }
    }
}

/// Pulls samples from the store and shapes them into cleaned windows.
///
/// Store failures never leave this type as storage errors; they surface as
/// `FeatureError::DataSource`.
pub struct WindowExtractor<S> {
    store: Arc<S>,
    config: ExtractorConfig,
}

impl<S: TelemetryStore> WindowExtractor<S> {
    /// Create an extractor over `store`
    pub fn new(store: Arc<S>, config: ExtractorConfig) -> Self {
        info!("Creating window extractor with config: {:?}", config);
        Self { store, config }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Run one store query under the configured timeout
    pub async fn fetch_samples(&self, query: SampleQuery) -> Result<Vec<TelemetrySample>, FeatureError> {
        let timeout = Duration::from_millis(self.config.query_timeout_ms);
        match tokio::time::timeout(timeout, self.store.query_samples(&query)).await {
            Ok(Ok(samples)) => Ok(samples),
            Ok(Err(e)) => {
                warn!("Store query failed for vehicle {}: {}", query.vehicle_id, e);
                Err(FeatureError::DataSource(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "Store query for vehicle {} timed out after {}ms",
                    query.vehicle_id, self.config.query_timeout_ms
                );
                Err(FeatureError::DataSource(format!(
                    "query timed out after {}ms",
                    self.config.query_timeout_ms
                )))
            }
        }
    }

    /// Live view: newest samples of the last `minutes`, capped, cleaned.
    pub async fn fetch_window(&self, vehicle_id: &str, minutes: u64) -> Result<FeatureWindow, FeatureError> {
        self.fetch(vehicle_id, minutes, Some(self.config.live_limit)).await
    }

    /// Every sample of the last `minutes`, cleaned.
    pub async fn fetch_full_window(&self, vehicle_id: &str, minutes: u64) -> Result<FeatureWindow, FeatureError> {
        self.fetch(vehicle_id, minutes, None).await
    }

    async fn fetch(
        &self,
        vehicle_id: &str,
        minutes: u64,
        limit: Option<usize>,
    ) -> Result<FeatureWindow, FeatureError> {
        let mut query = SampleQuery::recent(vehicle_id, minutes);
        query.limit = limit;

        let samples = self.fetch_samples(query).await?;
        let fetched = samples.len();
        let window = FeatureWindow::from_samples(vehicle_id, samples);

        debug!(
            "Window for vehicle {} over {} min: {} fetched, {} after cleaning",
            vehicle_id,
            minutes,
            fetched,
            window.len()
        );
        Ok(window)
    }

    /// Training window: warm-idle rows only, at least `min_training_rows` of them.
    pub async fn fetch_training_window(
        &self,
        vehicle_id: &str,
        minutes: u64,
    ) -> Result<FeatureWindow, FeatureError> {
        let query = SampleQuery::recent(vehicle_id, minutes).with_order(SortOrder::Ascending);
        let samples = self.fetch_samples(query).await?;
        let fetched = samples.len();

        let (low, high) = self.config.idle_coolant_band;
        let window = FeatureWindow::from_samples(vehicle_id, samples)
            .retain_band(Channel::CoolantTemp, low, high);

        info!(
            "Training window for vehicle {}: {} fetched, {} warm-idle rows ({}-{} °C)",
            vehicle_id,
            fetched,
            window.len(),
            low,
            high
        );

        if window.len() < self.config.min_training_rows {
            return Err(FeatureError::InsufficientData {
                rows: window.len(),
                required: self.config.min_training_rows,
            });
        }
        Ok(window)
    }

    /// Channel means over the newest `report_limit` samples of the last `minutes`
    pub async fn channel_report(&self, vehicle_id: &str, minutes: u64) -> Result<ChannelReport, FeatureError> {
        let query = SampleQuery::recent(vehicle_id, minutes).with_limit(self.config.report_limit);
        let samples = self.fetch_samples(query).await?;
        Ok(ChannelReport::from_samples(vehicle_id, &samples))
    }
}
