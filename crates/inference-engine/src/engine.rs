//! Anomaly Detector
//!
//! Train and score operations over the window extractor and model registry.

use crate::forest::ForestConfig;
use crate::model::{Decision, IdleModel};
use crate::registry::ModelRegistry;
use crate::InferenceError;
use feature_engine::{FeatureWindow, WindowExtractor};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use storage::TelemetryStore;
use tracing::{debug, info};

/// Default training look-back: 30 days
pub const DEFAULT_TRAIN_MINUTES: u64 = 43_200;

/// Default scoring look-back
pub const DEFAULT_SCORE_MINUTES: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainRequest {
    pub vehicle_id: String,
    pub brand: String,
    pub minutes: u64,
}

/// Outcome of a successful training run
#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub vehicle_id: String,
    pub brand: String,
    /// Warm-idle rows the model was fit on
    pub rows: usize,
    pub artifact: PathBuf,
    pub trained_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub vehicle_id: String,
    pub brand: String,
    /// Caller's model label, echoed on the report
    pub model_name: String,
}

/// Where the scored window comes from
#[derive(Debug, Clone)]
pub enum WindowSource {
    /// Recent samples from the store
    Store { minutes: u64 },
    /// A window the caller already holds (uploads, replays)
    Supplied(FeatureWindow),
}

/// Outcome of scoring one window
#[derive(Debug, Clone, Serialize)]
pub struct ScoreReport {
    pub vehicle_id: String,
    pub brand: String,
    pub model_name: String,
    pub decision: Decision,
    pub score: f64,
    pub anomaly_score: f64,
    pub rows: usize,
    pub artifact: PathBuf,
}

/// Trains and scores per-vehicle idle models
pub struct AnomalyDetector<S> {
    extractor: WindowExtractor<S>,
    registry: ModelRegistry,
    forest: ForestConfig,
}

impl<S: TelemetryStore> AnomalyDetector<S> {
    pub fn new(extractor: WindowExtractor<S>, registry: ModelRegistry, forest: ForestConfig) -> Self {
        info!(
            "Creating anomaly detector (models at {}, {} trees)",
            registry.root().display(),
            forest.n_estimators
        );
        Self {
            extractor,
            registry,
            forest,
        }
    }

    pub fn extractor(&self) -> &WindowExtractor<S> {
        &self.extractor
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Fit a new model on the warm-idle rows of the last `minutes` and persist it.
    pub async fn train(&self, request: TrainRequest) -> Result<TrainReport, InferenceError> {
        // Reject bad keys before touching the store
        self.registry.artifact_path(&request.brand, &request.vehicle_id)?;

        let window = self
            .extractor
            .fetch_training_window(&request.vehicle_id, request.minutes)
            .await?;

        let registry = self.registry.clone();
        let forest = self.forest.clone();
        let (vehicle_id, brand) = (request.vehicle_id.clone(), request.brand.clone());
        let (model, artifact) = tokio::task::spawn_blocking(move || {
            let model = IdleModel::train(&vehicle_id, &brand, &window, &forest)?;
            let artifact = registry.save(&model)?;
            Ok::<_, InferenceError>((model, artifact))
        })
        .await
        .map_err(|e| InferenceError::Task(e.to_string()))??;

        info!(
            "Model for vehicle {} ({}) trained on {} rows -> {}",
            request.vehicle_id,
            request.brand,
            model.trained_rows,
            artifact.display()
        );

        Ok(TrainReport {
            vehicle_id: request.vehicle_id,
            brand: request.brand,
            rows: model.trained_rows,
            artifact,
            trained_at_ms: model.trained_at_ms,
        })
    }

    /// Score a window against the persisted model for (brand, vehicle).
    ///
    /// The model is loaded first, so a missing artifact is reported before
    /// any store query runs.
    pub async fn score(&self, request: ScoreRequest, source: WindowSource) -> Result<ScoreReport, InferenceError> {
        let artifact = self.registry.artifact_path(&request.brand, &request.vehicle_id)?;
        let registry = self.registry.clone();
        let (brand, vehicle_id) = (request.brand.clone(), request.vehicle_id.clone());
        let model = tokio::task::spawn_blocking(move || registry.load(&brand, &vehicle_id))
            .await
            .map_err(|e| InferenceError::Task(e.to_string()))??;

        let window = match source {
            WindowSource::Store { minutes } => {
                self.extractor
                    .fetch_full_window(&request.vehicle_id, minutes)
                    .await?
            }
            WindowSource::Supplied(window) => {
                debug!(
                    "Scoring supplied window of {} rows for vehicle {}",
                    window.len(),
                    request.vehicle_id
                );
                window
            }
        };

        let result = model.score_window(&window)?;
        info!(
            "Vehicle {} scored {:?} (score {:.4}, {} rows)",
            request.vehicle_id, result.decision, result.score, result.rows
        );

        Ok(ScoreReport {
            vehicle_id: request.vehicle_id,
            brand: request.brand,
            model_name: request.model_name,
            decision: result.decision,
            score: result.score,
            anomaly_score: result.anomaly_score,
            rows: result.rows,
            artifact,
        })
    }
}
