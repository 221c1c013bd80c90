//! Idle Model Bundle

use crate::forest::{ForestConfig, IsolationForest};
use crate::InferenceError;
use chrono::Utc;
use feature_engine::{FeatureEncoder, FeatureWindow, StandardScaler};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Artifact format version, bumped on any layout change
pub const MODEL_FORMAT_VERSION: u16 = 1;

/// Operating mode the model describes
pub const MODEL_MODE: &str = "idle";

/// Outcome of scoring a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Normal,
    Anomalous,
}

/// Score of one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub decision: Decision,
    /// Distance from the decision threshold; negative is anomalous
    pub score: f64,
    /// Raw forest score in [-1, 0]; lower is more abnormal
    pub anomaly_score: f64,
    /// Rows in the scored window
    pub rows: usize,
}

/// Frozen scaler plus outlier model for one vehicle's idle behavior.
///
/// Immutable once trained; retraining produces a new bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleModel {
    pub format_version: u16,
    pub vehicle_id: String,
    pub brand: String,
    pub mode: String,
    pub trained_rows: usize,
    pub trained_at_ms: i64,
    pub scaler: StandardScaler,
    pub forest: IsolationForest,
}

impl IdleModel {
    /// Fit a model on a cleaned warm-idle window.
    ///
    /// The whole window is reduced to one aggregate vector and the forest is
    /// fit on that single vector: the model captures one baseline signature
    /// of this vehicle idling.
    pub fn train(
        vehicle_id: &str,
        brand: &str,
        window: &FeatureWindow,
        config: &ForestConfig,
    ) -> Result<Self, InferenceError> {
        let (scaler, vector) = FeatureEncoder::fit(window)?;
        let forest = IsolationForest::fit(&[vector.values], config)?;

        info!(
            "Trained idle model for vehicle {} ({}) on {} rows",
            vehicle_id,
            brand,
            window.len()
        );

        Ok(Self {
            format_version: MODEL_FORMAT_VERSION,
            vehicle_id: vehicle_id.to_string(),
            brand: brand.to_string(),
            mode: MODEL_MODE.to_string(),
            trained_rows: window.len(),
            trained_at_ms: Utc::now().timestamp_millis(),
            scaler,
            forest,
        })
    }

    /// Score a window using the training scaler
    pub fn score_window(&self, window: &FeatureWindow) -> Result<AnomalyScore, InferenceError> {
        let vector = FeatureEncoder::encode(&self.scaler, window)?;
        let anomaly_score = self.forest.score_samples(vector.as_slice())?;
        let score = self.forest.decision_function(vector.as_slice())?;

        Ok(AnomalyScore {
            decision: if score < 0.0 {
                Decision::Anomalous
            } else {
                Decision::Normal
            },
            score,
            anomaly_score,
            rows: vector.rows,
        })
    }

    /// Serialize to the artifact format
    pub fn to_bytes(&self) -> Result<Vec<u8>, InferenceError> {
        postcard::to_allocvec(self).map_err(|e| InferenceError::Artifact(e.to_string()))
    }

    /// Deserialize from the artifact format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InferenceError> {
        let model: Self =
            postcard::from_bytes(bytes).map_err(|e| InferenceError::Artifact(e.to_string()))?;
        if model.format_version != MODEL_FORMAT_VERSION {
            return Err(InferenceError::Artifact(format!(
                "unsupported model format version {} (expected {})",
                model.format_version, MODEL_FORMAT_VERSION
            )));
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use feature_engine::{WindowRow, FEATURE_DIMENSION};

    fn idle_window(n: usize, jitter: f64) -> FeatureWindow {
        let t0 = Utc::now();
        let rows = (0..n)
            .map(|i| {
                let wobble = (i % 5) as f64 * jitter;
                WindowRow::new(
                    t0 + Duration::seconds(i as i64),
                    [1450.0 + wobble * 10.0, 20.0 + wobble, 0.0, -1.5, 88.0 + wobble, 13.6],
                )
            })
            .collect();
        FeatureWindow::from_rows("4", rows)
    }

    #[test]
    fn test_train_fits_one_aggregate_vector() {
        let model = IdleModel::train("4", "yamaha_nmax", &idle_window(70, 1.0), &ForestConfig::default()).unwrap();

        assert_eq!(model.trained_rows, 70);
        assert_eq!(model.mode, "idle");
        assert_eq!(model.forest.n_features(), FEATURE_DIMENSION);
        assert_eq!(model.scaler.samples_seen(), 70);
        // One training vector: the contamination offset is the single training score.
        assert_eq!(model.forest.offset(), -0.5);
    }

    #[test]
    fn test_scoring_uses_training_scaler() {
        let model = IdleModel::train("4", "yamaha_nmax", &idle_window(70, 1.0), &ForestConfig::default()).unwrap();
        let score = model.score_window(&idle_window(30, 3.0)).unwrap();

        assert_eq!(score.rows, 30);
        assert_eq!(score.decision, Decision::Normal);
        assert!(score.anomaly_score <= 0.0 && score.anomaly_score >= -1.0);
    }

    #[test]
    fn test_artifact_roundtrip_and_version_check() {
        let model = IdleModel::train("4", "honda", &idle_window(60, 0.5), &ForestConfig::default()).unwrap();
        let bytes = model.to_bytes().unwrap();
        assert_eq!(IdleModel::from_bytes(&bytes).unwrap(), model);

        let mut future = model.clone();
        future.format_version = MODEL_FORMAT_VERSION + 1;
        let bytes = future.to_bytes().unwrap();
        assert!(matches!(IdleModel::from_bytes(&bytes), Err(InferenceError::Artifact(_))));

        assert!(IdleModel::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_empty_window_cannot_be_scored() {
        let model = IdleModel::train("4", "honda", &idle_window(60, 0.5), &ForestConfig::default()).unwrap();
        let empty = FeatureWindow::from_rows("4", Vec::<WindowRow>::new());
        assert!(matches!(
            model.score_window(&empty),
            Err(InferenceError::Feature(feature_engine::FeatureError::InsufficientData { rows: 0, .. }))
        ));
    }
}
