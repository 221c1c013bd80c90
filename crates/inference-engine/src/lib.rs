//! Idle Anomaly Inference Engine
//!
//! Trains and scores a per-vehicle outlier model. A model is a frozen
//! `StandardScaler` bundled with an isolation forest, persisted per
//! (brand, vehicle) under the model registry root.

mod engine;
mod forest;
mod model;
mod registry;

pub use engine::{
    AnomalyDetector, ScoreReport, ScoreRequest, TrainReport, TrainRequest, WindowSource,
    DEFAULT_SCORE_MINUTES, DEFAULT_TRAIN_MINUTES,
};
pub use forest::{ForestConfig, ForestError, IsolationForest};
pub use model::{AnomalyScore, Decision, IdleModel, MODEL_FORMAT_VERSION, MODEL_MODE};
pub use registry::ModelRegistry;

use feature_engine::FeatureError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors during training or scoring
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("No trained model at {}", path.display())]
    ModelNotFound { path: PathBuf },
    #[error("Invalid model key: {0}")]
    InvalidKey(String),
    #[error("Model artifact error: {0}")]
    Artifact(String),
    #[error("Background task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Forest(#[from] ForestError),
}
