//! Feature Engineering Engine
//!
//! Turns raw telemetry into model input: windows are pulled from the store and
//! cleaned, scaled with a per-channel z-score transform, and reduced to a
//! fixed-length vector of per-channel summary statistics.

mod extractor;
mod features;
mod report;
mod scaler;
mod statistics;
mod upload;
mod window;

pub use extractor::{ExtractorConfig, WindowExtractor};
pub use features::{AggregatedFeatureVector, FeatureEncoder, Statistic, FEATURE_DIMENSION};
pub use report::ChannelReport;
pub use scaler::StandardScaler;
pub use statistics::StatisticalFeatures;
pub use upload::decode_upload;
pub use window::{FeatureWindow, WindowRow};

use thiserror::Error;

/// Errors while extracting or encoding features
#[derive(Debug, Clone, Error)]
pub enum FeatureError {
    #[error("Data source error: {0}")]
    DataSource(String),
    #[error("Insufficient data: {rows} usable rows, at least {required} required")]
    InsufficientData { rows: usize, required: usize },
    #[error("Invalid upload: {0}")]
    Decode(String),
}
