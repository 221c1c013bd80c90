//! Feature Vector Assembly

use crate::scaler::StandardScaler;
use crate::statistics::StatisticalFeatures;
use crate::window::FeatureWindow;
use crate::FeatureError;
use serde::{Deserialize, Serialize};
use telemetry::{Channel, CHANNEL_COUNT};
use tracing::debug;

/// Number of features in the vector (4 statistics × 6 channels)
pub const FEATURE_DIMENSION: usize = Statistic::ALL.len() * CHANNEL_COUNT;

/// Summary statistic blocks, in vector order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Mean,
    StdDev,
    Max,
    Min,
}

impl Statistic {
    pub const ALL: [Statistic; 4] = [Statistic::Mean, Statistic::StdDev, Statistic::Max, Statistic::Min];

    fn block(self) -> usize {
        self as usize
    }

    fn pick(self, stats: &StatisticalFeatures) -> f64 {
        match self {
            Statistic::Mean => stats.mean,
            Statistic::StdDev => stats.std_dev,
            Statistic::Max => stats.max,
            Statistic::Min => stats.min,
        }
    }
}

/// Fixed-length summary of a scaled window.
///
/// Layout: mean block, std block, max block, min block; each block in
/// `Channel::ALL` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedFeatureVector {
    /// Feature values (`FEATURE_DIMENSION` long)
    pub values: Vec<f64>,
    /// Rows the vector summarizes
    pub rows: usize,
}

impl AggregatedFeatureVector {
    /// Value of one statistic for one channel
    pub fn get(&self, statistic: Statistic, channel: Channel) -> f64 {
        self.values[statistic.block() * CHANNEL_COUNT + channel.index()]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
}

/// Reduces windows to `AggregatedFeatureVector`s
pub struct FeatureEncoder;

impl FeatureEncoder {
    /// Fit a scaler on `window` and encode it with that scaler.
    ///
    /// This is the training path; the returned scaler must be persisted with
    /// the model so inference scales with the same statistics.
    pub fn fit(window: &FeatureWindow) -> Result<(StandardScaler, AggregatedFeatureVector), FeatureError> {
        let scaler = StandardScaler::fit(window)?;
        let vector = Self::encode(&scaler, window)?;
        Ok((scaler, vector))
    }

    /// Encode `window` with an already fitted scaler
    pub fn encode(
        scaler: &StandardScaler,
        window: &FeatureWindow,
    ) -> Result<AggregatedFeatureVector, FeatureError> {
        if window.is_empty() {
            return Err(FeatureError::InsufficientData { rows: 0, required: 1 });
        }

        let scaled = scaler.transform(window);
        let mut values = vec![0.0; FEATURE_DIMENSION];
        for channel in Channel::ALL {
            let column: Vec<f64> = scaled.iter().map(|row| row[channel.index()]).collect();
            let stats = StatisticalFeatures::compute(&column);
            for statistic in Statistic::ALL {
                values[statistic.block() * CHANNEL_COUNT + channel.index()] = statistic.pick(&stats);
            }
        }

        debug!(
            "Encoded {} rows for vehicle {} into {} features",
            window.len(),
            window.vehicle_id(),
            values.len()
        );

        Ok(AggregatedFeatureVector {
            values,
            rows: window.len(),
        })
    }
}
