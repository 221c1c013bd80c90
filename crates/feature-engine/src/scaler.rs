//! Per-Channel Z-Score Scaler

use crate::statistics::StatisticalFeatures;
use crate::window::FeatureWindow;
use crate::FeatureError;
use serde::{Deserialize, Serialize};
use telemetry::{Channel, CHANNEL_COUNT};

/// Standardizes each channel to zero mean and unit variance.
///
/// Fit once on a training window and frozen: inference windows are
/// transformed with the training statistics, never re-fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: [f64; CHANNEL_COUNT],
    scale: [f64; CHANNEL_COUNT],
    samples_seen: usize,
}

impl StandardScaler {
    /// Fit per-channel mean and standard deviation
    pub fn fit(window: &FeatureWindow) -> Result<Self, FeatureError> {
        if window.is_empty() {
            return Err(FeatureError::InsufficientData { rows: 0, required: 1 });
        }

        let mut mean = [0.0; CHANNEL_COUNT];
        let mut scale = [1.0; CHANNEL_COUNT];
        for channel in Channel::ALL {
            let stats = StatisticalFeatures::compute(&window.column(channel));
            mean[channel.index()] = stats.mean;
            // A constant channel is only centered.
            scale[channel.index()] = if stats.std_dev > 0.0 { stats.std_dev } else { 1.0 };
        }

        Ok(Self {
            mean,
            scale,
            samples_seen: window.len(),
        })
    }

    /// Scale one row of raw readings
    pub fn transform_row(&self, values: &[f64; CHANNEL_COUNT]) -> [f64; CHANNEL_COUNT] {
        let mut scaled = [0.0; CHANNEL_COUNT];
        for i in 0..CHANNEL_COUNT {
            scaled[i] = (values[i] - self.mean[i]) / self.scale[i];
        }
        scaled
    }

    /// Scale every row of a window
    pub fn transform(&self, window: &FeatureWindow) -> Vec<[f64; CHANNEL_COUNT]> {
        window.rows().iter().map(|r| self.transform_row(&r.values)).collect()
    }

    /// Fitted per-channel means
    pub fn mean(&self) -> &[f64; CHANNEL_COUNT] {
        &self.mean
    }

    /// Fitted per-channel scales
    pub fn scale(&self) -> &[f64; CHANNEL_COUNT] {
        &self.scale
    }

    /// Number of rows the scaler was fit on
    pub fn samples_seen(&self) -> usize {
        self.samples_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowRow;
    use chrono::{Duration, Utc};

    fn window(rows: &[[f64; CHANNEL_COUNT]]) -> FeatureWindow {
        let t0 = Utc::now();
        FeatureWindow::from_rows(
            "4",
            rows.iter()
                .enumerate()
                .map(|(i, v)| WindowRow::new(t0 + Duration::seconds(i as i64), *v))
                .collect(),
        )
    }

    #[test]
    fn test_fit_transform_standardizes() {
        let w = window(&[[1.0, 10.0, 5.0, 0.0, 80.0, 12.0], [3.0, 30.0, 5.0, 2.0, 90.0, 14.0]]);
        let scaler = StandardScaler::fit(&w).unwrap();
        let scaled = scaler.transform(&w);

        assert_eq!(scaled[0][0], -1.0);
        assert_eq!(scaled[1][0], 1.0);
        // constant throttle channel stays centered at zero
        assert_eq!(scaled[0][2], 0.0);
        assert_eq!(scaler.samples_seen(), 2);
    }

    #[test]
    fn test_frozen_statistics_apply_to_new_rows() {
        let train = window(&[[0.0; CHANNEL_COUNT], [2.0; CHANNEL_COUNT]]);
        let scaler = StandardScaler::fit(&train).unwrap();

        let scaled = scaler.transform_row(&[5.0; CHANNEL_COUNT]);
        assert!(scaled.iter().all(|v| (*v - 4.0).abs() < 1e-12));
    }

    #[test]
    fn test_empty_window_rejected() {
        let empty = window(&[]);
        assert!(matches!(
            StandardScaler::fit(&empty),
            Err(FeatureError::InsufficientData { rows: 0, .. })
        ));
    }
}
