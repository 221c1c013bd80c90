//! Channel Aggregate Reports

use serde::Serialize;
use std::collections::BTreeMap;
use telemetry::{Channel, TelemetrySample};

/// Per-channel means over raw (uncleaned) samples
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReport {
    pub vehicle_id: String,
    /// Samples the report was computed from
    pub samples: usize,
    /// Mean of the non-null readings per channel, rounded to 2 decimals
    pub means: BTreeMap<&'static str, Option<f64>>,
}

impl ChannelReport {
    /// Build a report. Missing readings are skipped rather than dropping the row.
    pub fn from_samples(vehicle_id: &str, samples: &[TelemetrySample]) -> Self {
        let means = Channel::ALL
            .into_iter()
            .map(|channel| {
                let readings: Vec<f64> = samples
                    .iter()
                    .filter_map(|s| s.get(channel))
                    .filter(|v| v.is_finite())
                    .collect();
                let mean = if readings.is_empty() {
                    None
                } else {
                    let mean = readings.iter().sum::<f64>() / readings.len() as f64;
                    Some((mean * 100.0).round() / 100.0)
                };
                (channel.as_str(), mean)
            })
            .collect();

        Self {
            vehicle_id: vehicle_id.to_string(),
            samples: samples.len(),
            means,
        }
    }
}
