//! Cleaned Feature Windows

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use telemetry::{Channel, TelemetrySample, CHANNEL_COUNT};

/// A fully populated row of a window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRow {
    pub timestamp: DateTime<Utc>,
    pub values: [f64; CHANNEL_COUNT],
}

impl WindowRow {
    pub fn new(timestamp: DateTime<Utc>, values: [f64; CHANNEL_COUNT]) -> Self {
        Self { timestamp, values }
    }

    /// Reading for one channel
    pub fn get(&self, channel: Channel) -> f64 {
        self.values[channel.index()]
    }

    // -0.0 and 0.0 are the same reading.
    fn dedup_key(&self) -> (DateTime<Utc>, [u64; CHANNEL_COUNT]) {
        let mut bits = [0u64; CHANNEL_COUNT];
        for (slot, v) in bits.iter_mut().zip(self.values.iter()) {
            *slot = if *v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() };
        }
        (self.timestamp, bits)
    }
}

/// Time-ordered, cleaned telemetry for one vehicle.
///
/// Every row carries a finite value for every tracked channel, no two rows
/// are identical, and rows are sorted by time ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    vehicle_id: String,
    rows: Vec<WindowRow>,
}

impl FeatureWindow {
    /// Build a window from store samples, dropping other vehicles' samples
    /// and any sample with a missing reading.
    pub fn from_samples(
        vehicle_id: &str,
        samples: impl IntoIterator<Item = TelemetrySample>,
    ) -> Self {
        let rows = samples
            .into_iter()
            .filter(|s| s.vehicle_id == vehicle_id)
            .filter_map(|s| s.complete_readings().map(|values| WindowRow::new(s.timestamp, values)))
            .collect();
        Self::from_rows(vehicle_id, rows)
    }

    /// Build a window from externally supplied rows (uploads, replays).
    pub fn from_rows(vehicle_id: &str, rows: Vec<WindowRow>) -> Self {
        let mut seen = HashSet::with_capacity(rows.len());
        let mut rows: Vec<WindowRow> = rows
            .into_iter()
            .filter(|r| r.values.iter().all(|v| v.is_finite()))
            .filter(|r| seen.insert(r.dedup_key()))
            .collect();
        rows.sort_by_key(|r| r.timestamp);

        Self {
            vehicle_id: vehicle_id.to_string(),
            rows,
        }
    }

    /// Keep only rows whose `channel` reading lies within `[min, max]`
    pub fn retain_band(mut self, channel: Channel, min: f64, max: f64) -> Self {
        self.rows.retain(|r| {
            let v = r.get(channel);
            v >= min && v <= max
        });
        self
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub fn rows(&self) -> &[WindowRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All readings of one channel, in time order
    pub fn column(&self, channel: Channel) -> Vec<f64> {
        self.rows.iter().map(|r| r.get(channel)).collect()
    }

    /// Flat JSON records, one per row
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                let mut sample = TelemetrySample::new(self.vehicle_id.clone(), row.timestamp);
                for channel in Channel::ALL {
                    sample.set(channel, Some(row.get(channel)));
                }
                sample.to_record()
            })
            .collect()
    }
}
