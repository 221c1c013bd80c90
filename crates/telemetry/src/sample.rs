//! Telemetry Samples

use crate::channel::{Channel, CHANNEL_COUNT};
use crate::TelemetryError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One reading of every tracked channel for a vehicle at an instant.
///
/// Readings are optional because adapters routinely fail to answer a PID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Vehicle the sample belongs to
    pub vehicle_id: String,
    /// Acquisition time
    pub timestamp: DateTime<Utc>,
    /// Readings indexed by `Channel::index`
    pub readings: [Option<f64>; CHANNEL_COUNT],
}

impl TelemetrySample {
    /// Create a sample with no readings
    pub fn new(vehicle_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            timestamp,
            readings: [None; CHANNEL_COUNT],
        }
    }

    /// Builder-style reading setter
    pub fn with_reading(mut self, channel: Channel, value: f64) -> Self {
        self.readings[channel.index()] = Some(value);
        self
    }

    /// Set (or clear) a reading
    pub fn set(&mut self, channel: Channel, value: Option<f64>) {
        self.readings[channel.index()] = value;
    }

    /// Get a reading
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.readings[channel.index()]
    }

    /// Whether at least one tracked channel has a reading
    pub fn has_any_reading(&self) -> bool {
        self.readings.iter().any(Option::is_some)
    }

    /// All readings, if every tracked channel has a finite value
    pub fn complete_readings(&self) -> Option<[f64; CHANNEL_COUNT]> {
        let mut values = [0.0; CHANNEL_COUNT];
        for (slot, reading) in values.iter_mut().zip(self.readings.iter()) {
            match reading {
                Some(v) if v.is_finite() => *slot = *v,
                _ => return None,
            }
        }
        Some(values)
    }

    /// Flat JSON record (`time`, `motorcycle_id`, one key per channel)
    pub fn to_record(&self) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert(
            "time".to_string(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        record.insert("motorcycle_id".to_string(), Value::String(self.vehicle_id.clone()));
        for channel in Channel::ALL {
            let value = self
                .get(channel)
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null);
            record.insert(channel.as_str().to_string(), value);
        }
        record
    }
}

/// One line of worker output: `{"motorcycle_id": "4", "data": {"RPM": 850.0}}`
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerPayload {
    #[serde(alias = "vehicle_id")]
    pub motorcycle_id: Value,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl WorkerPayload {
    /// Parse a single line of worker output
    pub fn parse_line(line: &str) -> Result<Self, TelemetryError> {
        serde_json::from_str(line.trim()).map_err(|e| TelemetryError::InvalidPayload(e.to_string()))
    }

    /// Convert into a sample stamped with `timestamp`.
    ///
    /// Keys that do not name a tracked channel are ignored, as are non-numeric values.
    pub fn into_sample(self, timestamp: DateTime<Utc>) -> Result<TelemetrySample, TelemetryError> {
        let vehicle_id = match self.motorcycle_id {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(TelemetryError::InvalidPayload(format!(
                    "motorcycle_id must be a string or number, got {}",
                    other
                )))
            }
        };

        let mut sample = TelemetrySample::new(vehicle_id, timestamp);
        for (name, value) in self.data {
            if let Some(channel) = Channel::from_name(&name) {
                sample.set(channel, value.as_f64());
            }
        }
        Ok(sample)
    }
}
