//! Uploaded Window Decoding
//!
//! Uploaded windows arrive as base64-encoded CSV with a header row naming the
//! channels. A `time` column is optional; rows without a time are stamped
//! with the upload instant, and a time that is not RFC 3339 rejects the upload.

use crate::window::{FeatureWindow, WindowRow};
use crate::FeatureError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use telemetry::{Channel, CHANNEL_COUNT};
use tracing::debug;

const TIME_COLUMNS: [&str; 3] = ["time", "_time", "timestamp"];

/// Decode a base64 CSV upload into a cleaned window for `vehicle_id`
pub fn decode_upload(vehicle_id: &str, payload_base64: &str) -> Result<FeatureWindow, FeatureError> {
    let compact: String = payload_base64.split_whitespace().collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| FeatureError::Decode(format!("invalid base64: {}", e)))?;

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes.as_slice());

    let headers = reader
        .headers()
        .map_err(|e| FeatureError::Decode(format!("unreadable CSV header: {}", e)))?
        .clone();

    let mut channel_columns: [Option<usize>; CHANNEL_COUNT] = [None; CHANNEL_COUNT];
    let mut time_column = None;
    for (idx, name) in headers.iter().enumerate() {
        if let Some(channel) = Channel::from_name(name) {
            channel_columns[channel.index()].get_or_insert(idx);
        } else if TIME_COLUMNS.contains(&name.to_ascii_lowercase().as_str()) {
            time_column.get_or_insert(idx);
        }
    }

    let missing: Vec<&str> = Channel::ALL
        .iter()
        .filter(|c| channel_columns[c.index()].is_none())
        .map(|c| c.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(FeatureError::Decode(format!(
            "missing channel columns: {}",
            missing.join(", ")
        )));
    }

    let uploaded_at = Utc::now();
    let mut rows = Vec::new();
    let mut total = 0usize;
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| FeatureError::Decode(format!("row {}: {}", line + 1, e)))?;
        total += 1;

        let timestamp = match time_column.and_then(|idx| record.get(idx)).filter(|raw| !raw.is_empty()) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| FeatureError::Decode(format!("row {}: invalid time '{}': {}", line + 1, raw, e)))?,
            None => uploaded_at,
        };

        let mut values = [0.0; CHANNEL_COUNT];
        let mut complete = true;
        for (slot, column) in values.iter_mut().zip(channel_columns.iter()) {
            match column
                .and_then(|idx| record.get(idx))
                .and_then(|raw| raw.parse::<f64>().ok())
            {
                Some(v) if v.is_finite() => *slot = v,
                _ => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            rows.push(WindowRow::new(timestamp, values));
        }
    }

    let window = FeatureWindow::from_rows(vehicle_id, rows);
    debug!(
        "Decoded upload for vehicle {}: {} rows, {} after cleaning",
        vehicle_id,
        total,
        window.len()
    );
    Ok(window)
}
