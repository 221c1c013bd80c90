//! In-Memory Store

use crate::{SampleQuery, SortOrder, StorageError, TelemetryStore};
use std::collections::VecDeque;
use std::sync::Mutex;
use telemetry::TelemetrySample;
use tracing::{debug, info};

/// Default retention (roughly a week at one stored sample every 5s)
const DEFAULT_MAX_SAMPLES: usize = 120_000;

/// Bounded in-memory store, oldest samples evicted first
pub struct MemoryStore {
    samples: Mutex<VecDeque<TelemetrySample>>,
    max_samples: usize,
}

impl MemoryStore {
    /// Create a store with default retention
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SAMPLES)
    }

    /// Create a store holding at most `max_samples`
    pub fn with_capacity(max_samples: usize) -> Self {
        info!("Creating in-memory telemetry store (max {} samples)", max_samples);
        Self {
            samples: Mutex::new(VecDeque::new()),
            max_samples: max_samples.max(1),
        }
    }

    /// Create a store pre-filled with samples
    pub fn from_samples(samples: impl IntoIterator<Item = TelemetrySample>) -> Self {
        let store = Self::new();
        for sample in samples {
            // Cannot fail: the lock is private and never poisoned here.
            let _ = store.push(sample);
        }
        store
    }

    fn push(&self, sample: TelemetrySample) -> Result<(), StorageError> {
        let mut samples = self
            .samples
            .lock()
            .map_err(|e| StorageError::Database(format!("Lock error: {}", e)))?;

        while samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(sample);
        Ok(())
    }

    /// Number of stored samples
    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore for MemoryStore {
    async fn query_samples(&self, query: &SampleQuery) -> Result<Vec<TelemetrySample>, StorageError> {
        query.validate()?;

        let mut rows: Vec<TelemetrySample> = {
            let samples = self
                .samples
                .lock()
                .map_err(|e| StorageError::Database(format!("Lock error: {}", e)))?;
            samples
                .iter()
                .filter(|s| s.vehicle_id == query.vehicle_id)
                .filter(|s| s.timestamp >= query.since)
                .filter(|s| s.has_any_reading())
                .cloned()
                .collect()
        };

        match query.order {
            SortOrder::Ascending => rows.sort_by_key(|s| s.timestamp),
            SortOrder::Descending => rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        debug!("Memory store returned {} rows for vehicle {}", rows.len(), query.vehicle_id);
        Ok(rows)
    }

    async fn insert_sample(&self, sample: &TelemetrySample) -> Result<(), StorageError> {
        self.push(sample.clone())
    }
}
