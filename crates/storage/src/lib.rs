//! Storage Layer
//!
//! Time-series persistence for telemetry samples. The rest of the system only
//! sees the `TelemetryStore` trait: "give me the samples for this vehicle since
//! this instant".

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use telemetry::TelemetrySample;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

/// Result ordering by timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Samples for one vehicle since an instant
#[derive(Debug, Clone)]
pub struct SampleQuery {
    pub vehicle_id: String,
    pub since: DateTime<Utc>,
    /// Maximum rows to return, `None` for all
    pub limit: Option<usize>,
    pub order: SortOrder,
}

impl SampleQuery {
    /// Newest-first query over the last `minutes`
    pub fn recent(vehicle_id: &str, minutes: u64) -> Self {
        let minutes = i64::try_from(minutes).unwrap_or(i64::MAX);
        let since = Duration::try_minutes(minutes)
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            vehicle_id: vehicle_id.to_string(),
            since,
            limit: None,
            order: SortOrder::Descending,
        }
    }

    /// Cap the number of rows
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Change the ordering
    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.vehicle_id.trim().is_empty() {
            return Err(StorageError::InvalidQuery("vehicle_id is empty".to_string()));
        }
        Ok(())
    }
}

/// A queryable store of telemetry samples.
///
/// Implementations return only rows where at least one tracked channel has a
/// reading, ordered and capped as the query asks.
pub trait TelemetryStore: Send + Sync + 'static {
    /// Fetch samples matching `query`
    fn query_samples(
        &self,
        query: &SampleQuery,
    ) -> impl Future<Output = Result<Vec<TelemetrySample>, StorageError>> + Send;

    /// Persist a sample
    fn insert_sample(
        &self,
        sample: &TelemetrySample,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_query_window() {
        let query = SampleQuery::recent("4", 30);
        let age = Utc::now() - query.since;
        assert!(age >= Duration::minutes(30));
        assert!(age < Duration::minutes(31));
        assert_eq!(query.order, SortOrder::Descending);
        assert!(query.limit.is_none());
    }

    #[test]
    fn test_huge_window_saturates() {
        let query = SampleQuery::recent("4", u64::MAX);
        assert_eq!(query.since, DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_empty_vehicle_rejected() {
        assert!(SampleQuery::recent("  ", 5).validate().is_err());
    }
}
