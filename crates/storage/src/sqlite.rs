//! SQLite Store
//!
//! Keeps the legacy `obd_data` table layout and column names used by the
//! acquisition worker.

use crate::{SampleQuery, SortOrder, StorageError, TelemetryStore};
use chrono::DateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use telemetry::{Channel, TelemetrySample};
use tracing::{debug, info};

/// Time to wait for a pooled connection
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed telemetry store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        info!("Opening telemetry store at {}", url);

        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to an in-memory database sees its own database.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        let columns: Vec<String> = Channel::ALL
            .iter()
            .map(|c| format!("{} REAL", c.legacy_column()))
            .collect();
        let create = format!(
            "CREATE TABLE IF NOT EXISTS obd_data (\
             vehicle_id TEXT NOT NULL, \
             time_ms INTEGER NOT NULL, \
             {})",
            columns.join(", ")
        );
        sqlx::query(&create).execute(&self.pool).await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_obd_data_vehicle_time ON obd_data (vehicle_id, time_ms)",
        )
        .execute(&self.pool)
        .await?;

        debug!("Telemetry schema ready");
        Ok(())
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn select_sql(order: SortOrder) -> String {
        let columns: Vec<&str> = Channel::ALL.iter().map(|c| c.legacy_column()).collect();
        let any_reading = columns
            .iter()
            .map(|c| format!("{} IS NOT NULL", c))
            .collect::<Vec<_>>()
            .join(" OR ");
        let direction = match order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };

        format!(
            "SELECT vehicle_id, time_ms, {} FROM obd_data \
             WHERE time_ms >= ?1 AND vehicle_id = ?2 AND ({}) \
             ORDER BY time_ms {} LIMIT ?3",
            columns.join(", "),
            any_reading,
            direction
        )
    }

    fn decode_row(row: &SqliteRow) -> Result<TelemetrySample, StorageError> {
        let vehicle_id: String = row.try_get("vehicle_id")?;
        let time_ms: i64 = row.try_get("time_ms")?;
        let timestamp = DateTime::from_timestamp_millis(time_ms)
            .ok_or_else(|| StorageError::Database(format!("Invalid timestamp {}", time_ms)))?;

        let mut sample = TelemetrySample::new(vehicle_id, timestamp);
        for channel in Channel::ALL {
            let value: Option<f64> = row.try_get(channel.legacy_column())?;
            sample.set(channel, value);
        }
        Ok(sample)
    }
}

impl TelemetryStore for SqliteStore {
    async fn query_samples(&self, query: &SampleQuery) -> Result<Vec<TelemetrySample>, StorageError> {
        query.validate()?;

        // SQLite treats a negative LIMIT as "no limit".
        let limit = query
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);

        let sql = Self::select_sql(query.order);
        let rows = sqlx::query(&sql)
            .bind(query.since.timestamp_millis())
            .bind(&query.vehicle_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        debug!("SQLite store returned {} rows for vehicle {}", rows.len(), query.vehicle_id);
        rows.iter().map(Self::decode_row).collect()
    }

    async fn insert_sample(&self, sample: &TelemetrySample) -> Result<(), StorageError> {
        let columns: Vec<&str> = Channel::ALL.iter().map(|c| c.legacy_column()).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO obd_data (vehicle_id, time_ms, {}) VALUES (?, ?, {})",
            columns.join(", "),
            placeholders
        );

        let mut insert = sqlx::query(&sql)
            .bind(&sample.vehicle_id)
            .bind(sample.timestamp.timestamp_millis());
        for channel in Channel::ALL {
            insert = insert.bind(sample.get(channel));
        }
        insert.execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_query_roundtrip() {
        let store = store().await;
        let now = Utc::now();

        let full = TelemetrySample::new("4", now - ChronoDuration::minutes(1))
            .with_reading(Channel::Rpm, 1450.0)
            .with_reading(Channel::FuelTrim, -2.5)
            .with_reading(Channel::SupplyVoltage, 13.8);
        store.insert_sample(&full).await.unwrap();
        store
            .insert_sample(&TelemetrySample::new("4", now - ChronoDuration::minutes(2)))
            .await
            .unwrap();
        store
            .insert_sample(
                &TelemetrySample::new("9", now).with_reading(Channel::Rpm, 1.0),
            )
            .await
            .unwrap();

        let rows = store.query_samples(&SampleQuery::recent("4", 30)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(Channel::FuelTrim), Some(-2.5));
        assert_eq!(rows[0].get(Channel::SupplyVoltage), Some(13.8));
        assert_eq!(rows[0].get(Channel::CoolantTemp), None);
        assert_eq!(
            rows[0].timestamp.timestamp_millis(),
            full.timestamp.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_order_and_limit() {
        let store = store().await;
        let now = Utc::now();
        for i in 0..5 {
            let sample = TelemetrySample::new("4", now - ChronoDuration::seconds(i))
                .with_reading(Channel::Rpm, i as f64);
            store.insert_sample(&sample).await.unwrap();
        }

        let newest = store
            .query_samples(&SampleQuery::recent("4", 10).with_limit(2))
            .await
            .unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].get(Channel::Rpm), Some(0.0));

        let all = store
            .query_samples(&SampleQuery::recent("4", 10).with_order(SortOrder::Ascending))
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].get(Channel::Rpm), Some(4.0));
    }
}
