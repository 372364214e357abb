//! PostgreSQL history persisters
//!
//! Both persisters write to the same partitioned table through a shared
//! [`HistoryTable`] handle and differ only in how a batch travels.
//!
//! ## CopyPersister
//!
//! ```text
//! BEGIN
//!   CREATE TEMP TABLE location_staging (...) ON COMMIT DROP
//!   COPY location_staging FROM STDIN WITH (FORMAT binary)   ← one stream
//!   INSERT INTO location_history (...)
//!     SELECT ... FROM location_staging
//!     ON CONFLICT (driver_id, recorded_at) DO NOTHING
//! COMMIT
//! ```
//!
//! COPY cannot skip conflicting rows by itself, hence the staging table.
//!
//! ## InsertPersister
//!
//! Multi-row `INSERT ... VALUES (...), (...) ON CONFLICT DO NOTHING`, chunked
//! so a statement never approaches the 65535 bind-parameter limit.
//!
//! ## Implementation Notes
//!
//! Runtime queries (`sqlx::query`) are used throughout because the table
//! name is configurable. It is validated as a plain identifier before being
//! spliced into SQL.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetpulse_core::copy::{encode_rows, COPY_COLUMNS};
use fleetpulse_core::{DriverId, TrackPoint};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::error::Result;
use crate::isolate::{persist_isolating, WriteBatch};
use crate::partition::validate_table_name;
use crate::{BatchPersister, PersistOutcome};

const STAGING_TABLE: &str = "location_staging";

/// Rows per INSERT statement (4 binds each).
const MAX_ROWS_PER_INSERT: usize = 1000;

/// Pool handle plus the validated name of the history table.
#[derive(Clone)]
pub struct HistoryTable {
    pool: PgPool,
    table: String,
}

impl HistoryTable {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { pool, table })
    }

    /// Open a pool of `max_connections` and bind it to `table`.
    pub async fn connect(url: &str, max_connections: u32, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let options = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::new(pool, table)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn name(&self) -> &str {
        &self.table
    }

    pub async fn last_point(&self, driver_id: DriverId) -> Result<Option<TrackPoint>> {
        let row = sqlx::query(&format!(
            "SELECT driver_id, latitude, longitude, recorded_at FROM {}
             WHERE driver_id = $1
             ORDER BY recorded_at DESC
             LIMIT 1",
            self.table
        ))
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(track_point_from_row).transpose()
    }

    pub async fn last_points(
        &self,
        driver_ids: &[DriverId],
    ) -> Result<HashMap<DriverId, TrackPoint>> {
        if driver_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (driver_id) driver_id, latitude, longitude, recorded_at
             FROM {}
             WHERE driver_id = ANY($1)
             ORDER BY driver_id, recorded_at DESC",
            self.table
        ))
        .bind(driver_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| track_point_from_row(row).map(|p| (p.driver_id, p)))
            .collect()
    }
}

fn track_point_from_row(row: &PgRow) -> Result<TrackPoint> {
    let driver_id: i64 = row.try_get("driver_id")?;
    let lat: f64 = row.try_get("latitude")?;
    let lon: f64 = row.try_get("longitude")?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;
    Ok(TrackPoint::new(driver_id, lat, lon, recorded_at))
}

/// Bulk loader using binary COPY through a staging table.
#[derive(Clone)]
pub struct CopyPersister {
    table: HistoryTable,
}

impl CopyPersister {
    pub fn new(table: HistoryTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl WriteBatch for CopyPersister {
    async fn write_batch(&self, rows: &[TrackPoint]) -> Result<u64> {
        let columns = COPY_COLUMNS.join(", ");
        let mut tx = self.table.pool.begin().await?;

        sqlx::query(&format!(
            "CREATE TEMP TABLE {} (
                driver_id BIGINT,
                latitude DOUBLE PRECISION,
                longitude DOUBLE PRECISION,
                recorded_at TIMESTAMPTZ
            ) ON COMMIT DROP",
            STAGING_TABLE
        ))
        .execute(&mut *tx)
        .await?;

        let mut copy = tx
            .copy_in_raw(&format!(
                "COPY {} ({}) FROM STDIN WITH (FORMAT binary)",
                STAGING_TABLE, columns
            ))
            .await?;
        copy.send(encode_rows(rows)).await?;
        let staged = copy.finish().await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO {table} ({columns})
             SELECT {columns} FROM {staging}
             ON CONFLICT (driver_id, recorded_at) DO NOTHING",
            table = self.table.table,
            columns = columns,
            staging = STAGING_TABLE,
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        debug!(staged, inserted, "Copied batch into history");
        Ok(inserted)
    }
}

#[async_trait]
impl BatchPersister for CopyPersister {
    async fn persist(&self, rows: &[TrackPoint]) -> Result<PersistOutcome> {
        persist_isolating(self, rows).await
    }

    async fn last_point(&self, driver_id: DriverId) -> Result<Option<TrackPoint>> {
        self.table.last_point(driver_id).await
    }

    async fn last_points(&self, driver_ids: &[DriverId]) -> Result<HashMap<DriverId, TrackPoint>> {
        self.table.last_points(driver_ids).await
    }
}

/// Row-based persister using multi-row parameterised inserts.
#[derive(Clone)]
pub struct InsertPersister {
    table: HistoryTable,
}

impl InsertPersister {
    pub fn new(table: HistoryTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl WriteBatch for InsertPersister {
    async fn write_batch(&self, rows: &[TrackPoint]) -> Result<u64> {
        let mut tx = self.table.pool.begin().await?;
        let mut inserted = 0;

        for chunk in rows.chunks(MAX_ROWS_PER_INSERT) {
            let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (driver_id, latitude, longitude, recorded_at) ",
                self.table.table
            ));
            query.push_values(chunk, |mut b, row| {
                b.push_bind(row.driver_id)
                    .push_bind(row.point.lat)
                    .push_bind(row.point.lon)
                    .push_bind(row.recorded_at);
            });
            query.push(" ON CONFLICT (driver_id, recorded_at) DO NOTHING");

            inserted += query.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

#[async_trait]
impl BatchPersister for InsertPersister {
    async fn persist(&self, rows: &[TrackPoint]) -> Result<PersistOutcome> {
        persist_isolating(self, rows).await
    }

    async fn last_point(&self, driver_id: DriverId) -> Result<Option<TrackPoint>> {
        self.table.last_point(driver_id).await
    }

    async fn last_points(&self, driver_ids: &[DriverId]) -> Result<HashMap<DriverId, TrackPoint>> {
        self.table.last_points(driver_ids).await
    }
}
