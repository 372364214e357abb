//! Partition Manager
//!
//! Owns the DDL side of the history table: schema bootstrap, pre-creation of
//! upcoming week partitions, and retention.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE location_history (
//!     id          BIGSERIAL,
//!     driver_id   BIGINT           NOT NULL,
//!     latitude    DOUBLE PRECISION NOT NULL CHECK (latitude  BETWEEN  -90 AND  90),
//!     longitude   DOUBLE PRECISION NOT NULL CHECK (longitude BETWEEN -180 AND 180),
//!     recorded_at TIMESTAMPTZ      NOT NULL,
//!     PRIMARY KEY (id, recorded_at)
//! ) PARTITION BY RANGE (recorded_at);
//!
//! CREATE UNIQUE INDEX location_history_driver_ts
//!     ON location_history (driver_id, recorded_at);
//!
//! CREATE TABLE location_history_default PARTITION OF location_history DEFAULT;
//! ```
//!
//! ## Creating a Week
//!
//! A plain `CREATE TABLE ... PARTITION OF` fails when the default partition
//! already holds rows for that week. Weeks are therefore created detached,
//! filled with whatever the default partition holds for their range, and
//! attached, all in one transaction:
//!
//! ```text
//! CREATE TABLE p (LIKE parent INCLUDING DEFAULTS INCLUDING CONSTRAINTS)
//! WITH moved AS (DELETE FROM parent_default WHERE <range> RETURNING *)
//!     INSERT INTO p SELECT * FROM moved
//! ALTER TABLE parent ATTACH PARTITION p FOR VALUES FROM (start) TO (end)
//! ```
//!
//! All operations are idempotent. A partition that already exists, or that
//! another process creates concurrently, is skipped.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{is_duplicate_table, Result, StoreError};
use crate::partition::{
    default_partition_name, expired_partitions, partition_name, week_bounds, weeks_to_ensure,
    PartitionWeek,
};
use crate::postgres::HistoryTable;
use crate::PartitionMaintenance;

#[derive(Clone)]
pub struct PartitionManager {
    table: HistoryTable,
}

impl PartitionManager {
    pub fn new(table: HistoryTable) -> Self {
        Self { table }
    }

    /// Create the parent table, its unique index and the default partition
    /// if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let table = self.table.name();
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id BIGSERIAL,
                    driver_id BIGINT NOT NULL,
                    latitude DOUBLE PRECISION NOT NULL CHECK (latitude BETWEEN -90 AND 90),
                    longitude DOUBLE PRECISION NOT NULL CHECK (longitude BETWEEN -180 AND 180),
                    recorded_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (id, recorded_at)
                ) PARTITION BY RANGE (recorded_at)",
                table = table
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {table}_driver_ts ON {table} (driver_id, recorded_at)",
                table = table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} DEFAULT",
                default_partition_name(table),
                table
            ),
        ];

        for statement in &statements {
            match sqlx::query(statement).execute(self.table.pool()).await {
                Ok(_) => {}
                Err(e) if is_duplicate_table(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(table, "History schema ready");
        Ok(())
    }

    /// Names of every partition attached to the history table, sorted.
    pub async fn list_partitions(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT child.relname::text
             FROM pg_inherits
             JOIN pg_class child ON child.oid = pg_inherits.inhrelid
             JOIN pg_class parent ON parent.oid = pg_inherits.inhparent
             WHERE parent.relname = $1
             ORDER BY child.relname",
        )
        .bind(self.table.name())
        .fetch_all(self.table.pool())
        .await?;
        Ok(names)
    }

    async fn create_week(&self, week: &PartitionWeek, name: &str) -> Result<u64> {
        let table = self.table.name();
        let (start, end) = week_bounds(week);
        let mut tx = self.table.pool().begin().await?;

        sqlx::query(&format!(
            "CREATE TABLE {} (LIKE {} INCLUDING DEFAULTS INCLUDING CONSTRAINTS)",
            name, table
        ))
        .execute(&mut *tx)
        .await?;

        let moved = sqlx::query(&format!(
            "WITH moved AS (
                DELETE FROM {default} WHERE recorded_at >= $1 AND recorded_at < $2 RETURNING *
             )
             INSERT INTO {name} SELECT * FROM moved",
            default = default_partition_name(table),
            name = name
        ))
        .bind(start)
        .bind(end)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(&format!(
            "ALTER TABLE {} ATTACH PARTITION {} FOR VALUES FROM ('{}') TO ('{}')",
            table,
            name,
            start.to_rfc3339(),
            end.to_rfc3339()
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(moved)
    }
}

#[async_trait]
impl PartitionMaintenance for PartitionManager {
    async fn ensure_partitions(&self, now: DateTime<Utc>, weeks_ahead: u32) -> Result<Vec<String>> {
        let table = self.table.name();
        let existing: BTreeSet<String> = self.list_partitions().await?.into_iter().collect();
        let mut created = Vec::new();

        for week in weeks_to_ensure(&now, weeks_ahead) {
            let name = partition_name(table, &week);
            if existing.contains(&name) {
                continue;
            }
            match self.create_week(&week, &name).await {
                Ok(moved) => {
                    info!(partition = %name, week = %week, moved, "Created partition");
                    created.push(name);
                }
                Err(StoreError::Database(e)) if is_duplicate_table(&e) => {
                    debug!(partition = %name, "Partition created concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(created)
    }

    async fn drop_expired(&self, now: DateTime<Utc>, retention_weeks: u32) -> Result<Vec<String>> {
        let table = self.table.name();
        let names = self.list_partitions().await?;
        let expired = expired_partitions(table, &names, &now, retention_weeks);

        for name in &expired {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", name))
                .execute(self.table.pool())
                .await?;
            info!(partition = %name, retention_weeks, "Dropped expired partition");
        }

        Ok(expired)
    }
}
