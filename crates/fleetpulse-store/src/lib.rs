//! Fleetpulse History Store
//!
//! Durable, down-sampled driver location history in a week-partitioned
//! PostgreSQL table.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐      persist(&[TrackPoint])
//! │  persistence worker │ ─────────────────────────────┐
//! └─────────────────────┘                              ▼
//!                                     ┌────────────────────────────────┐
//!                                     │ BatchPersister                 │
//!                                     │  CopyPersister   (binary COPY) │
//!                                     │  InsertPersister (multi-row)   │
//!                                     │  MemoryHistoryStore            │
//!                                     └───────────────┬────────────────┘
//!                                                     ▼
//! ┌─────────────────────┐   ensure / drop  ┌─────────────────────────────┐
//! │ PartitionManager    │ ───────────────► │ location_history            │
//! │ (maintenance task)  │                  │  _y2024_w20 … _y2024_w24    │
//! └─────────────────────┘                  │  _default                   │
//!                                          └─────────────────────────────┘
//! ```
//!
//! ## Write Semantics
//!
//! - A successful `persist` means every row not listed in
//!   [`PersistOutcome::rejected`] is committed.
//! - Re-persisting a row with the same `(driver_id, recorded_at)` is a no-op,
//!   so redelivered batches never duplicate history.
//! - Rows are rejected individually (bad coordinates, constraint violations);
//!   they never fail their neighbours.
//!
//! ## Choosing a Persister
//!
//! | Persister         | Round trips per batch | Use                          |
//! |-------------------|-----------------------|------------------------------|
//! | `CopyPersister`   | 4, independent of size| consumer-group workers       |
//! | `InsertPersister` | 1 per 1000 rows       | interval sync, small fleets  |

pub mod error;
mod isolate;
pub mod maintenance;
pub mod manager;
pub mod memory;
pub mod partition;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetpulse_core::{DriverId, TrackPoint};

pub use error::{Result, StoreError};
pub use maintenance::PartitionMaintenanceTask;
pub use manager::PartitionManager;
pub use memory::MemoryHistoryStore;
pub use partition::{
    default_partition_name, expired_partitions, parse_partition_week, partition_name,
    route_partition, week_bounds, PartitionWeek,
};
pub use postgres::{CopyPersister, HistoryTable, InsertPersister};

/// Default name of the history table.
pub const DEFAULT_HISTORY_TABLE: &str = "location_history";

/// A row that could not be stored, with the position it had in the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub index: usize,
    pub point: TrackPoint,
    pub reason: String,
}

/// Result of persisting one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistOutcome {
    /// Rows newly inserted. Rows already present are not counted.
    pub written: u64,
    /// Rows that were not stored, ordered by batch index.
    pub rejected: Vec<RejectedRow>,
}

/// Destination of persisted history.
#[async_trait]
pub trait BatchPersister: Send + Sync {
    /// Durably store a batch.
    ///
    /// # Errors
    ///
    /// Only for failures that concern the whole batch (connection loss,
    /// timeouts). Problems with individual rows are reported through
    /// [`PersistOutcome::rejected`].
    async fn persist(&self, rows: &[TrackPoint]) -> Result<PersistOutcome>;

    /// Most recent stored point of a driver.
    async fn last_point(&self, driver_id: DriverId) -> Result<Option<TrackPoint>>;

    /// Most recent stored point of each driver that has history.
    async fn last_points(&self, driver_ids: &[DriverId]) -> Result<HashMap<DriverId, TrackPoint>>;
}

/// Partition lifecycle operations.
#[async_trait]
pub trait PartitionMaintenance: Send + Sync {
    /// Make sure partitions exist for the week containing `now` and the
    /// `weeks_ahead` following weeks. Returns the partitions created.
    async fn ensure_partitions(&self, now: DateTime<Utc>, weeks_ahead: u32) -> Result<Vec<String>>;

    /// Drop week partitions that ended at or before `now - retention_weeks`.
    /// Returns the partitions dropped.
    async fn drop_expired(&self, now: DateTime<Utc>, retention_weeks: u32) -> Result<Vec<String>>;
}
