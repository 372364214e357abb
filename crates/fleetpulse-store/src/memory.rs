//! In-process history store.
//!
//! Keeps rows in named partitions using the same naming, routing and
//! retention rules as the PostgreSQL table, and the same
//! `(driver_id, recorded_at)` uniqueness. Used by tests and by
//! development setups without a database.
//!
//! Two knobs reproduce database failures:
//! [`fail_next_writes`](MemoryHistoryStore::fail_next_writes) for transient
//! outages, and [`reject_driver`](MemoryHistoryStore::reject_driver) or
//! [`reject_point`](MemoryHistoryStore::reject_point) for rows a constraint
//! refuses.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetpulse_core::{DriverId, TrackPoint};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::isolate::{persist_isolating, WriteBatch};
use crate::partition::{
    default_partition_name, expired_partitions, partition_name, route_partition,
    validate_table_name, weeks_to_ensure, PartitionWeek,
};
use crate::{BatchPersister, PartitionMaintenance, PersistOutcome};

#[derive(Clone)]
pub struct MemoryHistoryStore {
    table: String,
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    weeks: BTreeSet<PartitionWeek>,
    partitions: BTreeMap<String, Vec<TrackPoint>>,
    keys: HashSet<(DriverId, DateTime<Utc>)>,
    transient_failures: u32,
    rejected_drivers: HashSet<DriverId>,
    rejected_points: HashSet<(DriverId, DateTime<Utc>)>,
    batches: u64,
}

impl MemoryHistoryStore {
    pub fn new(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;

        let mut partitions = BTreeMap::new();
        partitions.insert(default_partition_name(&table), Vec::new());

        Ok(Self {
            table,
            inner: Arc::new(Mutex::new(Inner {
                weeks: BTreeSet::new(),
                partitions,
                keys: HashSet::new(),
                transient_failures: 0,
                rejected_drivers: HashSet::new(),
                rejected_points: HashSet::new(),
                batches: 0,
            })),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Make the next `count` batch writes fail as if the database were
    /// unreachable.
    pub async fn fail_next_writes(&self, count: u32) {
        self.inner.lock().await.transient_failures = count;
    }

    /// Refuse every row of `driver_id` as a constraint violation.
    pub async fn reject_driver(&self, driver_id: DriverId) {
        self.inner.lock().await.rejected_drivers.insert(driver_id);
    }

    /// Refuse the row of `driver_id` recorded at `recorded_at`.
    pub async fn reject_point(&self, driver_id: DriverId, recorded_at: DateTime<Utc>) {
        self.inner
            .lock()
            .await
            .rejected_points
            .insert((driver_id, recorded_at));
    }

    /// All stored rows, ordered by driver then time.
    pub async fn rows(&self) -> Vec<TrackPoint> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<TrackPoint> = inner.partitions.values().flatten().copied().collect();
        rows.sort_by_key(|r| (r.driver_id, r.recorded_at));
        rows
    }

    /// Rows held by one partition, in insertion order.
    pub async fn partition_rows(&self, partition: &str) -> Vec<TrackPoint> {
        self.inner
            .lock()
            .await
            .partitions
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    /// Partition names, sorted; the default partition included.
    pub async fn partitions(&self) -> Vec<String> {
        self.inner.lock().await.partitions.keys().cloned().collect()
    }

    /// Number of batches committed.
    pub async fn committed_batches(&self) -> u64 {
        self.inner.lock().await.batches
    }
}

#[async_trait]
impl WriteBatch for MemoryHistoryStore {
    async fn write_batch(&self, rows: &[TrackPoint]) -> Result<u64> {
        let mut inner = self.inner.lock().await;

        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        if let Some(row) = rows
            .iter()
            .find(|r| inner.rejected_drivers.contains(&r.driver_id))
        {
            return Err(StoreError::RowRejected(format!(
                "driver {} refused by constraint",
                row.driver_id
            )));
        }
        if let Some(row) = rows
            .iter()
            .find(|r| inner.rejected_points.contains(&(r.driver_id, r.recorded_at)))
        {
            return Err(StoreError::RowRejected(format!(
                "driver {} at {} refused by constraint",
                row.driver_id, row.recorded_at
            )));
        }

        let mut written = 0;
        for row in rows {
            if !inner.keys.insert((row.driver_id, row.recorded_at)) {
                continue;
            }
            let partition = route_partition(&self.table, &inner.weeks, &row.recorded_at);
            inner.partitions.entry(partition).or_default().push(*row);
            written += 1;
        }
        inner.batches += 1;
        Ok(written)
    }
}

#[async_trait]
impl BatchPersister for MemoryHistoryStore {
    async fn persist(&self, rows: &[TrackPoint]) -> Result<PersistOutcome> {
        persist_isolating(self, rows).await
    }

    async fn last_point(&self, driver_id: DriverId) -> Result<Option<TrackPoint>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .partitions
            .values()
            .flatten()
            .filter(|r| r.driver_id == driver_id)
            .max_by_key(|r| r.recorded_at)
            .copied())
    }

    async fn last_points(&self, driver_ids: &[DriverId]) -> Result<HashMap<DriverId, TrackPoint>> {
        let wanted: HashSet<DriverId> = driver_ids.iter().copied().collect();
        let inner = self.inner.lock().await;
        let mut latest: HashMap<DriverId, TrackPoint> = HashMap::new();
        for row in inner.partitions.values().flatten() {
            if !wanted.contains(&row.driver_id) {
                continue;
            }
            let newer = latest
                .get(&row.driver_id)
                .map_or(true, |current| row.recorded_at > current.recorded_at);
            if newer {
                latest.insert(row.driver_id, *row);
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl PartitionMaintenance for MemoryHistoryStore {
    async fn ensure_partitions(&self, now: DateTime<Utc>, weeks_ahead: u32) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let default_name = default_partition_name(&self.table);
        let mut created = Vec::new();

        for week in weeks_to_ensure(&now, weeks_ahead) {
            if !inner.weeks.insert(week) {
                continue;
            }
            let name = partition_name(&self.table, &week);

            let (start, end) = (week.start(), week.end());
            let default_rows = inner.partitions.remove(&default_name).unwrap_or_default();
            let (moved, kept): (Vec<TrackPoint>, Vec<TrackPoint>) = default_rows
                .into_iter()
                .partition(|r| r.recorded_at >= start && r.recorded_at < end);
            inner.partitions.insert(default_name.clone(), kept);

            info!(partition = %name, moved = moved.len(), "Created partition");
            inner.partitions.insert(name.clone(), moved);
            created.push(name);
        }

        Ok(created)
    }

    async fn drop_expired(&self, now: DateTime<Utc>, retention_weeks: u32) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let names: Vec<String> = inner.partitions.keys().cloned().collect();
        let expired = expired_partitions(&self.table, &names, &now, retention_weeks);

        for name in &expired {
            if let Some(rows) = inner.partitions.remove(name) {
                for row in &rows {
                    inner.keys.remove(&(row.driver_id, row.recorded_at));
                }
                debug!(partition = %name, rows = rows.len(), "Dropped partition");
            }
            inner
                .weeks
                .retain(|week| partition_name(&self.table, week) != *name);
        }

        Ok(expired)
    }
}
