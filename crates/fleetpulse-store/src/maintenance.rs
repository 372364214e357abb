//! Partition Maintenance Task
//!
//! Background task keeping the history table's partitions in shape:
//!
//! 1. Pre-create the current week and `weeks_ahead` future weeks, so the
//!    normal write path never relies on the default partition.
//! 2. Drop weeks older than `retention_weeks`.
//!
//! Runs once immediately and then every `interval` until cancelled. A failed
//! round is logged and retried at the next tick; the default partition keeps
//! writes working in the meantime.
//!
//! ## Example
//!
//! ```rust,ignore
//! let task = PartitionMaintenanceTask::new(
//!     Arc::new(PartitionManager::new(table)),
//!     4,                            // weeks ahead
//!     8,                            // retention weeks
//!     Duration::from_secs(3600),
//! );
//! let cancel = CancellationToken::new();
//! let handle = tokio::spawn(task.run(cancel.clone()));
//!
//! // Later
//! cancel.cancel();
//! handle.await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::PartitionMaintenance;

/// What one maintenance round did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub created: Vec<String>,
    pub dropped: Vec<String>,
}

pub struct PartitionMaintenanceTask {
    maintenance: Arc<dyn PartitionMaintenance>,
    weeks_ahead: u32,
    retention_weeks: u32,
    interval: Duration,
}

impl PartitionMaintenanceTask {
    pub fn new(
        maintenance: Arc<dyn PartitionMaintenance>,
        weeks_ahead: u32,
        retention_weeks: u32,
        interval: Duration,
    ) -> Self {
        Self {
            maintenance,
            weeks_ahead,
            retention_weeks,
            interval,
        }
    }

    /// One round at `now`: pre-create, then apply retention.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let created = self
            .maintenance
            .ensure_partitions(now, self.weeks_ahead)
            .await?;
        let dropped = self
            .maintenance
            .drop_expired(now, self.retention_weeks)
            .await?;
        Ok(MaintenanceReport { created, dropped })
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            weeks_ahead = self.weeks_ahead,
            retention_weeks = self.retention_weeks,
            interval_secs = self.interval.as_secs(),
            "Partition maintenance started"
        );

        let mut rounds: u64 = 0;
        let mut failures: u64 = 0;

        loop {
            match self.run_once(Utc::now()).await {
                Ok(report) => {
                    rounds += 1;
                    debug!(
                        created = report.created.len(),
                        dropped = report.dropped.len(),
                        "Partition maintenance round complete"
                    );
                }
                Err(e) => {
                    failures += 1;
                    error!(error = %e, failures, "Partition maintenance round failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!(rounds, failures, "Partition maintenance stopped");
    }
}
