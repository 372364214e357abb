//! Interval Sync
//!
//! The low-scale persistence strategy. Instead of draining append logs, it
//! takes a snapshot of the active drivers' cached positions every interval,
//! down-samples and persists through the same [`BatchPersister`] the stream
//! workers use.
//!
//! Positions reported between two ticks never reach history, only the latest
//! one per tick does. That trade is acceptable for small fleets with long
//! intervals; anything that needs the full track runs the consumer pool.
//!
//! A single task owns the down-sample state, so no driver assignment is
//! needed. A failed tick is logged and the next tick picks up the then
//! current positions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetpulse_cache::LocationCache;
use fleetpulse_core::{DriverId, TrackPoint};
use fleetpulse_store::BatchPersister;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::downsample::DownsampleFilter;
use crate::error::Result;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Positions in the snapshot that changed since the previous tick.
    pub fresh: usize,
    pub persisted: usize,
    pub dropped: usize,
    pub rejected: usize,
}

pub struct IntervalSync {
    cache: Arc<dyn LocationCache>,
    persister: Arc<dyn BatchPersister>,
    filter: DownsampleFilter,
    interval: Duration,
    seen: HashMap<DriverId, DateTime<Utc>>,
}

impl IntervalSync {
    pub fn new(
        cache: Arc<dyn LocationCache>,
        persister: Arc<dyn BatchPersister>,
        min_distance_meters: f64,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            persister,
            filter: DownsampleFilter::in_memory(min_distance_meters),
            interval,
            seen: HashMap::new(),
        }
    }

    /// Snapshot, down-sample and persist once.
    pub async fn sync_once(&mut self) -> Result<SyncReport> {
        let mut positions = self.cache.get_active_drivers().await?;
        positions.sort_by_key(|p| p.driver_id);

        // A position whose timestamp did not move was handled last tick.
        let points: Vec<TrackPoint> = positions
            .iter()
            .filter(|p| {
                self.seen
                    .get(&p.driver_id)
                    .map_or(true, |seen| p.timestamp > *seen)
            })
            .map(|p| TrackPoint::new(p.driver_id, p.lat, p.lon, p.timestamp))
            .collect();

        let mut report = SyncReport {
            fresh: points.len(),
            ..SyncReport::default()
        };
        if points.is_empty() {
            return Ok(report);
        }

        let unseeded = self.filter.unseeded(points.iter().map(|p| p.driver_id));
        if !unseeded.is_empty() {
            let last = self.persister.last_points(&unseeded).await?;
            self.filter.seed(&unseeded, last);
        }

        let decisions = self.filter.stage(&points);
        let kept: Vec<TrackPoint> = points
            .iter()
            .zip(&decisions)
            .filter(|(_, decision)| decision.is_keep())
            .map(|(point, _)| *point)
            .collect();
        report.dropped = points.len() - kept.len();

        if !kept.is_empty() {
            let outcome = self.persister.persist(&kept).await?;
            for row in &outcome.rejected {
                warn!(
                    driver_id = row.point.driver_id,
                    error = %row.reason,
                    "Position refused by history store"
                );
            }
            let persisted: Vec<TrackPoint> = kept
                .iter()
                .enumerate()
                .filter(|(i, _)| !outcome.rejected.iter().any(|r| r.index == *i))
                .map(|(_, point)| *point)
                .collect();
            self.filter.commit(&persisted);
            report.persisted = persisted.len();
            report.rejected = outcome.rejected.len();
        }

        for point in &points {
            self.seen.insert(point.driver_id, point.recorded_at);
        }
        Ok(report)
    }

    /// Tick every interval until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            min_distance_meters = self.filter.min_distance_meters(),
            "Interval sync started"
        );

        let mut ticks: u64 = 0;
        let mut persisted: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.sync_once().await {
                Ok(report) => {
                    ticks += 1;
                    persisted += report.persisted as u64;
                    debug!(
                        fresh = report.fresh,
                        persisted = report.persisted,
                        dropped = report.dropped,
                        rejected = report.rejected,
                        "Interval sync tick"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Interval sync tick failed");
                }
            }
        }

        info!(ticks, persisted, "Interval sync stopped");
    }
}
