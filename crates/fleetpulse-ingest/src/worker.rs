//! Stream Worker
//!
//! One member of the consumer group. A worker owns a share of drivers (by
//! [`HashRing`] over the group's live members), reads their append logs,
//! down-samples, persists and only then acknowledges.
//!
//! ## States
//!
//! ```text
//!        ┌──────────────────────────────────────────────┐
//!        ▼                                              │
//!     ┌──────┐  read_new   ┌─────────┐ batch due ┌────────────┐ commit ┌────────┐
//!     │ Idle │ ──────────► │ Reading │ ────────► │ Processing │ ─────► │ Acking │
//!     └──────┘             └─────────┘           └────────────┘        └────────┘
//!        │
//!        │ every recovery_interval
//!        ▼
//!   ┌───────────────┐
//!   │ RecoverySweep │  claim entries idle for claim_idle, feed them to the batch
//!   └───────────────┘
//! ```
//!
//! ## Delivery
//!
//! - Entries are acknowledged strictly after the history write committed, so
//!   a crash in between redelivers them (at-least-once). The history table's
//!   `(driver_id, recorded_at)` key and the down-sample state make the
//!   second pass a no-op.
//! - At startup the worker first re-reads the entries it owned before a
//!   restart (same consumer name), then starts on new ones.
//! - Malformed entries and rows the database refuses are poison pills: they
//!   go to the dead-letter log on first sight.
//! - A batch-wide write failure bumps every entry's durable failure counter.
//!   Entries over the retry budget are dead-lettered, the rest are retried
//!   after an exponential backoff.
//! - When rows are refused, the entries not yet stored are down-sampled again
//!   without the refused points, so a point is never dropped for being close
//!   to one that never reached history.
//!
//! ## Membership
//!
//! Workers heartbeat into the group's member list on every driver refresh
//! and build the ring from the members seen within `member_ttl`. Every
//! process therefore derives the same owner for a driver.
//!
//! - A worker that joins a group with live members waits `join_grace` (one
//!   refresh plus one read) before reading, so current owners notice it and
//!   hand over.
//! - A worker that loses drivers writes its batch first, then forgets their
//!   down-sample state.
//! - A stopping worker leaves the list after its last batch. A crashed one
//!   drops out after `member_ttl`; its pending entries are claimed by the
//!   next owner's recovery sweep.
//!
//! A handover waits for the old owner's batch write, but not for a write
//! still in retry backoff. Such entries may be written by both owners; the
//! history key keeps one copy.
//!
//! ## Shutdown
//!
//! Cancellation stops reading; the batch in hand is written and acknowledged
//! before `run` returns. If that write fails, the entries stay pending and are
//! picked up again by the next worker with this name or by a recovery sweep.
//! The worker then leaves the member list.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetpulse_cache::{AppendLog, CacheError, LogEntry};
use fleetpulse_core::{codec, DriverId, TrackPoint};
use fleetpulse_store::BatchPersister;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::BatchAccumulator;
use crate::config::IngestConfig;
use crate::dead_letter::DeadLetterRouter;
use crate::downsample::{Decision, DownsampleFilter, Resolution, DEFAULT_MIN_DISTANCE_METERS};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::ring::HashRing;

/// How often a worker re-lists drivers to pick up new append logs.
pub const DEFAULT_DRIVER_REFRESH: Duration = Duration::from_secs(5);

/// How long a member stays on the ring without a heartbeat.
pub const DEFAULT_MEMBER_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub group: String,
    /// Consumer name; also the worker's name on the ring.
    pub consumer: String,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub read_block: Duration,
    pub claim_idle: Duration,
    pub recovery_interval: Duration,
    /// Interval of driver re-listing and membership heartbeats.
    pub driver_refresh: Duration,
    pub member_ttl: Duration,
    pub min_distance_meters: f64,
    pub retry: RetryPolicy,
}

impl WorkerConfig {
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            batch_size: 500,
            batch_interval: Duration::from_secs(1),
            read_block: Duration::from_secs(2),
            claim_idle: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(30),
            driver_refresh: DEFAULT_DRIVER_REFRESH,
            member_ttl: DEFAULT_MEMBER_TTL,
            min_distance_meters: DEFAULT_MIN_DISTANCE_METERS,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_ingest(config: &IngestConfig, consumer: impl Into<String>) -> Self {
        Self {
            group: config.consumer_group.clone(),
            consumer: consumer.into(),
            batch_size: config.batch_size,
            batch_interval: config.batch_interval(),
            read_block: config.read_block(),
            claim_idle: config.claim_idle(),
            recovery_interval: config.recovery_interval(),
            driver_refresh: DEFAULT_DRIVER_REFRESH,
            member_ttl: config.member_ttl(),
            min_distance_meters: config.min_distance_meters,
            retry: RetryPolicy::with_max_retries(config.max_retries),
        }
    }

    /// Wait of a newcomer before its first read: long enough for every
    /// current member to refresh and finish the read in flight.
    pub fn join_grace(&self) -> Duration {
        self.driver_refresh + self.read_block
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Idle,
    Reading,
    Processing,
    Acking,
    RecoverySweep,
    Stopped,
}

/// Counters of one worker, or the sum over a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Entries delivered to the worker, redeliveries included.
    pub read: u64,
    /// Entries whose point is committed to history.
    pub persisted: u64,
    /// Entries acknowledged without a write (down-sampled away).
    pub dropped: u64,
    pub dead_lettered: u64,
    /// Batch writes that failed and were retried or given up.
    pub retries: u64,
    /// Entries redelivered at startup or claimed by a recovery sweep.
    pub reclaimed: u64,
}

impl std::ops::AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.read += other.read;
        self.persisted += other.persisted;
        self.dropped += other.dropped;
        self.dead_lettered += other.dead_lettered;
        self.retries += other.retries;
        self.reclaimed += other.reclaimed;
    }
}

#[derive(Debug, Default)]
struct WorkerCounters {
    read: AtomicU64,
    persisted: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
    retries: AtomicU64,
    reclaimed: AtomicU64,
}

impl WorkerCounters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            read: self.read.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

/// Read-only view of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    name: String,
    state: Arc<RwLock<WorkerState>>,
    counters: Arc<WorkerCounters>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }
}

/// Where an entry of a batch being written stands.
#[derive(Debug, Clone, PartialEq)]
enum Fate {
    /// Not stored yet; down-sampled away if nothing else happens.
    Open,
    Stored,
    /// The store turned the row down.
    Refused(String),
    /// Dead-lettered after failed writes, or left pending at shutdown.
    Abandoned,
}

impl Fate {
    fn resolution(&self) -> Resolution {
        match self {
            Fate::Open => Resolution::Open,
            Fate::Stored => Resolution::Stored,
            Fate::Refused(_) | Fate::Abandoned => Resolution::Discarded,
        }
    }
}

pub struct StreamWorker {
    config: WorkerConfig,
    log: Arc<dyn AppendLog>,
    persister: Arc<dyn BatchPersister>,
    await_handover: bool,
    filter: DownsampleFilter,
    dead_letters: DeadLetterRouter,
    owned: Vec<DriverId>,
    grouped: HashSet<DriverId>,
    refreshed_at: Option<Instant>,
    state: Arc<RwLock<WorkerState>>,
    counters: Arc<WorkerCounters>,
}

impl StreamWorker {
    pub fn new(
        config: WorkerConfig,
        log: Arc<dyn AppendLog>,
        persister: Arc<dyn BatchPersister>,
    ) -> Self {
        let filter = DownsampleFilter::in_memory(config.min_distance_meters);
        let dead_letters = DeadLetterRouter::new(Arc::clone(&log), config.group.clone());
        Self {
            config,
            log,
            persister,
            await_handover: true,
            filter,
            dead_letters,
            owned: Vec::new(),
            grouped: HashSet::new(),
            refreshed_at: None,
            state: Arc::new(RwLock::new(WorkerState::Idle)),
            counters: Arc::new(WorkerCounters::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.consumer
    }

    /// Start reading without the join grace, for a worker whose joining was
    /// already announced and waited out (see [`ConsumerPool`](crate::ConsumerPool)).
    pub fn joined(mut self) -> Self {
        self.await_handover = false;
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            name: self.config.consumer.clone(),
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Drivers this worker currently reads.
    pub fn owned_drivers(&self) -> &[DriverId] {
        &self.owned
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            worker = %self.config.consumer,
            group = %self.config.group,
            batch_size = self.config.batch_size,
            batch_interval_ms = self.config.batch_interval.as_millis() as u64,
            "Stream worker started"
        );

        let mut batch = BatchAccumulator::new(self.config.batch_size, self.config.batch_interval);

        if let Err(e) = self.join(&cancel).await {
            warn!(worker = %self.config.consumer, error = %e, "Joining the group failed");
        }
        if let Err(e) = self.refresh_drivers(&mut batch, &cancel).await {
            warn!(worker = %self.config.consumer, error = %e, "Initial driver refresh failed");
        }
        self.redeliver_own(&mut batch, &cancel).await;
        let mut next_sweep = Instant::now() + self.config.recovery_interval;

        while !cancel.is_cancelled() {
            if Instant::now() >= next_sweep {
                self.recovery_sweep(&mut batch, &cancel).await;
                next_sweep = Instant::now() + self.config.recovery_interval;
            }

            if batch.should_flush() {
                self.flush(&mut batch, &cancel).await;
                self.set_state(WorkerState::Idle).await;
                continue;
            }

            if self.driver_refresh_due() {
                if let Err(e) = self.refresh_drivers(&mut batch, &cancel).await {
                    warn!(worker = %self.config.consumer, error = %e, "Driver refresh failed");
                }
            }

            let mut wait = self
                .config
                .read_block
                .min(next_sweep.saturating_duration_since(Instant::now()));
            if let Some(due) = batch.time_until_due() {
                wait = wait.min(due);
            }

            self.set_state(WorkerState::Reading).await;
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.log.read_new(
                    &self.config.group,
                    &self.config.consumer,
                    &self.owned,
                    batch.remaining(),
                    wait,
                ) => read,
            };

            match read {
                Ok(entries) => {
                    if !entries.is_empty() {
                        bump(&self.counters.read, entries.len());
                        debug!(
                            worker = %self.config.consumer,
                            entries = entries.len(),
                            "Read entries"
                        );
                        batch.extend(entries);
                    }
                }
                Err(e) => {
                    if matches!(e, CacheError::NoGroup { .. }) {
                        self.grouped.clear();
                        self.refreshed_at = None;
                    }
                    warn!(worker = %self.config.consumer, error = %e, "Append log read failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry.initial_backoff) => {}
                    }
                }
            }
        }

        if !batch.is_empty() {
            info!(
                worker = %self.config.consumer,
                entries = batch.len(),
                "Flushing in-flight batch before shutdown"
            );
            self.flush(&mut batch, &cancel).await;
        }

        if let Err(e) = self.log.leave(&self.config.group, &self.config.consumer).await {
            warn!(worker = %self.config.consumer, error = %e, "Leaving the group failed");
        }

        self.set_state(WorkerState::Stopped).await;
        let stats = self.counters.snapshot();
        info!(
            worker = %self.config.consumer,
            read = stats.read,
            persisted = stats.persisted,
            dropped = stats.dropped,
            dead_lettered = stats.dead_lettered,
            retries = stats.retries,
            reclaimed = stats.reclaimed,
            "Stream worker stopped"
        );
        Ok(())
    }

    async fn set_state(&self, state: WorkerState) {
        *self.state.write().await = state;
    }

    fn driver_refresh_due(&self) -> bool {
        self.refreshed_at
            .map_or(true, |at| at.elapsed() >= self.config.driver_refresh)
    }

    /// Announce this worker and, if others are live, give them time to hand
    /// over before the first read.
    async fn join(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.log
            .heartbeat(&self.config.group, &self.config.consumer)
            .await?;
        if !self.await_handover {
            return Ok(());
        }

        let others = self
            .log
            .live_members(&self.config.group, self.config.member_ttl)
            .await?
            .into_iter()
            .filter(|m| *m != self.config.consumer)
            .count();
        if others > 0 {
            let grace = self.config.join_grace();
            info!(
                worker = %self.config.consumer,
                members = others,
                grace_ms = grace.as_millis() as u64,
                "Joining a live group, waiting for handover"
            );
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => {}
            }
        }
        Ok(())
    }

    /// Heartbeat, recompute the owned drivers from the live members and make
    /// sure each owned driver has the group.
    ///
    /// Entries of drivers this worker loses are written out before the
    /// new owner's grace runs out.
    async fn refresh_drivers(
        &mut self,
        batch: &mut BatchAccumulator<LogEntry>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.log
            .heartbeat(&self.config.group, &self.config.consumer)
            .await?;
        let mut members = self
            .log
            .live_members(&self.config.group, self.config.member_ttl)
            .await?;
        if !members.contains(&self.config.consumer) {
            members.push(self.config.consumer.clone());
        }
        let ring = HashRing::new(members);

        let known = self.log.known_drivers().await?;
        let owned = ring.owned_by(&self.config.consumer, &known);

        let keep: HashSet<DriverId> = owned.iter().copied().collect();
        let lost: Vec<DriverId> = self
            .owned
            .iter()
            .copied()
            .filter(|d| !keep.contains(d))
            .collect();
        if !lost.is_empty() {
            if !batch.is_empty() {
                self.flush(batch, cancel).await;
            }
            for &driver_id in &lost {
                self.filter.forget(driver_id);
            }
            info!(
                worker = %self.config.consumer,
                lost = lost.len(),
                members = ring.members().len(),
                "Handed over drivers"
            );
        }

        for &driver_id in &owned {
            if self.grouped.contains(&driver_id) {
                continue;
            }
            self.log.ensure_group(driver_id, &self.config.group).await?;
            self.grouped.insert(driver_id);
        }

        if owned != self.owned {
            debug!(
                worker = %self.config.consumer,
                owned = owned.len(),
                known = known.len(),
                members = ring.members().len(),
                "Driver assignment updated"
            );
        }
        self.owned = owned;
        self.refreshed_at = Some(Instant::now());
        Ok(())
    }

    /// Process entries this consumer received before a restart but never
    /// acknowledged.
    async fn redeliver_own(
        &mut self,
        batch: &mut BatchAccumulator<LogEntry>,
        cancel: &CancellationToken,
    ) {
        if self.owned.is_empty() {
            return;
        }
        self.set_state(WorkerState::RecoverySweep).await;

        loop {
            let want = batch.remaining();
            let entries = match self
                .log
                .read_pending(&self.config.group, &self.config.consumer, &self.owned, want)
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        worker = %self.config.consumer,
                        error = %e,
                        "Reading own pending entries failed"
                    );
                    return;
                }
            };

            let found = entries.len();
            if found == 0 {
                return;
            }
            bump(&self.counters.read, found);
            bump(&self.counters.reclaimed, found);
            info!(
                worker = %self.config.consumer,
                entries = found,
                "Redelivering unacknowledged entries"
            );

            batch.extend(entries);
            let settled = self.flush(batch, cancel).await;
            if !settled || found < want || cancel.is_cancelled() {
                return;
            }
        }
    }

    /// Claim entries another consumer (or this one, before a failure) left
    /// unacknowledged for too long.
    async fn recovery_sweep(
        &mut self,
        batch: &mut BatchAccumulator<LogEntry>,
        cancel: &CancellationToken,
    ) {
        if self.owned.is_empty() {
            return;
        }
        if batch.is_full() {
            self.flush(batch, cancel).await;
        }
        self.set_state(WorkerState::RecoverySweep).await;

        match self
            .log
            .claim_idle(
                &self.config.group,
                &self.config.consumer,
                &self.owned,
                self.config.claim_idle,
                batch.remaining(),
            )
            .await
        {
            Ok(entries) if !entries.is_empty() => {
                bump(&self.counters.read, entries.len());
                bump(&self.counters.reclaimed, entries.len());
                info!(
                    worker = %self.config.consumer,
                    entries = entries.len(),
                    "Reclaimed idle entries"
                );
                batch.extend(entries);
            }
            Ok(_) => {
                debug!(worker = %self.config.consumer, "Recovery sweep found nothing idle");
            }
            Err(e) => {
                warn!(worker = %self.config.consumer, error = %e, "Recovery sweep failed");
            }
        }
    }

    /// Write and acknowledge everything in `batch`.
    ///
    /// Returns whether every entry ended up acknowledged (persisted, dropped
    /// or dead-lettered).
    async fn flush(
        &mut self,
        batch: &mut BatchAccumulator<LogEntry>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut entries = batch.drain();
        if entries.is_empty() {
            return true;
        }
        self.set_state(WorkerState::Processing).await;

        // Per-driver log order, and one copy of an entry both redelivered
        // and claimed.
        entries.sort_by_key(|e| (e.driver_id, e.id));
        entries.dedup_by_key(|e| (e.driver_id, e.id));

        let mut decoded = Vec::with_capacity(entries.len());
        let mut malformed = Vec::new();
        for entry in entries {
            match codec::decode_fields(entry.driver_id, &entry.fields) {
                Ok(point) => decoded.push((entry, point)),
                Err(e) => malformed.push((entry, e.to_string())),
            }
        }

        let mut settled = true;
        if !malformed.is_empty() {
            let failed: Vec<(&LogEntry, u32, String)> = malformed
                .iter()
                .map(|(entry, reason)| (entry, 1, reason.clone()))
                .collect();
            settled &= self.route_dead_letters(&failed).await;
        }

        if !decoded.is_empty() {
            settled &= self.persist_and_ack(decoded, cancel).await;
        }
        settled
    }

    /// Write the decoded entries until each one is stored, down-sampled away,
    /// refused or given up on, then acknowledge.
    async fn persist_and_ack(
        &mut self,
        entries: Vec<(LogEntry, TrackPoint)>,
        cancel: &CancellationToken,
    ) -> bool {
        let points: Vec<TrackPoint> = entries.iter().map(|(_, point)| *point).collect();
        let mut fates = vec![Fate::Open; entries.len()];
        let mut settled = true;
        let mut attempt: u32 = 0;

        loop {
            let error = match self.write_round(&points, &mut fates).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => e,
            };

            attempt += 1;
            bump(&self.counters.retries, 1);

            let open: Vec<usize> = (0..fates.len())
                .filter(|&i| fates[i] == Fate::Open)
                .collect();
            let (exhausted, failures) = self.count_failures(&entries, &open, attempt).await;

            if !exhausted.is_empty() {
                let last_error = error.to_string();
                let failed: Vec<(&LogEntry, u32, String)> = exhausted
                    .iter()
                    .map(|&(i, count)| (&entries[i].0, count, last_error.clone()))
                    .collect();
                settled &= self.route_dead_letters(&failed).await;
                for &(i, _) in &exhausted {
                    fates[i] = Fate::Abandoned;
                }
            }

            let retryable = open.len() - exhausted.len();
            if retryable == 0 {
                break;
            }

            let delay = self.config.retry.backoff_after(failures);
            warn!(
                worker = %self.config.consumer,
                error = %error,
                attempt,
                entries = retryable,
                delay_ms = delay.as_millis() as u64,
                "Batch write failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(
                        worker = %self.config.consumer,
                        entries = retryable,
                        "Shutdown during retry backoff, leaving entries for redelivery"
                    );
                    for fate in fates.iter_mut().filter(|f| **f == Fate::Open) {
                        *fate = Fate::Abandoned;
                    }
                    settled = false;
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        settled &= self.settle(&entries, &fates).await;
        settled
    }

    /// Seed, down-sample the open entries against the stored ones and write
    /// those kept. Filter state is untouched.
    ///
    /// Returns whether the store refused rows, in which case the entries
    /// still open need another round.
    async fn write_round(&mut self, points: &[TrackPoint], fates: &mut [Fate]) -> Result<bool> {
        let unseeded = self.filter.unseeded(points.iter().map(|p| p.driver_id));
        if !unseeded.is_empty() {
            let last = self.persister.last_points(&unseeded).await?;
            self.filter.seed(&unseeded, last);
        }

        let resolutions: Vec<Resolution> = fates.iter().map(Fate::resolution).collect();
        let kept: Vec<usize> = self
            .filter
            .restage(points, &resolutions)
            .iter()
            .enumerate()
            .filter(|(_, decision)| matches!(decision, Some(Decision::Keep)))
            .map(|(i, _)| i)
            .collect();
        if kept.is_empty() {
            return Ok(false);
        }

        let rows: Vec<TrackPoint> = kept.iter().map(|&i| points[i]).collect();
        let outcome = self.persister.persist(&rows).await?;

        // Rejected indexes refer to `rows`.
        for row in &outcome.rejected {
            if let Some(&i) = kept.get(row.index) {
                fates[i] = Fate::Refused(row.reason.clone());
            }
        }
        for &i in &kept {
            if fates[i] == Fate::Open {
                fates[i] = Fate::Stored;
            }
        }

        debug!(
            worker = %self.config.consumer,
            kept = kept.len(),
            written = outcome.written,
            rejected = outcome.rejected.len(),
            "Batch written"
        );
        Ok(!outcome.rejected.is_empty())
    }

    /// Bump the durable failure counter of the entries at `open` and return
    /// those over the retry budget with their counts, plus the highest count
    /// seen.
    async fn count_failures(
        &self,
        entries: &[(LogEntry, TrackPoint)],
        open: &[usize],
        attempt: u32,
    ) -> (Vec<(usize, u32)>, u32) {
        let mut exhausted = Vec::new();
        let mut highest = 0;

        for &i in open {
            let entry = &entries[i].0;
            let failures = match self.log.record_failure(entry.driver_id, &entry.id).await {
                Ok(count) => count,
                Err(e) => {
                    // Counter unreachable: fall back to this process's attempts.
                    debug!(
                        driver_id = entry.driver_id,
                        entry_id = %entry.id,
                        error = %e,
                        "Recording failure failed"
                    );
                    attempt
                }
            };
            highest = highest.max(failures);
            if self.config.retry.exhausted(failures) {
                exhausted.push((i, failures));
            }
        }
        (exhausted, highest)
    }

    /// Apply the fates of a written batch: advance the filter with the stored
    /// points, dead-letter refused rows and acknowledge stored and dropped
    /// entries.
    async fn settle(&mut self, entries: &[(LogEntry, TrackPoint)], fates: &[Fate]) -> bool {
        self.set_state(WorkerState::Acking).await;

        let mut committed = Vec::new();
        let mut dropped = 0usize;
        let mut to_ack = Vec::with_capacity(entries.len());
        let mut refused: Vec<(&LogEntry, u32, String)> = Vec::new();

        for ((entry, point), fate) in entries.iter().zip(fates) {
            match fate {
                Fate::Stored => {
                    committed.push(*point);
                    to_ack.push((entry.driver_id, entry.id));
                }
                Fate::Open => {
                    dropped += 1;
                    to_ack.push((entry.driver_id, entry.id));
                }
                Fate::Refused(reason) => refused.push((entry, 1, reason.clone())),
                Fate::Abandoned => {}
            }
        }

        self.filter.commit(&committed);
        bump(&self.counters.persisted, committed.len());
        bump(&self.counters.dropped, dropped);

        let mut settled = true;
        if !refused.is_empty() {
            settled &= self.route_dead_letters(&refused).await;
        }

        if !to_ack.is_empty() {
            if let Err(e) = self.log.ack(&self.config.group, &to_ack).await {
                warn!(
                    worker = %self.config.consumer,
                    error = %e,
                    entries = to_ack.len(),
                    "Acknowledging batch failed, entries will be reclaimed"
                );
                settled = false;
            }
        }

        debug!(
            worker = %self.config.consumer,
            persisted = committed.len(),
            dropped,
            rejected = refused.len(),
            "Batch settled"
        );
        settled
    }

    async fn route_dead_letters(&self, failed: &[(&LogEntry, u32, String)]) -> bool {
        match self.dead_letters.route_all(failed).await {
            Ok(()) => {
                bump(&self.counters.dead_lettered, failed.len());
                true
            }
            Err(e) => {
                warn!(
                    worker = %self.config.consumer,
                    error = %e,
                    entries = failed.len(),
                    "Dead-lettering failed, entries stay pending"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_ingest() {
        let ingest = IngestConfig {
            consumer_group: "g".to_string(),
            batch_size: 50,
            max_retries: 2,
            ..IngestConfig::default()
        };
        let config = WorkerConfig::from_ingest(&ingest, "host-0");
        assert_eq!(config.group, "g");
        assert_eq!(config.consumer, "host-0");
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.claim_idle, Duration::from_secs(60));
        assert_eq!(config.member_ttl, DEFAULT_MEMBER_TTL);
        assert_eq!(config.join_grace(), Duration::from_secs(7));
    }

    #[test]
    fn test_fate_resolution() {
        assert_eq!(Fate::Open.resolution(), Resolution::Open);
        assert_eq!(Fate::Stored.resolution(), Resolution::Stored);
        assert_eq!(
            Fate::Refused("bad row".to_string()).resolution(),
            Resolution::Discarded
        );
        assert_eq!(Fate::Abandoned.resolution(), Resolution::Discarded);
    }

    #[test]
    fn test_stats_add() {
        let mut total = WorkerStats::default();
        total += WorkerStats {
            read: 3,
            persisted: 2,
            dropped: 1,
            ..WorkerStats::default()
        };
        total += WorkerStats {
            read: 1,
            dead_lettered: 1,
            ..WorkerStats::default()
        };
        assert_eq!(total.read, 4);
        assert_eq!(total.persisted, 2);
        assert_eq!(total.dead_lettered, 1);
    }
}
