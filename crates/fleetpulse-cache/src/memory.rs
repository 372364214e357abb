//! In-process Location Cache
//!
//! Implements [`LocationCache`] and [`AppendLog`] without Redis, reproducing
//! the semantics the pipeline relies on:
//!
//! - location entries expire after the TTL and are lazily evicted from the
//!   active set on read
//! - each driver's log hands entries out in id order through consumer groups
//!   that track a last-delivered id and a pending list (owner, delivery time,
//!   delivery count)
//! - `read_new` blocks until an entry arrives or the wait runs out
//! - group members are forgotten once their last heartbeat is older than the
//!   TTL the caller asks about
//!
//! Time is read from `tokio::time::Instant`, so tests can pause and advance
//! the clock to exercise expiry and idle claims.
//!
//! Clones share state. A clone is what [`AppendLog::dedicated`] hands out.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleetpulse_core::codec;
use fleetpulse_core::{DriverId, DriverPosition, EntryId, LocationUpdate};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::{CacheError, Result};
use crate::{AppendLog, DeadLetterRecord, LocationCache, LogEntry};

#[derive(Clone)]
pub struct MemoryLocationCache {
    shared: Arc<Shared>,
    ttl: Duration,
    append_log: bool,
}

struct Shared {
    state: Mutex<State>,
    appended: Notify,
}

#[derive(Default)]
struct State {
    locations: HashMap<DriverId, CachedLocation>,
    active: BTreeSet<DriverId>,
    logs: BTreeMap<DriverId, DriverLog>,
    retries: HashMap<(DriverId, EntryId), u32>,
    dead_letters: Vec<DeadLetterRecord>,
    last_id: EntryId,
    last_dead_letter_id: EntryId,
    members: HashMap<String, HashMap<String, Instant>>,
}

struct CachedLocation {
    position: DriverPosition,
    expires_at: Instant,
}

#[derive(Default)]
struct DriverLog {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

/// Next id after `last`, derived from the wall clock like a Redis stream id.
fn next_entry_id(last: EntryId) -> EntryId {
    let ms = Utc::now().timestamp_millis().max(0) as u64;
    if ms > last.ms {
        EntryId::new(ms, 0)
    } else {
        last.next()
    }
}

impl State {
    fn append(&mut self, driver_id: DriverId, fields: HashMap<String, String>) -> EntryId {
        let id = next_entry_id(self.last_id);
        self.last_id = id;
        self.logs
            .entry(driver_id)
            .or_default()
            .entries
            .insert(id, fields);
        id
    }

    fn group_mut(&mut self, driver_id: DriverId, group: &str) -> Result<&mut DriverLog> {
        match self.logs.get_mut(&driver_id) {
            Some(log) if log.groups.contains_key(group) => Ok(log),
            _ => Err(CacheError::NoGroup {
                driver_id,
                group: group.to_string(),
            }),
        }
    }

    fn deliver_new(
        &mut self,
        group: &str,
        consumer: &str,
        drivers: &[DriverId],
        count: usize,
        now: Instant,
    ) -> Result<Vec<LogEntry>> {
        let mut delivered = Vec::new();
        for &driver_id in drivers {
            if delivered.len() >= count {
                break;
            }
            let log = self.group_mut(driver_id, group)?;
            let DriverLog { entries, groups } = log;
            let Some(state) = groups.get_mut(group) else {
                continue;
            };

            let start = state.last_delivered.next();
            for (id, fields) in entries.range(start..) {
                if delivered.len() >= count {
                    break;
                }
                state.last_delivered = *id;
                state.pending.insert(
                    *id,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        delivery_count: 1,
                    },
                );
                delivered.push(LogEntry {
                    driver_id,
                    id: *id,
                    fields: fields.clone(),
                    delivery_count: 1,
                });
            }
        }
        Ok(delivered)
    }

    fn evict_expired(&mut self, now: Instant) {
        let expired: Vec<DriverId> = self
            .active
            .iter()
            .copied()
            .filter(|id| {
                self.locations
                    .get(id)
                    .map_or(true, |cached| cached.expires_at <= now)
            })
            .collect();
        for id in expired {
            self.active.remove(&id);
            self.locations.remove(&id);
        }
    }
}

impl MemoryLocationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                appended: Notify::new(),
            }),
            ttl,
            append_log: true,
        }
    }

    /// Turn the per-driver append log on or off for updates made through
    /// this handle.
    pub fn with_append_log(mut self, enabled: bool) -> Self {
        self.append_log = enabled;
        self
    }

    /// Append an arbitrary field map to a driver's log, bypassing validation.
    ///
    /// Lets tests and tooling reproduce what a misbehaving producer would
    /// write straight to the log.
    pub async fn append_raw(&self, driver_id: DriverId, fields: HashMap<String, String>) -> EntryId {
        let id = self.shared.state.lock().await.append(driver_id, fields);
        self.shared.appended.notify_waiters();
        id
    }

    /// Number of entries still held in a driver's log.
    pub async fn log_len(&self, driver_id: DriverId) -> usize {
        self.shared
            .state
            .lock()
            .await
            .logs
            .get(&driver_id)
            .map_or(0, |log| log.entries.len())
    }

    /// Number of delivered-but-unacknowledged entries across all logs.
    pub async fn pending_count(&self, group: &str) -> usize {
        self.shared
            .state
            .lock()
            .await
            .logs
            .values()
            .filter_map(|log| log.groups.get(group))
            .map(|g| g.pending.len())
            .sum()
    }
}

impl Default for MemoryLocationCache {
    fn default() -> Self {
        Self::new(crate::DEFAULT_TTL)
    }
}

#[async_trait]
impl LocationCache for MemoryLocationCache {
    async fn update(&self, update: &LocationUpdate) -> Result<Option<EntryId>> {
        update.validate()?;

        let fields: HashMap<String, String> = codec::encode_fields(update)
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        let position = DriverPosition {
            driver_id: update.driver_id,
            lat: update.point.lat,
            lon: update.point.lon,
            timestamp: update.timestamp,
            status: Some(update.status),
        };

        let id = {
            let mut state = self.shared.state.lock().await;
            state.locations.insert(
                update.driver_id,
                CachedLocation {
                    position,
                    expires_at: Instant::now() + self.ttl,
                },
            );
            state.active.insert(update.driver_id);
            if !self.append_log {
                return Ok(None);
            }
            state.append(update.driver_id, fields)
        };
        self.shared.appended.notify_waiters();
        Ok(Some(id))
    }

    async fn get_active_drivers(&self) -> Result<Vec<DriverPosition>> {
        let mut state = self.shared.state.lock().await;
        state.evict_expired(Instant::now());
        Ok(state
            .active
            .iter()
            .filter_map(|id| state.locations.get(id))
            .map(|cached| cached.position.clone())
            .collect())
    }

    async fn get_driver_location(&self, driver_id: DriverId) -> Result<Option<DriverPosition>> {
        let state = self.shared.state.lock().await;
        let now = Instant::now();
        Ok(state
            .locations
            .get(&driver_id)
            .filter(|cached| cached.expires_at > now)
            .map(|cached| cached.position.clone()))
    }
}

#[async_trait]
impl AppendLog for MemoryLocationCache {
    async fn dedicated(&self) -> Result<Arc<dyn AppendLog>> {
        Ok(Arc::new(self.clone()))
    }

    async fn ensure_group(&self, driver_id: DriverId, group: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state
            .logs
            .entry(driver_id)
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn known_drivers(&self) -> Result<Vec<DriverId>> {
        Ok(self.shared.state.lock().await.logs.keys().copied().collect())
    }

    async fn heartbeat(&self, group: &str, member: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state
            .members
            .entry(group.to_string())
            .or_default()
            .insert(member.to_string(), Instant::now());
        Ok(())
    }

    async fn live_members(&self, group: &str, ttl: Duration) -> Result<Vec<String>> {
        let mut state = self.shared.state.lock().await;
        let Some(members) = state.members.get_mut(group) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        members.retain(|_, seen| now.duration_since(*seen) < ttl);

        let mut live: Vec<String> = members.keys().cloned().collect();
        live.sort();
        Ok(live)
    }

    async fn leave(&self, group: &str, member: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if let Some(members) = state.members.get_mut(group) {
            members.remove(member);
        }
        Ok(())
    }

    async fn read_new(
        &self,
        group: &str,
        consumer: &str,
        drivers: &[DriverId],
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Registered before the check so an append in between still wakes us.
            let appended = self.shared.appended.notified();
            {
                let mut state = self.shared.state.lock().await;
                let now = Instant::now();
                let entries = state.deliver_new(group, consumer, drivers, count, now)?;
                if !entries.is_empty() || now >= deadline {
                    return Ok(entries);
                }
            }
            tokio::select! {
                _ = appended => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        drivers: &[DriverId],
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut state = self.shared.state.lock().await;
        let now = Instant::now();
        let mut redelivered = Vec::new();

        for &driver_id in drivers {
            let log = state.group_mut(driver_id, group)?;
            let DriverLog { entries, groups } = log;
            let Some(group_state) = groups.get_mut(group) else {
                continue;
            };

            // Pending ids whose entry was already deleted have nothing left to do.
            group_state.pending.retain(|id, _| entries.contains_key(id));

            for (id, pending) in group_state.pending.iter_mut() {
                if redelivered.len() >= count {
                    break;
                }
                if pending.consumer != consumer {
                    continue;
                }
                pending.delivered_at = now;
                pending.delivery_count += 1;
                if let Some(fields) = entries.get(id) {
                    redelivered.push(LogEntry {
                        driver_id,
                        id: *id,
                        fields: fields.clone(),
                        delivery_count: pending.delivery_count,
                    });
                }
            }
        }
        Ok(redelivered)
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        drivers: &[DriverId],
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut state = self.shared.state.lock().await;
        let now = Instant::now();
        let mut claimed = Vec::new();

        for &driver_id in drivers {
            let Some(log) = state.logs.get_mut(&driver_id) else {
                continue;
            };
            let DriverLog { entries, groups } = log;
            let Some(group_state) = groups.get_mut(group) else {
                continue;
            };

            group_state.pending.retain(|id, _| entries.contains_key(id));

            for (id, pending) in group_state.pending.iter_mut() {
                if claimed.len() >= count {
                    break;
                }
                if now.duration_since(pending.delivered_at) < min_idle {
                    continue;
                }
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                pending.delivery_count += 1;
                if let Some(fields) = entries.get(id) {
                    claimed.push(LogEntry {
                        driver_id,
                        id: *id,
                        fields: fields.clone(),
                        delivery_count: pending.delivery_count,
                    });
                }
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, group: &str, entries: &[(DriverId, EntryId)]) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        for (driver_id, entry_id) in entries {
            if let Some(log) = state.logs.get_mut(driver_id) {
                if let Some(group_state) = log.groups.get_mut(group) {
                    group_state.pending.remove(entry_id);
                }
                log.entries.remove(entry_id);
            }
            state.retries.remove(&(*driver_id, *entry_id));
        }
        Ok(())
    }

    async fn record_failure(&self, driver_id: DriverId, entry_id: &EntryId) -> Result<u32> {
        let mut state = self.shared.state.lock().await;
        let counter = state.retries.entry((driver_id, *entry_id)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn dead_letter(&self, record: &DeadLetterRecord) -> Result<EntryId> {
        let mut state = self.shared.state.lock().await;
        let id = next_entry_id(state.last_dead_letter_id);
        state.last_dead_letter_id = id;
        state.dead_letters.push(record.clone());
        Ok(id)
    }

    async fn dead_letters(&self, count: usize) -> Result<Vec<DeadLetterRecord>> {
        let state = self.shared.state.lock().await;
        Ok(state.dead_letters.iter().take(count).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetpulse_core::DriverStatus;

    const GROUP: &str = "persisters";

    fn update(driver_id: DriverId, lat: f64, lon: f64) -> LocationUpdate {
        LocationUpdate::new(driver_id, lat, lon, DriverStatus::Online, Utc::now())
    }

    #[test]
    fn test_next_entry_id_is_monotonic() {
        let far_future = EntryId::new(u64::MAX / 2, 7);
        assert_eq!(next_entry_id(far_future), EntryId::new(u64::MAX / 2, 8));
        assert!(next_entry_id(EntryId::MIN) > EntryId::MIN);
    }

    #[tokio::test]
    async fn test_ids_increase_within_a_log() {
        let cache = MemoryLocationCache::default();
        let a = cache.update(&update(1, 1.0, 1.0)).await.unwrap().unwrap();
        let b = cache.update(&update(1, 1.0, 1.1)).await.unwrap().unwrap();
        let c = cache.update(&update(2, 1.0, 1.2)).await.unwrap().unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_without_append_log_only_the_location_is_kept() {
        let cache = MemoryLocationCache::default().with_append_log(false);
        assert_eq!(cache.update(&update(1, 1.0, 1.0)).await.unwrap(), None);
        assert_eq!(cache.update(&update(1, 1.0, 1.1)).await.unwrap(), None);

        assert_eq!(cache.log_len(1).await, 0);
        assert!(cache.known_drivers().await.unwrap().is_empty());
        let active = cache.get_active_drivers().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].lon, 1.1);
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let cache = MemoryLocationCache::default();
        cache.update(&update(1, 1.0, 1.0)).await.unwrap();
        let err = cache
            .read_new(GROUP, "w-0", &[1], 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NoGroup { driver_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_group_created_before_first_append_sees_everything() {
        let cache = MemoryLocationCache::default();
        cache.ensure_group(1, GROUP).await.unwrap();
        cache.ensure_group(1, GROUP).await.unwrap();
        cache.update(&update(1, 1.0, 1.0)).await.unwrap();

        let entries = cache
            .read_new(GROUP, "w-0", &[1], 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(cache.known_drivers().await.unwrap(), vec![1]);
    }
}
