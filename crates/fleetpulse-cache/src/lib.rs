//! Fleetpulse Location Cache
//!
//! This crate is the entry point of the location pipeline. Producers call
//! [`LocationCache::update`]; dispatch reads [`LocationCache::get_active_drivers`].
//! Unless the append log is switched off, every update also lands on the
//! driver's append log, which the persistence workers drain through the
//! [`AppendLog`] consumer-group primitives.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   update()    ┌───────────────────────────────┐
//! │   Producer   │ ────────────► │ LocationCache                 │
//! └──────────────┘               │  location hash (TTL)          │
//!                                │  active set                   │
//! ┌──────────────┐ get_active_   │  per-driver append log ───────┼──┐
//! │   Dispatch   │ ◄──────────── │                               │  │
//! └──────────────┘   drivers()   └───────────────────────────────┘  │
//!                                                                   │ AppendLog
//!                                ┌───────────────────────────────┐  │
//!                                │ persistence workers           │ ◄┘
//!                                │  read / claim / ack / DLQ     │
//!                                └───────────────────────────────┘
//! ```
//!
//! ## Backends
//!
//! - [`RedisLocationCache`]: production backend (hashes, sets, streams,
//!   consumer groups).
//! - [`MemoryLocationCache`]: single-process backend with the same
//!   semantics, used for development and tests.
//!
//! ## Guarantees
//!
//! `update` is acknowledged once the backing store accepted all writes; no
//! stronger durability is promised. There is no fallback tier: when Redis is
//! unavailable the error surfaces to the caller, who decides whether to retry.

pub mod error;
pub mod keys;
pub mod memory;
pub mod redis_cache;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use fleetpulse_core::{DriverId, DriverPosition, EntryId, LocationUpdate};

pub use error::{CacheError, Result};
pub use memory::MemoryLocationCache;
pub use redis_cache::{CacheConfig, RedisLocationCache};

/// Default lifetime of a cached position.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Write and read path used by producers and dispatch.
#[async_trait]
pub trait LocationCache: Send + Sync {
    /// Record a driver's position.
    ///
    /// Overwrites the cached position and resets its TTL, marks the driver
    /// active, and appends the point to the driver's append log. Returns the
    /// id of the appended log entry, or `None` when the backend keeps no
    /// append logs (interval-sync deployments, where nothing would drain
    /// them).
    ///
    /// # Errors
    ///
    /// - `Core(InvalidCoordinate)` for out-of-range or non-finite coordinates
    /// - `Redis` when the store is unavailable
    async fn update(&self, update: &LocationUpdate) -> Result<Option<EntryId>>;

    /// Positions of every driver whose cache entry is still live.
    ///
    /// Ids whose entry has expired are removed from the active set as a side
    /// effect (lazy eviction) and are not returned.
    async fn get_active_drivers(&self) -> Result<Vec<DriverPosition>>;

    /// Last known position of one driver, if its entry has not expired.
    async fn get_driver_location(&self, driver_id: DriverId) -> Result<Option<DriverPosition>>;
}

/// One entry read from a driver's append log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub driver_id: DriverId,
    pub id: EntryId,
    /// Raw field map as stored; decoding is the consumer's job so that
    /// malformed payloads can be isolated rather than failing the read.
    pub fields: HashMap<String, String>,
    /// How many times this entry has been handed to a consumer, this
    /// delivery included.
    pub delivery_count: u32,
}

/// A poison-pilled entry together with its failure context.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    pub driver_id: DriverId,
    pub entry_id: EntryId,
    pub fields: HashMap<String, String>,
    pub failure_count: u32,
    pub last_error: String,
}

/// Consumer-group operations over the per-driver append logs.
///
/// Each entry is owned by at most one consumer of a group at a time. Workers
/// also publish heartbeats in a per-group member list, from which every
/// worker derives the same driver assignment.
/// Entries are removed from the log by [`ack`](AppendLog::ack), which callers
/// must only invoke once the entry's effect is committed or dead-lettered.
#[async_trait]
pub trait AppendLog: Send + Sync {
    /// A handle with its own connection, for workers that block on reads.
    async fn dedicated(&self) -> Result<std::sync::Arc<dyn AppendLog>>;

    /// Create `group` on the driver's log at its start offset. An existing
    /// group is not an error.
    async fn ensure_group(&self, driver_id: DriverId, group: &str) -> Result<()>;

    /// Drivers that own an append log.
    async fn known_drivers(&self) -> Result<Vec<DriverId>>;

    /// Record that `member` of `group` is alive now.
    async fn heartbeat(&self, group: &str, member: &str) -> Result<()>;

    /// Members of `group` that sent a heartbeat within `ttl`, sorted by name.
    /// Members silent for longer are removed.
    async fn live_members(&self, group: &str, ttl: Duration) -> Result<Vec<String>>;

    /// Remove `member` from `group` without waiting for it to go stale.
    async fn leave(&self, group: &str, member: &str) -> Result<()>;

    /// Deliver up to `count` never-delivered entries from the given logs to
    /// `consumer`, waiting at most `block` for one to arrive.
    async fn read_new(
        &self,
        group: &str,
        consumer: &str,
        drivers: &[DriverId],
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>>;

    /// Re-deliver entries already owned by `consumer` but never acknowledged
    /// (e.g. delivered before a restart).
    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        drivers: &[DriverId],
        count: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Take over entries that have sat unacknowledged with any consumer for
    /// at least `min_idle`.
    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        drivers: &[DriverId],
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Acknowledge entries, remove them from their logs and clear their
    /// failure counters.
    async fn ack(&self, group: &str, entries: &[(DriverId, EntryId)]) -> Result<()>;

    /// Increment and return the durable failure counter of an entry.
    async fn record_failure(&self, driver_id: DriverId, entry_id: &EntryId) -> Result<u32>;

    /// Append a record to the dead-letter log.
    async fn dead_letter(&self, record: &DeadLetterRecord) -> Result<EntryId>;

    /// Oldest `count` dead-letter records.
    async fn dead_letters(&self, count: usize) -> Result<Vec<DeadLetterRecord>>;
}
