//! Redis Location Cache
//!
//! Production backend for both [`LocationCache`] and [`AppendLog`].
//!
//! ## Write path
//!
//! `update()` issues one atomic pipeline:
//!
//! ```text
//! MULTI
//!   HSET   driver:{id}:location lat .. lon .. ts .. status ..
//!   EXPIRE driver:{id}:location <ttl>
//!   SADD   drivers:active  {id}
//!   SADD   drivers:streams {id}
//!   XADD   driver:{id}:stream * lat .. lon .. ts ..
//! EXEC
//! ```
//!
//! With `append_log` off the `drivers:streams` and `XADD` steps are skipped.
//!
//! ## Read path
//!
//! `get_active_drivers()` reads the active set and fetches every location hash
//! in one pipeline. Ids whose hash came back empty are evicted by a script
//! that re-checks `EXISTS` before each `SREM`, so a driver refreshed between
//! the read and the eviction stays active.
//!
//! ## Consumer groups
//!
//! Reads use `XREADGROUP`, recovery uses `XPENDING` + `XCLAIM` (which also
//! exposes native delivery counts), and acknowledgement is `XACK` + `XDEL` so
//! that persisted entries leave the log.
//!
//! `XREADGROUP`'s `COUNT` applies to every stream of the call, so `read_new`
//! splits its budget between the streams it reads. With more streams than
//! entries wanted, it reads a rotating window of them, one entry each.
//!
//! Group members heartbeat into a sorted set scored by wall-clock
//! milliseconds; members older than the TTL are pruned on every listing.
//!
//! ## Connections
//!
//! A [`ConnectionManager`] multiplexes commands and reconnects on failure.
//! Blocking reads would stall every other user of a shared multiplexed
//! connection, so workers call [`AppendLog::dedicated`] to get their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetpulse_core::codec::{self, format_timestamp};
use fleetpulse_core::{DriverId, DriverPosition, EntryId, LocationUpdate};
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, Script, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::keys;
use crate::{AppendLog, DeadLetterRecord, LocationCache, LogEntry};

const FIELD_STATUS: &str = "status";

/// `KEYS[1]` is the active set, `KEYS[i + 1]` the location hash of driver
/// `ARGV[i]`. Returns how many ids were removed.
const EVICT_EXPIRED: &str = r#"
local removed = 0
for i = 2, #KEYS do
  if redis.call('EXISTS', KEYS[i]) == 0 then
    removed = removed + redis.call('SREM', KEYS[1], ARGV[i - 1])
  end
end
return removed
"#;

const DLQ_DRIVER_ID: &str = "driver_id";
const DLQ_ENTRY_ID: &str = "entry_id";
const DLQ_FAILURE_COUNT: &str = "failure_count";
const DLQ_LAST_ERROR: &str = "last_error";
const DLQ_FAILED_AT: &str = "failed_at";
const DLQ_RESERVED: [&str; 5] = [
    DLQ_DRIVER_ID,
    DLQ_ENTRY_ID,
    DLQ_FAILURE_COUNT,
    DLQ_LAST_ERROR,
    DLQ_FAILED_AT,
];

/// Connection and retention settings for the Redis backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis URL, e.g. `redis://localhost:6379/0`
    pub url: String,

    /// Lifetime of a cached position in seconds (default: 300)
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Optional approximate cap on each driver's append log.
    ///
    /// Trimming discards entries whether or not they were persisted, so this
    /// stays unset unless unbounded growth during a long outage is worse
    /// than losing history.
    #[serde(default)]
    pub stream_maxlen: Option<usize>,

    /// Append every update to the driver's log (default: true).
    ///
    /// Turn off when no consumer group drains the logs, or they grow
    /// without bound.
    #[serde(default = "default_append_log")]
    pub append_log: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            ttl_secs: default_ttl_secs(),
            stream_maxlen: None,
            append_log: default_append_log(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    crate::DEFAULT_TTL.as_secs()
}

fn default_append_log() -> bool {
    true
}

pub struct RedisLocationCache {
    client: Client,
    conn: ConnectionManager,
    config: CacheConfig,
    /// Start of the next `read_new` window when the streams outnumber the
    /// entries wanted.
    read_cursor: AtomicUsize,
}

impl RedisLocationCache {
    pub async fn connect(config: CacheConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            config,
            read_cursor: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn entries_from_reply(reply: StreamReadReply, delivery_count: u32) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        for stream in reply.keys {
            let Some(driver_id) = keys::driver_from_stream(&stream.key) else {
                warn!(key = %stream.key, "Skipping entries from unrecognised stream key");
                continue;
            };
            for sid in &stream.ids {
                if let Some(entry) = log_entry(driver_id, sid, delivery_count) {
                    entries.push(entry);
                }
            }
        }
        entries
    }
}

#[async_trait]
impl LocationCache for RedisLocationCache {
    async fn update(&self, update: &LocationUpdate) -> Result<Option<EntryId>> {
        update.validate()?;

        let driver_id = update.driver_id;
        let fields = codec::encode_fields(update);
        let location_key = keys::location(driver_id);
        let stream_key = keys::stream(driver_id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&location_key, &fields[..])
            .ignore()
            .hset(&location_key, FIELD_STATUS, update.status.as_str())
            .ignore()
            .cmd("EXPIRE")
            .arg(&location_key)
            .arg(self.config.ttl_secs)
            .ignore()
            .sadd(keys::ACTIVE_DRIVERS, driver_id)
            .ignore();

        let mut conn = self.conn.clone();
        if !self.config.append_log {
            let () = pipe.query_async(&mut conn).await?;
            debug!(driver_id, "Location updated");
            return Ok(None);
        }

        pipe.sadd(keys::STREAM_REGISTRY, driver_id).ignore();
        match self.config.stream_maxlen {
            Some(maxlen) => {
                pipe.xadd_maxlen(&stream_key, StreamMaxlen::Approx(maxlen), "*", &fields[..]);
            }
            None => {
                pipe.xadd(&stream_key, "*", &fields[..]);
            }
        }

        let (entry_id,): (String,) = pipe.query_async(&mut conn).await?;

        debug!(driver_id, entry_id = %entry_id, "Location updated");
        Ok(Some(entry_id.parse()?))
    }

    async fn get_active_drivers(&self) -> Result<Vec<DriverPosition>> {
        let mut conn = self.conn.clone();
        let ids: Vec<DriverId> = conn.smembers(keys::ACTIVE_DRIVERS).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(keys::location(*id));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut positions = Vec::with_capacity(ids.len());
        let mut expired = Vec::new();
        for (driver_id, fields) in ids.into_iter().zip(hashes) {
            if fields.is_empty() {
                expired.push(driver_id);
                continue;
            }
            match position_from_fields(driver_id, &fields) {
                Ok(position) => positions.push(position),
                Err(e) => warn!(driver_id, error = %e, "Skipping unreadable cached location"),
            }
        }

        if !expired.is_empty() {
            let script = Script::new(EVICT_EXPIRED);
            let mut invocation = script.key(keys::ACTIVE_DRIVERS);
            for id in &expired {
                invocation.key(keys::location(*id)).arg(*id);
            }
            let removed: i64 = invocation.invoke_async(&mut conn).await?;
            debug!(
                candidates = expired.len(),
                removed,
                "Evicted expired drivers from active set"
            );
        }

        Ok(positions)
    }

    async fn get_driver_location(&self, driver_id: DriverId) -> Result<Option<DriverPosition>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(keys::location(driver_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        position_from_fields(driver_id, &fields).map(Some)
    }
}

#[async_trait]
impl AppendLog for RedisLocationCache {
    async fn dedicated(&self) -> Result<Arc<dyn AppendLog>> {
        let conn = ConnectionManager::new(self.client.clone()).await?;
        Ok(Arc::new(Self {
            client: self.client.clone(),
            conn,
            config: self.config.clone(),
            read_cursor: AtomicUsize::new(0),
        }))
    }

    async fn ensure_group(&self, driver_id: DriverId, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(keys::stream(driver_id), group, "0")
            .await;
        match created {
            Ok(()) => {
                debug!(driver_id, group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn known_drivers(&self) -> Result<Vec<DriverId>> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<DriverId> = conn.smembers(keys::STREAM_REGISTRY).await?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn heartbeat(&self, group: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zadd(keys::members(group), member, chrono::Utc::now().timestamp_millis())
            .await?;
        Ok(())
    }

    async fn live_members(&self, group: &str, ttl: Duration) -> Result<Vec<String>> {
        let key = keys::members(group);
        let cutoff = chrono::Utc::now().timestamp_millis() - ttl.as_millis() as i64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrembyscore(&key, "-inf", cutoff)
            .ignore()
            .zrange(&key, 0, -1);

        let mut conn = self.conn.clone();
        let (mut members,): (Vec<String>,) = pipe.query_async(&mut conn).await?;
        members.sort();
        Ok(members)
    }

    async fn leave(&self, group: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(keys::members(group), member).await?;
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
        if drivers.is_empty() || count == 0 {
            tokio::time::sleep(block).await;
            return Ok(Vec::new());
        }

        let cursor = self.read_cursor.load(Ordering::Relaxed);
        let (streams, per_stream) = read_plan(drivers, count, cursor);
        if streams.len() < drivers.len() {
            self.read_cursor
                .store((cursor + streams.len()) % drivers.len(), Ordering::Relaxed);
        }

        let stream_keys: Vec<String> = streams.iter().map(|d| keys::stream(*d)).collect();
        let ids = vec![">"; stream_keys.len()];
        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(per_stream);
        // BLOCK 0 means "forever" to Redis.
        if !block.is_zero() {
            opts = opts.block(block.as_millis() as usize);
        }

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> =
            conn.xread_options(&stream_keys, &ids, &opts).await?;
        Ok(reply
            .map(|r| Self::entries_from_reply(r, 1))
            .unwrap_or_default())
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        drivers: &[DriverId],
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        if drivers.is_empty() {
            return Ok(Vec::new());
        }

        let stream_keys: Vec<String> = drivers.iter().map(|d| keys::stream(*d)).collect();
        let ids = vec!["0"; stream_keys.len()];
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> =
            conn.xread_options(&stream_keys, &ids, &opts).await?;
        let entries = reply
            .map(|r| Self::entries_from_reply(r, 2))
            .unwrap_or_default();

        // History reads return deleted entries with no fields; they have
        // nothing left to persist.
        let (gone, mut live): (Vec<LogEntry>, Vec<LogEntry>) =
            entries.into_iter().partition(|e| e.fields.is_empty());
        if !gone.is_empty() {
            let ids: Vec<(DriverId, EntryId)> = gone.iter().map(|e| (e.driver_id, e.id)).collect();
            self.ack(group, &ids).await?;
        }
        // `COUNT` is per stream. Whatever is cut stays pending for the next call.
        live.truncate(count);
        Ok(live)
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        drivers: &[DriverId],
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let min_idle_ms = min_idle.as_millis() as usize;
        let mut conn = self.conn.clone();
        let mut claimed = Vec::new();

        for &driver_id in drivers {
            if claimed.len() >= count {
                break;
            }
            let key = keys::stream(driver_id);
            let pending: StreamPendingCountReply = conn
                .xpending_count(&key, group, "-", "+", count - claimed.len())
                .await?;

            let idle: HashMap<String, usize> = pending
                .ids
                .into_iter()
                .filter(|p| p.last_delivered_ms >= min_idle_ms)
                .map(|p| (p.id, p.times_delivered))
                .collect();
            if idle.is_empty() {
                continue;
            }

            let ids: Vec<&String> = idle.keys().collect();
            let reply: StreamClaimReply = conn
                .xclaim(&key, group, consumer, min_idle_ms, &ids)
                .await?;

            for sid in &reply.ids {
                let times = idle.get(&sid.id).copied().unwrap_or(0) as u32;
                if let Some(entry) = log_entry(driver_id, sid, times + 1) {
                    claimed.push(entry);
                }
            }
        }

        claimed.sort_by(|a, b| (a.driver_id, a.id).cmp(&(b.driver_id, b.id)));
        Ok(claimed)
    }

    async fn ack(&self, group: &str, entries: &[(DriverId, EntryId)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (driver_id, entry_id) in entries {
            let key = keys::stream(*driver_id);
            let id = entry_id.to_string();
            pipe.xack(&key, group, &[&id])
                .ignore()
                .xdel(&key, &[&id])
                .ignore()
                .hdel(keys::RETRY_COUNTERS, keys::retry_field(*driver_id, entry_id))
                .ignore();
        }

        let mut conn = self.conn.clone();
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn record_failure(&self, driver_id: DriverId, entry_id: &EntryId) -> Result<u32> {
        let mut conn = self.conn.clone();
        let count: i64 = conn
            .hincr(keys::RETRY_COUNTERS, keys::retry_field(driver_id, entry_id), 1)
            .await?;
        Ok(count.max(0) as u32)
    }

    async fn dead_letter(&self, record: &DeadLetterRecord) -> Result<EntryId> {
        let mut items: Vec<(String, String)> = vec![
            (DLQ_DRIVER_ID.to_string(), record.driver_id.to_string()),
            (DLQ_ENTRY_ID.to_string(), record.entry_id.to_string()),
            (DLQ_FAILURE_COUNT.to_string(), record.failure_count.to_string()),
            (DLQ_LAST_ERROR.to_string(), record.last_error.clone()),
            (DLQ_FAILED_AT.to_string(), format_timestamp(&chrono::Utc::now())),
        ];
        for (name, value) in &record.fields {
            if !DLQ_RESERVED.contains(&name.as_str()) {
                items.push((name.clone(), value.clone()));
            }
        }

        let mut conn = self.conn.clone();
        let id: String = conn.xadd(keys::DEAD_LETTER_STREAM, "*", &items).await?;
        Ok(id.parse()?)
    }

    async fn dead_letters(&self, count: usize) -> Result<Vec<DeadLetterRecord>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrange_count(keys::DEAD_LETTER_STREAM, "-", "+", count)
            .await?;
        reply.ids.iter().map(dead_letter_from_stream_id).collect()
    }
}

/// Streams to read and the `COUNT` for each, so one `XREADGROUP` returns at
/// most `count` entries in total.
fn read_plan(drivers: &[DriverId], count: usize, cursor: usize) -> (Vec<DriverId>, usize) {
    if drivers.is_empty() || count == 0 {
        return (Vec::new(), 0);
    }
    if drivers.len() <= count {
        return (drivers.to_vec(), count / drivers.len());
    }
    let window = drivers
        .iter()
        .cycle()
        .skip(cursor % drivers.len())
        .take(count)
        .copied()
        .collect();
    (window, 1)
}

fn position_from_fields(
    driver_id: DriverId,
    fields: &HashMap<String, String>,
) -> Result<DriverPosition> {
    let point = codec::decode_fields(driver_id, fields)?;
    let status = fields.get(FIELD_STATUS).and_then(|s| s.parse().ok());
    Ok(DriverPosition {
        driver_id,
        lat: point.point.lat,
        lon: point.point.lon,
        timestamp: point.recorded_at,
        status,
    })
}

fn log_entry(driver_id: DriverId, sid: &StreamId, delivery_count: u32) -> Option<LogEntry> {
    match sid.id.parse::<EntryId>() {
        Ok(id) => Some(LogEntry {
            driver_id,
            id,
            fields: string_fields(sid),
            delivery_count,
        }),
        Err(e) => {
            warn!(driver_id, id = %sid.id, error = %e, "Skipping entry with unparseable id");
            None
        }
    }
}

/// Field values are decoded lossily: a producer writing garbage must end up
/// in the dead-letter log, not wedge the read path with a type error.
fn string_fields(sid: &StreamId) -> HashMap<String, String> {
    sid.map
        .iter()
        .map(|(name, value)| (name.clone(), value_to_string(value)))
        .collect()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Data(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Int(i) => i.to_string(),
        Value::Status(s) => s.clone(),
        Value::Okay => "OK".to_string(),
        Value::Nil | Value::Bulk(_) => String::new(),
    }
}

fn dead_letter_from_stream_id(sid: &StreamId) -> Result<DeadLetterRecord> {
    let mut fields = string_fields(sid);
    let mut take = |name: &str| {
        fields
            .remove(name)
            .ok_or_else(|| CacheError::Corrupt(format!("dead letter {} missing '{}'", sid.id, name)))
    };

    let driver_id: DriverId = take(DLQ_DRIVER_ID)?
        .parse()
        .map_err(|_| CacheError::Corrupt(format!("dead letter {} has bad driver_id", sid.id)))?;
    let entry_id: EntryId = take(DLQ_ENTRY_ID)?.parse()?;
    let failure_count: u32 = take(DLQ_FAILURE_COUNT)?
        .parse()
        .map_err(|_| CacheError::Corrupt(format!("dead letter {} has bad failure_count", sid.id)))?;
    let last_error = take(DLQ_LAST_ERROR)?;
    fields.remove(DLQ_FAILED_AT);

    Ok(DeadLetterRecord {
        driver_id,
        entry_id,
        fields,
        failure_count,
        last_error,
    })
}
