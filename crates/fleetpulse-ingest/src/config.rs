//! Ingest Configuration
//!
//! All settings come from `FLEETPULSE_*` environment variables. Anything
//! unset falls back to the default below; anything set but unparseable is a
//! startup error rather than a silent default.
//!
//! | Variable                               | Default                         |
//! |----------------------------------------|---------------------------------|
//! | `FLEETPULSE_REDIS_URL`                 | `redis://127.0.0.1:6379/0`      |
//! | `FLEETPULSE_DATABASE_URL`              | `postgres://localhost/fleetpulse` |
//! | `FLEETPULSE_CACHE_TTL_SECS`            | `300`                           |
//! | `FLEETPULSE_MIN_DISTANCE_METERS`       | `100`                           |
//! | `FLEETPULSE_MAX_RETRIES`               | `5`                             |
//! | `FLEETPULSE_BATCH_SIZE`                | `500`                           |
//! | `FLEETPULSE_BATCH_INTERVAL_MS`         | `1000`                          |
//! | `FLEETPULSE_RETENTION_WEEKS`           | `8`                             |
//! | `FLEETPULSE_WEEKS_AHEAD`               | `4`                             |
//! | `FLEETPULSE_WORKERS`                   | `4`                             |
//! | `FLEETPULSE_CONSUMER_GROUP`            | `location-persisters`           |
//! | `FLEETPULSE_CONSUMER_NAME`             | host name                       |
//! | `FLEETPULSE_CLAIM_IDLE_MS`             | `60000`                         |
//! | `FLEETPULSE_RECOVERY_INTERVAL_MS`      | `30000`                         |
//! | `FLEETPULSE_READ_BLOCK_MS`             | `2000`                          |
//! | `FLEETPULSE_MEMBER_TTL_MS`             | `60000`                         |
//! | `FLEETPULSE_HISTORY_TABLE`             | `location_history`              |
//! | `FLEETPULSE_PERSISTENCE_MODE`          | `consumer-group`                |
//! | `FLEETPULSE_SYNC_INTERVAL_MS`          | `5000`                          |
//! | `FLEETPULSE_MAINTENANCE_INTERVAL_SECS` | `3600`                          |
//! | `FLEETPULSE_STREAM_MAXLEN`             | unset (no trimming)             |
//! | `FLEETPULSE_POOL_SIZE`                 | workers + 2                     |
//!
//! The consumer name is the prefix of every worker's consumer name
//! (`{name}-{index}`). Keep it stable across restarts so a restarted worker
//! picks its own unacknowledged entries back up immediately instead of
//! waiting for the recovery sweep.
//!
//! In `interval-sync` mode nothing drains the append logs, so the cache is
//! configured not to write them (see [`IngestConfig::cache_config`]).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use fleetpulse_cache::CacheConfig;
use fleetpulse_store::partition::validate_table_name;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// How cached locations reach the history store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceMode {
    /// Consumer-group workers drain the per-driver append logs.
    ConsumerGroup,
    /// A single loop snapshots the active drivers on an interval.
    IntervalSync,
}

impl PersistenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistenceMode::ConsumerGroup => "consumer-group",
            PersistenceMode::IntervalSync => "interval-sync",
        }
    }
}

impl fmt::Display for PersistenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersistenceMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "consumer-group" => Ok(PersistenceMode::ConsumerGroup),
            "interval-sync" => Ok(PersistenceMode::IntervalSync),
            other => Err(IngestError::Config(format!(
                "unknown persistence mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    pub redis_url: String,
    pub database_url: String,
    pub cache_ttl_secs: u64,
    pub min_distance_meters: f64,
    pub max_retries: u32,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub retention_weeks: u32,
    pub weeks_ahead: u32,
    pub workers: usize,
    pub consumer_group: String,
    pub consumer_name: String,
    pub claim_idle_ms: u64,
    pub recovery_interval_ms: u64,
    pub read_block_ms: u64,
    pub member_ttl_ms: u64,
    pub history_table: String,
    pub persistence_mode: PersistenceMode,
    pub sync_interval_ms: u64,
    pub maintenance_interval_secs: u64,
    pub stream_maxlen: Option<usize>,
    pub pool_size: Option<u32>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            database_url: "postgres://localhost/fleetpulse".to_string(),
            cache_ttl_secs: 300,
            min_distance_meters: 100.0,
            max_retries: 5,
            batch_size: 500,
            batch_interval_ms: 1000,
            retention_weeks: 8,
            weeks_ahead: 4,
            workers: 4,
            consumer_group: "location-persisters".to_string(),
            consumer_name: default_consumer_name(),
            claim_idle_ms: 60_000,
            recovery_interval_ms: 30_000,
            read_block_ms: 2000,
            member_ttl_ms: 60_000,
            history_table: fleetpulse_store::DEFAULT_HISTORY_TABLE.to_string(),
            persistence_mode: PersistenceMode::ConsumerGroup,
            sync_interval_ms: 5000,
            maintenance_interval_secs: 3600,
            stream_maxlen: None,
            pool_size: None,
        }
    }
}

/// Host name, or a random name when the host name is unavailable.
fn default_consumer_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("ingest-{}", uuid::Uuid::new_v4()))
}

impl IngestConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env { lookup: &lookup };

        let config = Self {
            redis_url: env.string("FLEETPULSE_REDIS_URL", defaults.redis_url),
            database_url: env.string("FLEETPULSE_DATABASE_URL", defaults.database_url),
            cache_ttl_secs: env.parse("FLEETPULSE_CACHE_TTL_SECS", defaults.cache_ttl_secs)?,
            min_distance_meters: env
                .parse("FLEETPULSE_MIN_DISTANCE_METERS", defaults.min_distance_meters)?,
            max_retries: env.parse("FLEETPULSE_MAX_RETRIES", defaults.max_retries)?,
            batch_size: env.parse("FLEETPULSE_BATCH_SIZE", defaults.batch_size)?,
            batch_interval_ms: env
                .parse("FLEETPULSE_BATCH_INTERVAL_MS", defaults.batch_interval_ms)?,
            retention_weeks: env.parse("FLEETPULSE_RETENTION_WEEKS", defaults.retention_weeks)?,
            weeks_ahead: env.parse("FLEETPULSE_WEEKS_AHEAD", defaults.weeks_ahead)?,
            workers: env.parse("FLEETPULSE_WORKERS", defaults.workers)?,
            consumer_group: env.string("FLEETPULSE_CONSUMER_GROUP", defaults.consumer_group),
            consumer_name: env.string("FLEETPULSE_CONSUMER_NAME", defaults.consumer_name),
            claim_idle_ms: env.parse("FLEETPULSE_CLAIM_IDLE_MS", defaults.claim_idle_ms)?,
            recovery_interval_ms: env
                .parse("FLEETPULSE_RECOVERY_INTERVAL_MS", defaults.recovery_interval_ms)?,
            read_block_ms: env.parse("FLEETPULSE_READ_BLOCK_MS", defaults.read_block_ms)?,
            member_ttl_ms: env.parse("FLEETPULSE_MEMBER_TTL_MS", defaults.member_ttl_ms)?,
            history_table: env.string("FLEETPULSE_HISTORY_TABLE", defaults.history_table),
            persistence_mode: env
                .parse("FLEETPULSE_PERSISTENCE_MODE", defaults.persistence_mode)?,
            sync_interval_ms: env.parse("FLEETPULSE_SYNC_INTERVAL_MS", defaults.sync_interval_ms)?,
            maintenance_interval_secs: env.parse(
                "FLEETPULSE_MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval_secs,
            )?,
            stream_maxlen: env.optional("FLEETPULSE_STREAM_MAXLEN")?,
            pool_size: env.optional("FLEETPULSE_POOL_SIZE")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(IngestError::Config("workers must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(IngestError::Config("batch size must be at least 1".into()));
        }
        if !self.min_distance_meters.is_finite() || self.min_distance_meters < 0.0 {
            return Err(IngestError::Config(format!(
                "min distance must be a non-negative number of meters, got {}",
                self.min_distance_meters
            )));
        }
        if self.read_block_ms == 0 || self.recovery_interval_ms == 0 || self.sync_interval_ms == 0 {
            return Err(IngestError::Config(
                "read block, recovery and sync intervals must be at least 1ms".into(),
            ));
        }
        if self.member_ttl() <= crate::worker::DEFAULT_DRIVER_REFRESH {
            return Err(IngestError::Config(format!(
                "member TTL must exceed the {}ms heartbeat interval, got {}ms",
                crate::worker::DEFAULT_DRIVER_REFRESH.as_millis(),
                self.member_ttl_ms
            )));
        }
        if self.cache_ttl_secs == 0 {
            return Err(IngestError::Config("cache TTL must be at least 1s".into()));
        }
        if self.consumer_group.is_empty() || self.consumer_name.is_empty() {
            return Err(IngestError::Config(
                "consumer group and consumer name must not be empty".into(),
            ));
        }
        validate_table_name(&self.history_table)
            .map_err(|e| IngestError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    pub fn member_ttl(&self) -> Duration {
        Duration::from_millis(self.member_ttl_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Cache settings. Append logs are only written when consumer-group
    /// workers drain them.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            url: self.redis_url.clone(),
            ttl_secs: self.cache_ttl_secs,
            stream_maxlen: self.stream_maxlen,
            append_log: self.persistence_mode == PersistenceMode::ConsumerGroup,
        }
    }

    /// Database connections: one per worker plus headroom for maintenance
    /// and seeding queries.
    pub fn pool_size(&self) -> u32 {
        self.pool_size.unwrap_or(self.workers as u32 + 2)
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<'a, F> Env<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, name: &str, default: String) -> String {
        self.raw(name).unwrap_or(default)
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
    {
        match self.raw(name) {
            Some(value) => value.trim().parse().map_err(|_| {
                IngestError::Config(format!("{} has an invalid value '{}'", name, value))
            }),
            None => Ok(default),
        }
    }

    fn optional<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
    {
        match self.raw(name) {
            Some(value) => value.trim().parse().map(Some).map_err(|_| {
                IngestError::Config(format!("{} has an invalid value '{}'", name, value))
            }),
            None => Ok(None),
        }
    }
}
