//! Cache Error Types
//!
//! ## Error Categories
//!
//! - `Redis`: the backing store rejected or failed a command. Connection
//!   drops, refusals and timeouts are transient; everything else is not.
//! - `Core`: the data itself is invalid (bad coordinates, malformed entry).
//! - `NoGroup`: a consumer-group operation hit a log whose group was never
//!   created. Callers run `ensure_group` first.
//! - `Corrupt`: a stored value could not be decoded.

use fleetpulse_core::{CoreError, DriverId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Consumer group '{group}' does not exist for driver {driver_id}")]
    NoGroup { driver_id: DriverId, group: String },

    #[error("Corrupt cache value: {0}")]
    Corrupt(String),
}

impl CacheError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
            }
            CacheError::Core(_) | CacheError::NoGroup { .. } | CacheError::Corrupt(_) => false,
        }
    }
}
