//! Redis key layout.
//!
//! | Key                     | Type   | Purpose                                  |
//! |-------------------------|--------|------------------------------------------|
//! | `driver:{id}:location`  | hash   | last known point, expires after the TTL  |
//! | `drivers:active`        | set    | ids with a live location hash            |
//! | `driver:{id}:stream`    | stream | per-driver append log                    |
//! | `drivers:streams`       | set    | ids that own an append log               |
//! | `location:retries`      | hash   | failure counters, `{driver}:{entry}`     |
//! | `location:dead_letter`  | stream | poison-pilled entries with context       |
//! | `group:{name}:members`  | zset   | worker names scored by last heartbeat ms |

use fleetpulse_core::{DriverId, EntryId};

pub const ACTIVE_DRIVERS: &str = "drivers:active";
pub const STREAM_REGISTRY: &str = "drivers:streams";
pub const RETRY_COUNTERS: &str = "location:retries";
pub const DEAD_LETTER_STREAM: &str = "location:dead_letter";

pub fn location(driver_id: DriverId) -> String {
    format!("driver:{}:location", driver_id)
}

pub fn stream(driver_id: DriverId) -> String {
    format!("driver:{}:stream", driver_id)
}

pub fn members(group: &str) -> String {
    format!("group:{}:members", group)
}

pub fn retry_field(driver_id: DriverId, entry_id: &EntryId) -> String {
    format!("{}:{}", driver_id, entry_id)
}

/// Recover the driver id from a `driver:{id}:stream` key.
pub fn driver_from_stream(key: &str) -> Option<DriverId> {
    key.strip_prefix("driver:")?
        .strip_suffix(":stream")?
        .parse()
        .ok()
}
