//! Driver Assignment - Consistent Hashing
//!
//! Every driver is owned by exactly one worker. The owner is the only worker
//! that reads the driver's append log, and so the only one touching the
//! driver's down-sample state.
//!
//! ## Assignment Algorithm
//!
//! - Each worker is placed on a ring `[0, 2^64)` at `VIRTUAL_NODES` points
//!   (`hash("{worker}#{i}")`) to even out the share each one gets
//! - A driver hashes onto the ring and belongs to the first worker point
//!   clockwise from it, wrapping around at the end
//! - Adding or removing a worker only moves the drivers adjacent to its
//!   points
//!
//! The hash is FNV-1a over the UTF-8 bytes followed by the MurmurHash3
//! 64-bit finalizer. Plain FNV-1a barely moves the high bits for keys that
//! differ only in their last byte (`node-0#1`, `node-0#2`, ...), which would
//! bunch a worker's points together. Both steps are stable across processes,
//! builds and Rust versions, so every node computes the same owner for a
//! driver.

use std::collections::BTreeMap;

use fleetpulse_core::DriverId;

/// Ring points per worker.
pub const VIRTUAL_NODES: usize = 64;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// MurmurHash3 `fmix64`.
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Position of a key on the ring.
pub fn ring_hash(key: &str) -> u64 {
    fmix64(fnv1a(key.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct HashRing {
    points: BTreeMap<u64, String>,
    members: Vec<String>,
}

impl HashRing {
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut members: Vec<String> = members.into_iter().map(Into::into).collect();
        members.sort();
        members.dedup();

        let mut points = BTreeMap::new();
        for member in &members {
            for i in 0..VIRTUAL_NODES {
                let point = ring_hash(&format!("{}#{}", member, i));
                // On the (unlikely) collision the smaller name wins, on every node.
                points
                    .entry(point)
                    .and_modify(|owner: &mut String| {
                        if *member < *owner {
                            *owner = member.clone();
                        }
                    })
                    .or_insert_with(|| member.clone());
            }
        }

        Self { points, members }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Worker owning `driver_id`, or `None` for an empty ring.
    pub fn owner(&self, driver_id: DriverId) -> Option<&str> {
        let hash = ring_hash(&driver_id.to_string());
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, member)| member.as_str())
    }

    pub fn owns(&self, member: &str, driver_id: DriverId) -> bool {
        self.owner(driver_id) == Some(member)
    }

    /// The subset of `drivers` owned by `member`, order preserved.
    pub fn owned_by(&self, member: &str, drivers: &[DriverId]) -> Vec<DriverId> {
        drivers
            .iter()
            .copied()
            .filter(|d| self.owns(member, *d))
            .collect()
    }
}
