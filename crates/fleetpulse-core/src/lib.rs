//! Core types shared by every fleetpulse crate.
//!
//! The location pipeline moves one kind of data around: a driver's position at
//! an instant. This crate owns its shapes and the encodings they travel in:
//!
//! - [`LocationUpdate`]: what producers push (position + status + instant)
//! - [`TrackPoint`]: what the append log carries and history persists
//! - [`EntryId`]: the monotonic offset of an append-log entry
//! - [`codec`]: the flat `{lat, lon, ts}` field map used on the append log
//! - [`copy`]: the PostgreSQL binary COPY encoding used for bulk loads
//! - [`geo`]: haversine distance used by down-sampling

pub mod codec;
pub mod copy;
pub mod entry;
pub mod error;
pub mod geo;
pub mod location;

pub use entry::EntryId;
pub use error::{CoreError, Result};
pub use geo::haversine_meters;
pub use location::{DriverId, DriverPosition, DriverStatus, GeoPoint, LocationUpdate, TrackPoint};
