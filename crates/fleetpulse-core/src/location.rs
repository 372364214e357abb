//! Location data structures
//!
//! ## Shapes
//!
//! - [`LocationUpdate`]: emitted by producers (HTTP handlers, bot handlers).
//!   Immutable once emitted.
//! - [`DriverPosition`]: the "current position" view served to dispatch.
//! - [`TrackPoint`]: one point in a driver's history. This is what the
//!   append log carries and what ends up in the partitioned store.
//!
//! Coordinates are plain `f64` degrees (WGS84). No rounding is applied
//! anywhere in the pipeline beyond the floating-point representation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Driver identifier as issued by the fleet system.
pub type DriverId = i64;

/// Driver availability reported with each update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverStatus {
    /// Available for dispatch
    Online,
    /// Currently on an order
    Busy,
    /// Signed off but still reporting
    Offline,
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverStatus::Online => "online",
            DriverStatus::Busy => "busy",
            DriverStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Ok(DriverStatus::Online),
            "busy" => Ok(DriverStatus::Busy),
            "offline" => Ok(DriverStatus::Offline),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// A WGS84 coordinate pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Reject non-finite values and coordinates outside the valid ranges
    /// (latitude [-90, 90], longitude [-180, 180]).
    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !self.lon.is_finite() {
            return Err(CoreError::InvalidCoordinate(format!(
                "non-finite coordinate ({}, {})",
                self.lat, self.lon
            )));
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(CoreError::InvalidCoordinate(format!(
                "latitude {} out of range",
                self.lat
            )));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(CoreError::InvalidCoordinate(format!(
                "longitude {} out of range",
                self.lon
            )));
        }
        Ok(())
    }
}

/// A location report pushed by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub driver_id: DriverId,
    pub point: GeoPoint,
    pub status: DriverStatus,
    pub timestamp: DateTime<Utc>,
}

impl LocationUpdate {
    pub fn new(
        driver_id: DriverId,
        lat: f64,
        lon: f64,
        status: DriverStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            driver_id,
            point: GeoPoint::new(lat, lon),
            status,
            timestamp,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.point.validate()
    }

    /// The history point this update contributes.
    pub fn track_point(&self) -> TrackPoint {
        TrackPoint {
            driver_id: self.driver_id,
            point: self.point,
            recorded_at: self.timestamp,
        }
    }
}

/// One point of a driver's persisted history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub driver_id: DriverId,
    pub point: GeoPoint,
    pub recorded_at: DateTime<Utc>,
}

impl TrackPoint {
    pub fn new(driver_id: DriverId, lat: f64, lon: f64, recorded_at: DateTime<Utc>) -> Self {
        Self {
            driver_id,
            point: GeoPoint::new(lat, lon),
            recorded_at,
        }
    }
}

/// Last known position of a driver, as served by the read path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverPosition {
    pub driver_id: DriverId,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
    /// Status reported with the last update, when the cache recorded one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DriverStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_parse_and_display() {
        for status in [DriverStatus::Online, DriverStatus::Busy, DriverStatus::Offline] {
            let parsed: DriverStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert_eq!("BUSY".parse::<DriverStatus>().unwrap(), DriverStatus::Busy);
        assert!("parked".parse::<DriverStatus>().is_err());
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&DriverStatus::Online).unwrap();
        assert_eq!(json, "\"online\"");
    }

    #[test]
    fn test_validate_accepts_boundaries() {
        assert!(GeoPoint::new(90.0, 180.0).validate().is_ok());
        assert!(GeoPoint::new(-90.0, -180.0).validate().is_ok());
        assert!(GeoPoint::new(43.115, 131.886).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(GeoPoint::new(90.0001, 0.0).validate().is_err());
        assert!(GeoPoint::new(0.0, -180.5).validate().is_err());
        assert!(GeoPoint::new(f64::NAN, 0.0).validate().is_err());
        assert!(GeoPoint::new(0.0, f64::INFINITY).validate().is_err());
    }

    #[test]
    fn test_track_point_from_update() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let update = LocationUpdate::new(7, 43.1, 131.9, DriverStatus::Busy, ts);
        let point = update.track_point();
        assert_eq!(point.driver_id, 7);
        assert_eq!(point.point, GeoPoint::new(43.1, 131.9));
        assert_eq!(point.recorded_at, ts);
    }
}
