//! Append-log field map codec
//!
//! Every append-log entry is a flat map of three string fields:
//!
//! | Field | Content                                   |
//! |-------|-------------------------------------------|
//! | `lat` | latitude, shortest round-trip `f64` text  |
//! | `lon` | longitude, shortest round-trip `f64` text |
//! | `ts`  | RFC 3339 instant with offset (µs)         |
//!
//! The driver id is not part of the map: it is carried by the log name.
//! Decoding is strict. Anything missing, unparseable or out of range yields
//! [`CoreError::MalformedEntry`] / [`CoreError::InvalidCoordinate`], both of
//! which are permanent and must not be retried.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{CoreError, Result};
use crate::location::{DriverId, GeoPoint, LocationUpdate, TrackPoint};

pub const FIELD_LAT: &str = "lat";
pub const FIELD_LON: &str = "lon";
pub const FIELD_TS: &str = "ts";

/// Encode an update as the append-log field list.
pub fn encode_fields(update: &LocationUpdate) -> [(&'static str, String); 3] {
    [
        (FIELD_LAT, update.point.lat.to_string()),
        (FIELD_LON, update.point.lon.to_string()),
        (FIELD_TS, format_timestamp(&update.timestamp)),
    ]
}

/// Decode an append-log field map belonging to `driver_id`'s log.
pub fn decode_fields(driver_id: DriverId, fields: &HashMap<String, String>) -> Result<TrackPoint> {
    let lat = parse_coordinate(fields, FIELD_LAT)?;
    let lon = parse_coordinate(fields, FIELD_LON)?;
    let raw_ts = fields
        .get(FIELD_TS)
        .ok_or_else(|| CoreError::MalformedEntry(format!("missing field '{}'", FIELD_TS)))?;
    let recorded_at = parse_timestamp(raw_ts)?;

    let point = GeoPoint::new(lat, lon);
    point.validate()?;

    Ok(TrackPoint {
        driver_id,
        point,
        recorded_at,
    })
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 instant. Unix epoch seconds (optionally fractional) are
/// accepted as well, since older producers wrote them.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let secs: f64 = raw
        .parse()
        .map_err(|_| CoreError::MalformedEntry(format!("unparseable timestamp '{}'", raw)))?;
    if !secs.is_finite() {
        return Err(CoreError::MalformedEntry(format!(
            "unparseable timestamp '{}'",
            raw
        )));
    }
    let micros = (secs * 1_000_000.0).round() as i64;
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| CoreError::TimestampOutOfRange(raw.to_string()))
}

fn parse_coordinate(fields: &HashMap<String, String>, name: &str) -> Result<f64> {
    let raw = fields
        .get(name)
        .ok_or_else(|| CoreError::MalformedEntry(format!("missing field '{}'", name)))?;
    raw.trim()
        .parse::<f64>()
        .map_err(|_| CoreError::MalformedEntry(format!("field '{}' is not a number: '{}'", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::DriverStatus;

    fn field_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_encode_then_decode_preserves_values() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let update = LocationUpdate::new(12, 43.1150, 131.8860, DriverStatus::Online, ts);
        let fields: HashMap<String, String> = encode_fields(&update)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let point = decode_fields(12, &fields).unwrap();
        assert_eq!(point, update.track_point());
    }

    #[test]
    fn test_timestamp_keeps_microseconds_and_offset() {
        let ts = Utc.timestamp_micros(1_700_000_000_123_456).unwrap();
        assert_eq!(format_timestamp(&ts), "2023-11-14T22:13:20.123456Z");
        let parsed = parse_timestamp("2023-11-15T01:13:20.123456+03:00").unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn test_parse_epoch_seconds() {
        let parsed = parse_timestamp("1700000000.5").unwrap();
        assert_eq!(parsed.timestamp_millis(), 1_700_000_000_500);
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let fields = field_map(&[("lat", "43.1"), ("ts", "2024-01-01T00:00:00Z")]);
        let err = decode_fields(1, &fields).unwrap_err();
        assert!(matches!(err, CoreError::MalformedEntry(_)));
        assert!(err.to_string().contains("lon"));
    }

    #[test]
    fn test_non_numeric_coordinate_is_malformed() {
        let fields = field_map(&[("lat", "north"), ("lon", "131.9"), ("ts", "2024-01-01T00:00:00Z")]);
        assert!(matches!(
            decode_fields(1, &fields),
            Err(CoreError::MalformedEntry(_))
        ));
    }

    #[test]
    fn test_out_of_range_coordinate_is_rejected() {
        let fields = field_map(&[("lat", "123.0"), ("lon", "131.9"), ("ts", "2024-01-01T00:00:00Z")]);
        assert!(matches!(
            decode_fields(1, &fields),
            Err(CoreError::InvalidCoordinate(_))
        ));
    }

    #[test]
    fn test_bad_timestamp_is_malformed() {
        let fields = field_map(&[("lat", "43.1"), ("lon", "131.9"), ("ts", "yesterday")]);
        assert!(matches!(
            decode_fields(1, &fields),
            Err(CoreError::MalformedEntry(_))
        ));
    }
}
