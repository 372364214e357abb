//! PostgreSQL Binary COPY Encoding
//!
//! Bulk loads go through `COPY ... FROM STDIN WITH (FORMAT binary)` instead of
//! row-at-a-time inserts. This module produces that stream for history rows.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header                                       │
//! │  signature  "PGCOPY\n\xff\r\n\0"  (11 bytes) │
//! │  flags      i32 = 0                          │
//! │  ext length i32 = 0                          │
//! ├──────────────────────────────────────────────┤
//! │ Tuple (repeated)                             │
//! │  field count  i16 = 4                        │
//! │  driver_id    i32 len=8 │ int8               │
//! │  latitude     i32 len=8 │ float8             │
//! │  longitude    i32 len=8 │ float8             │
//! │  recorded_at  i32 len=8 │ timestamptz        │
//! ├──────────────────────────────────────────────┤
//! │ Trailer       i16 = -1                       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All integers are big-endian. `timestamptz` is microseconds since
//! 2000-01-01 00:00:00 UTC; `float8` is the IEEE 754 bit pattern.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::location::TrackPoint;

pub const COPY_SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";

/// Columns written per tuple, in order.
pub const COPY_COLUMNS: [&str; 4] = ["driver_id", "latitude", "longitude", "recorded_at"];

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

const HEADER_LEN: usize = 11 + 4 + 4;
const TUPLE_LEN: usize = 2 + 4 * (4 + 8);
const TRAILER_LEN: usize = 2;

/// Microseconds since the PostgreSQL epoch.
pub fn pg_timestamp_micros(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_micros() - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Incremental encoder for one COPY stream.
///
/// ```ignore
/// let mut enc = CopyEncoder::new();
/// for row in rows {
///     enc.push(row);
/// }
/// let payload = enc.finish();
/// ```
#[derive(Debug)]
pub struct CopyEncoder {
    buf: BytesMut,
    rows: usize,
}

impl CopyEncoder {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(rows: usize) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + rows * TUPLE_LEN + TRAILER_LEN);
        buf.put_slice(COPY_SIGNATURE);
        buf.put_i32(0); // flags: no OIDs
        buf.put_i32(0); // header extension length
        Self { buf, rows: 0 }
    }

    pub fn push(&mut self, row: &TrackPoint) {
        self.buf.put_i16(COPY_COLUMNS.len() as i16);

        self.buf.put_i32(8);
        self.buf.put_i64(row.driver_id);

        self.buf.put_i32(8);
        self.buf.put_f64(row.point.lat);

        self.buf.put_i32(8);
        self.buf.put_f64(row.point.lon);

        self.buf.put_i32(8);
        self.buf.put_i64(pg_timestamp_micros(&row.recorded_at));

        self.rows += 1;
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Append the trailer and hand back the finished stream.
    pub fn finish(mut self) -> Bytes {
        self.buf.put_i16(-1);
        self.buf.freeze()
    }
}

impl Default for CopyEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a whole batch in one call.
pub fn encode_rows(rows: &[TrackPoint]) -> Bytes {
    let mut encoder = CopyEncoder::with_capacity(rows.len());
    for row in rows {
        encoder.push(row);
    }
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use chrono::TimeZone;

    #[test]
    fn test_empty_stream_is_header_and_trailer() {
        let payload = encode_rows(&[]);
        assert_eq!(payload.len(), HEADER_LEN + TRAILER_LEN);
        assert_eq!(&payload[..11], COPY_SIGNATURE);
        assert_eq!(&payload[payload.len() - 2..], &[0xff, 0xff]);
    }

    #[test]
    fn test_pg_epoch_is_zero() {
        let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(pg_timestamp_micros(&epoch), 0);

        let before = Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(pg_timestamp_micros(&before), -1_000_000);
    }

    #[test]
    fn test_tuple_layout() {
        let ts = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 1).unwrap();
        let row = TrackPoint::new(42, 43.115, -131.886, ts);
        let payload = encode_rows(&[row]);
        assert_eq!(payload.len(), HEADER_LEN + TUPLE_LEN + TRAILER_LEN);

        let mut buf = &payload[HEADER_LEN..];
        assert_eq!(buf.get_i16(), 4);
        assert_eq!(buf.get_i32(), 8);
        assert_eq!(buf.get_i64(), 42);
        assert_eq!(buf.get_i32(), 8);
        assert_eq!(buf.get_f64(), 43.115);
        assert_eq!(buf.get_i32(), 8);
        assert_eq!(buf.get_f64(), -131.886);
        assert_eq!(buf.get_i32(), 8);
        assert_eq!(buf.get_i64(), 1_000_000);
        assert_eq!(buf.get_i16(), -1);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_encoder_counts_rows() {
        let ts = Utc::now();
        let mut encoder = CopyEncoder::new();
        for id in 0..3 {
            encoder.push(&TrackPoint::new(id, 1.0, 2.0, ts));
        }
        assert_eq!(encoder.rows(), 3);
        let payload = encoder.finish();
        assert_eq!(payload.len(), HEADER_LEN + 3 * TUPLE_LEN + TRAILER_LEN);
    }
}
