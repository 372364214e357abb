//! Week Partition Naming and Routing
//!
//! History is range-partitioned on `recorded_at` in ISO weeks. Every
//! partition's range can be recovered from its name alone, which is what lets
//! retention decide what to drop without scanning any data.
//!
//! ```text
//! location_history                       (parent, PARTITION BY RANGE)
//! ├── location_history_y2024_w51         [2024-12-16, 2024-12-23)
//! ├── location_history_y2024_w52         [2024-12-23, 2024-12-30)
//! ├── location_history_y2025_w01         [2024-12-30, 2025-01-06)
//! └── location_history_default           everything else
//! ```
//!
//! Note the ISO year: the week containing 2024-12-30 is week 1 of 2025.
//!
//! Everything here is pure; [`PartitionManager`](crate::PartitionManager)
//! applies it to PostgreSQL and [`MemoryHistoryStore`](crate::MemoryHistoryStore)
//! to its in-process tables.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};

use crate::error::{Result, StoreError};

/// Longest accepted base table name. Leaves room for the `_y2024_w01`
/// suffix under PostgreSQL's 63-byte identifier limit.
pub const MAX_TABLE_NAME_LEN: usize = 48;

/// One ISO week, identified by its Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionWeek {
    monday: NaiveDate,
}

impl PartitionWeek {
    /// The ISO week `week` of ISO year `iso_year`, if it exists.
    pub fn new(iso_year: i32, week: u32) -> Option<Self> {
        NaiveDate::from_isoywd_opt(iso_year, week, Weekday::Mon).map(|monday| Self { monday })
    }

    /// The week an instant falls into (weeks start Monday 00:00 UTC).
    pub fn containing(ts: &DateTime<Utc>) -> Self {
        let date = ts.date_naive();
        let back = i64::from(date.weekday().num_days_from_monday());
        Self {
            monday: date - Duration::days(back),
        }
    }

    pub fn iso_year(&self) -> i32 {
        self.monday.iso_week().year()
    }

    pub fn week(&self) -> u32 {
        self.monday.iso_week().week()
    }

    /// Inclusive lower bound of the week's range.
    pub fn start(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.monday.and_time(NaiveTime::MIN))
    }

    /// Exclusive upper bound of the week's range.
    pub fn end(&self) -> DateTime<Utc> {
        self.start() + Duration::weeks(1)
    }

    /// The week `weeks` weeks later (earlier when negative).
    pub fn offset(&self, weeks: i64) -> Self {
        Self {
            monday: self.monday + Duration::weeks(weeks),
        }
    }
}

impl fmt::Display for PartitionWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.iso_year(), self.week())
    }
}

/// Reject anything that is not a plain lowercase identifier, since table
/// names are spliced into DDL.
pub fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid_start || !valid_rest || table.len() > MAX_TABLE_NAME_LEN {
        return Err(StoreError::InvalidTableName(table.to_string()));
    }
    Ok(())
}

/// `{table}_y{ISOYEAR}_w{ISOWEEK}`
pub fn partition_name(table: &str, week: &PartitionWeek) -> String {
    format!("{}_y{:04}_w{:02}", table, week.iso_year(), week.week())
}

/// `{table}_default`
pub fn default_partition_name(table: &str) -> String {
    format!("{}_default", table)
}

/// Recover the week from a partition name produced by [`partition_name`].
pub fn parse_partition_week(table: &str, name: &str) -> Option<PartitionWeek> {
    let rest = name.strip_prefix(table)?.strip_prefix("_y")?;
    let (year, week) = rest.split_once("_w")?;
    if year.len() != 4 || week.len() != 2 {
        return None;
    }
    PartitionWeek::new(year.parse().ok()?, week.parse().ok()?)
}

/// `[start, end)` of a week.
pub fn week_bounds(week: &PartitionWeek) -> (DateTime<Utc>, DateTime<Utc>) {
    (week.start(), week.end())
}

/// Weeks that should exist at `now`: the current one plus `weeks_ahead`.
pub fn weeks_to_ensure(now: &DateTime<Utc>, weeks_ahead: u32) -> Vec<PartitionWeek> {
    let current = PartitionWeek::containing(now);
    (0..=i64::from(weeks_ahead))
        .map(|i| current.offset(i))
        .collect()
}

/// Partition a row recorded at `ts` lands in, given the weeks that have
/// explicit partitions.
pub fn route_partition(
    table: &str,
    existing: &BTreeSet<PartitionWeek>,
    ts: &DateTime<Utc>,
) -> String {
    let week = PartitionWeek::containing(ts);
    if existing.contains(&week) {
        partition_name(table, &week)
    } else {
        default_partition_name(table)
    }
}

/// Partitions whose whole week ended at or before `now - retention_weeks`.
///
/// Names that do not parse (including the default partition) are never
/// returned.
pub fn expired_partitions<S: AsRef<str>>(
    table: &str,
    names: &[S],
    now: &DateTime<Utc>,
    retention_weeks: u32,
) -> Vec<String> {
    let cutoff = *now - Duration::weeks(i64::from(retention_weeks));
    let mut expired = Vec::new();
    for name in names {
        let name: &str = name.as_ref();
        if parse_partition_week(table, name).map_or(false, |week| week.end() <= cutoff) {
            expired.push(name.to_string());
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_week_containing_midweek_instant() {
        // Thursday 2024-05-16
        let week = PartitionWeek::containing(&utc(2024, 5, 16, 13));
        assert_eq!(week.iso_year(), 2024);
        assert_eq!(week.week(), 20);
        assert_eq!(week.start(), utc(2024, 5, 13, 0));
        assert_eq!(week.end(), utc(2024, 5, 20, 0));
    }

    #[test]
    fn test_iso_year_differs_from_calendar_year() {
        let week = PartitionWeek::containing(&utc(2024, 12, 31, 0));
        assert_eq!(week.iso_year(), 2025);
        assert_eq!(week.week(), 1);
        assert_eq!(partition_name("location_history", &week), "location_history_y2025_w01");

        let week = PartitionWeek::containing(&utc(2021, 1, 2, 0));
        assert_eq!(week.iso_year(), 2020);
        assert_eq!(week.week(), 53);
    }

    #[test]
    fn test_name_parse_inverse() {
        let week = PartitionWeek::new(2024, 7).unwrap();
        let name = partition_name("history", &week);
        assert_eq!(name, "history_y2024_w07");
        assert_eq!(parse_partition_week("history", &name), Some(week));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(parse_partition_week("history", "history_default"), None);
        assert_eq!(parse_partition_week("history", "other_y2024_w07"), None);
        assert_eq!(parse_partition_week("history", "history_y2024_w7"), None);
        // 2024 has 52 ISO weeks.
        assert_eq!(parse_partition_week("history", "history_y2024_w53"), None);
    }

    #[test]
    fn test_week_bounds_boundary_is_exclusive() {
        let week = PartitionWeek::new(2024, 20).unwrap();
        let (start, end) = week_bounds(&week);
        assert_eq!(PartitionWeek::containing(&start), week);
        assert_eq!(PartitionWeek::containing(&end), week.offset(1));
        assert_eq!(PartitionWeek::containing(&(end - Duration::microseconds(1))), week);
    }

    #[test]
    fn test_weeks_to_ensure() {
        let weeks = weeks_to_ensure(&utc(2024, 12, 20, 0), 2);
        let names: Vec<String> = weeks.iter().map(|w| partition_name("h", w)).collect();
        assert_eq!(names, vec!["h_y2024_w51", "h_y2024_w52", "h_y2025_w01"]);
    }

    #[test]
    fn test_route_to_existing_week_or_default() {
        let existing: BTreeSet<PartitionWeek> =
            [PartitionWeek::new(2024, 20).unwrap()].into_iter().collect();
        assert_eq!(
            route_partition("h", &existing, &utc(2024, 5, 16, 13)),
            "h_y2024_w20"
        );
        assert_eq!(route_partition("h", &existing, &utc(2023, 1, 1, 0)), "h_default");
    }

    #[test]
    fn test_expired_partitions_respects_cutoff() {
        // now = Monday 2024-05-20 00:00 (start of week 21); cutoff 8 weeks back
        // is 2024-03-25 00:00, the start of week 13.
        let now = utc(2024, 5, 20, 0);
        let names: Vec<String> = (10..=21)
            .map(|w| partition_name("h", &PartitionWeek::new(2024, w).unwrap()))
            .chain(std::iter::once(default_partition_name("h")))
            .collect();

        let expired = expired_partitions("h", &names, &now, 8);
        assert_eq!(expired, vec!["h_y2024_w10", "h_y2024_w11", "h_y2024_w12"]);
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("location_history").is_ok());
        assert!(validate_table_name("_h2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("History").is_err());
        assert!(validate_table_name("h; drop table x").is_err());
        assert!(validate_table_name("2h").is_err());
        assert!(validate_table_name(&"h".repeat(MAX_TABLE_NAME_LEN + 1)).is_err());
    }
}
