//! Partition time ranges derived from YYYY_MM names.

use crate::{Result, TslabError};
use chrono::{DateTime, Datelike, TimeZone, Utc};

/// The closed timestamp range `[min_timestamp, max_timestamp]` covered by a
/// partition, in milliseconds. Always a whole UTC calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl TimeRange {
    /// Returns the month range containing the given timestamp.
    pub fn from_partition_timestamp(timestamp: i64) -> Self {
        let dt = utc_from_millis(timestamp);
        month_range(dt.year(), dt.month())
    }

    /// Parses a partition name in the form `YYYY_MM` into its month range.
    pub fn from_partition_name(name: &str) -> Result<Self> {
        let (year, month) = parse_partition_name(name)?;
        Ok(month_range(year, month))
    }

    /// True if the timestamp falls inside the range.
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.min_timestamp && timestamp <= self.max_timestamp
    }
}

/// Formats the partition name for the month containing the timestamp.
pub fn partition_name_from_timestamp(timestamp: i64) -> String {
    let dt = utc_from_millis(timestamp);
    format!("{:04}_{:02}", dt.year(), dt.month())
}

fn utc_from_millis(timestamp: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(timestamp).single() {
        Some(dt) => dt,
        None => panic!("BUG: timestamp {timestamp} is outside the representable date range"),
    }
}

fn month_range(year: i32, month: u32) -> TimeRange {
    let start = month_start_millis(year, month);
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let end = month_start_millis(next_year, next_month);
    TimeRange {
        min_timestamp: start,
        max_timestamp: end - 1,
    }
}

fn month_start_millis(year: i32, month: u32) -> i64 {
    match Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single() {
        Some(dt) => dt.timestamp_millis(),
        None => panic!("BUG: invalid month boundary {year:04}_{month:02}"),
    }
}

fn parse_partition_name(name: &str) -> Result<(i32, u32)> {
    let invalid = || TslabError::InvalidPartitionName {
        name: name.to_string(),
    };

    let (year_str, month_str) = name.split_once('_').ok_or_else(invalid)?;
    if year_str.len() != 4 || month_str.len() != 2 {
        return Err(invalid());
    }
    let year: i32 = year_str.parse().map_err(|_| invalid())?;
    let month: u32 = month_str.parse().map_err(|_| invalid())?;
    if !(1..=12).contains(&month) {
        return Err(invalid());
    }
    Ok((year, month))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips_through_range() {
        // 2023-07-15T00:00:00Z
        let ts = 1_689_379_200_000;
        let name = partition_name_from_timestamp(ts);
        assert_eq!(name, "2023_07");

        let tr = TimeRange::from_partition_name(&name).unwrap();
        assert_eq!(tr, TimeRange::from_partition_timestamp(ts));
        assert!(tr.contains(ts));
        assert!(tr.min_timestamp <= tr.max_timestamp);
    }

    #[test]
    fn month_boundaries_are_closed() {
        let tr = TimeRange::from_partition_name("2023_07").unwrap();
        assert!(tr.contains(tr.min_timestamp));
        assert!(tr.contains(tr.max_timestamp));
        assert!(!tr.contains(tr.min_timestamp - 1));
        assert!(!tr.contains(tr.max_timestamp + 1));

        let next = TimeRange::from_partition_name("2023_08").unwrap();
        assert_eq!(next.min_timestamp, tr.max_timestamp + 1);
    }

    #[test]
    fn december_rolls_into_next_year() {
        let dec = TimeRange::from_partition_name("2023_12").unwrap();
        let jan = TimeRange::from_partition_name("2024_01").unwrap();
        assert_eq!(jan.min_timestamp, dec.max_timestamp + 1);
    }

    #[test]
    fn rejects_malformed_names() {
        for name in ["2023", "2023-07", "23_07", "2023_0", "2023_13", "abcd_ef"] {
            assert!(
                TimeRange::from_partition_name(name).is_err(),
                "{name} should be rejected"
            );
        }
    }
}
