//! tslab - a log-structured partition engine for monthly time-series data
//!
//! A partition ingests batches of time-stamped metric rows covering one UTC
//! calendar month and organizes them into a tiered collection of immutable
//! parts that are searched via reference-counted snapshots, merged in the
//! background, and replaced atomically through an on-disk transaction log.

pub mod bstream;
pub mod cgroup;
pub mod error;
pub mod fsutil;
pub mod inmemory;
pub mod part;
pub mod partition;
pub mod timerange;
pub mod txn;

pub use error::{Result, TslabError};
pub use partition::{
    DeletedMetricIdsFn, PartWrapper, Partition, PartitionEnv, PartitionMetrics, create_partition,
    open_partition, partition_name_from_timestamp,
};
pub use timerange::TimeRange;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The number of precision bits a row value may request, inclusive bounds.
pub const MIN_PRECISION_BITS: u8 = 1;
pub const MAX_PRECISION_BITS: u8 = 64;

/// A single ingested sample, the smallest unit the partition stores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// The identifier of the metric the sample belongs to.
    pub metric_id: u64,
    /// The sample value.
    pub value: f64,
    /// The number of significant bits to retain for the value, in 1..=64.
    pub precision_bits: u8,
}

impl RawRow {
    /// Creates a new RawRow with full precision.
    pub fn new(timestamp: i64, metric_id: u64, value: f64) -> Self {
        Self {
            timestamp,
            metric_id,
            value,
            precision_bits: MAX_PRECISION_BITS,
        }
    }

    /// The sort key establishing canonical row order inside a part.
    pub(crate) fn sort_key(&self) -> (u64, i64) {
        (self.metric_id, self.timestamp)
    }
}

impl fmt::Display for RawRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawRow(ts: {}, metric: {}, val: {})",
            self.timestamp, self.metric_id, self.value
        )
    }
}

/// Validates the precision bits of a row.
///
/// Rows with invalid precision bits indicate a caller bug; `add_rows`
/// panics on them instead of propagating the error.
pub fn check_precision_bits(precision_bits: u8) -> Result<()> {
    if !(MIN_PRECISION_BITS..=MAX_PRECISION_BITS).contains(&precision_bits) {
        return Err(TslabError::InvalidPrecisionBits { precision_bits });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_bits_bounds() {
        assert!(check_precision_bits(0).is_err());
        assert!(check_precision_bits(1).is_ok());
        assert!(check_precision_bits(64).is_ok());
        assert!(check_precision_bits(65).is_err());
    }
}
