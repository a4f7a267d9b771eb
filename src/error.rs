//! Error types for tslab.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tslab operations.
pub type Result<T> = std::result::Result<T, TslabError>;

/// Main error type for tslab operations.
#[derive(Error, Debug)]
pub enum TslabError {
    /// The merge planner found no part set worth merging. Expected control
    /// signal inside the merge loops; never surfaced to callers.
    #[error("nothing to merge")]
    NothingToMerge,

    /// The stop signal was observed mid-merge. Expected control signal;
    /// never surfaced to callers.
    #[error("forcibly stopped")]
    ForciblyStopped,

    #[error("invalid partition name {name:?}; must be in the form YYYY_MM")]
    InvalidPartitionName { name: String },

    #[error("invalid precision bits {precision_bits}; must be in 1..=64")]
    InvalidPrecisionBits { precision_bits: u8 },

    #[error(
        "partition name in big parts path {big_path:?} doesn't match small parts path {small_path:?}"
    )]
    PartitionPathMismatch {
        small_path: PathBuf,
        big_path: PathBuf,
    },

    #[error("invalid path {path:?}; must reside under one of the partition roots")]
    PathOutsidePartition { path: PathBuf },

    #[error("invalid transaction file {path:?}: {reason}")]
    InvalidTransaction { path: PathBuf, reason: String },

    #[error("corrupt part at {path:?}: {reason}")]
    CorruptPart { path: PathBuf, reason: String },

    #[error("partition already closed")]
    AlreadyClosed,

    #[error("cannot determine free disk space on {path:?}: {source}")]
    FreeDiskSpace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error at path {path:?}: {source}")]
    IoWithPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl TslabError {
    /// True for the two expected merge-loop control signals.
    pub fn is_benign_merge_outcome(&self) -> bool {
        matches!(
            self,
            TslabError::NothingToMerge | TslabError::ForciblyStopped
        )
    }
}

/// Attaches a path to a bare IO error.
pub(crate) fn io_with_path(path: impl Into<PathBuf>, source: std::io::Error) -> TslabError {
    TslabError::IoWithPath {
        path: path.into(),
        source,
    }
}
