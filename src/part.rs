//! Part artifacts: headers and file-backed parts.
//!
//! A part is an immutable sorted run of rows. File parts live in their own
//! directory holding the blocked row data plus a JSON header; in-memory
//! parts carry the same header but keep their blocks in the owning
//! wrapper. The partition core treats both uniformly through the header.

use crate::error::io_with_path;
use crate::fsutil;
use crate::{Result, TslabError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

pub const HEADER_FILE_NAME: &str = "header.json";
pub const ROWS_FILE_NAME: &str = "rows.bin";

/// Summary of a part's contents, persisted as `header.json` in the part
/// directory. Written last during part creation, so a directory with a
/// readable header holds complete data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartHeader {
    pub rows_count: u64,
    pub blocks_count: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl PartHeader {
    /// The directory name for an installed part produced by the given
    /// merge. The merge index suffix keeps names unique within a tier.
    pub fn part_dir_name(&self, merge_idx: u64) -> String {
        format!(
            "{}_{}_{}_{}_{:016X}",
            self.rows_count, self.blocks_count, self.min_timestamp, self.max_timestamp, merge_idx
        )
    }

    /// Reads the header from a part directory.
    pub fn read_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(HEADER_FILE_NAME);
        let file = File::open(&path).map_err(|e| io_with_path(path, e))?;
        let header: PartHeader = serde_json::from_reader(io::BufReader::new(file))?;
        Ok(header)
    }

    pub(crate) fn write_to_dir(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        fsutil::write_file(&dir.join(HEADER_FILE_NAME), &data)
    }
}

/// An immutable part artifact owned by a part wrapper. File parts carry
/// the canonical directory path; memory-backed parts keep their data in
/// the wrapper's in-memory part and have no path.
pub struct Part {
    pub header: PartHeader,
    pub path: Option<PathBuf>,
}

impl Part {
    pub(crate) fn from_inmemory_header(header: PartHeader) -> Self {
        Self { header, path: None }
    }

    /// Opens an installed part directory, validating its header.
    pub fn open_file_part(dir: &Path) -> Result<Self> {
        let header = PartHeader::read_from_dir(dir)?;

        if header.rows_count == 0 || header.blocks_count == 0 {
            return Err(TslabError::CorruptPart {
                path: dir.to_path_buf(),
                reason: format!(
                    "part must not be empty; got {} rows in {} blocks",
                    header.rows_count, header.blocks_count
                ),
            });
        }
        if header.min_timestamp > header.max_timestamp {
            return Err(TslabError::CorruptPart {
                path: dir.to_path_buf(),
                reason: format!(
                    "min timestamp {} exceeds max timestamp {}",
                    header.min_timestamp, header.max_timestamp
                ),
            });
        }
        let rows_path = dir.join(ROWS_FILE_NAME);
        if !fsutil::is_path_exist(&rows_path) {
            return Err(TslabError::CorruptPart {
                path: dir.to_path_buf(),
                reason: "missing rows file".to_string(),
            });
        }

        Ok(Self {
            header,
            path: Some(dir.to_path_buf()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn header_round_trips_through_dir() {
        let dir = TempDir::new().unwrap();
        let header = PartHeader {
            rows_count: 42,
            blocks_count: 1,
            min_timestamp: 100,
            max_timestamp: 200,
        };
        header.write_to_dir(dir.path()).unwrap();
        assert_eq!(PartHeader::read_from_dir(dir.path()).unwrap(), header);
    }

    #[test]
    fn part_dir_name_is_unique_per_merge() {
        let header = PartHeader {
            rows_count: 10,
            blocks_count: 1,
            min_timestamp: -5,
            max_timestamp: 5,
        };
        let a = header.part_dir_name(1);
        let b = header.part_dir_name(2);
        assert_ne!(a, b);
        assert!(a.starts_with("10_1_-5_5_"));
    }

    #[test]
    fn open_rejects_empty_and_headerless_parts() {
        let dir = TempDir::new().unwrap();
        assert!(Part::open_file_part(dir.path()).is_err());

        PartHeader::default().write_to_dir(dir.path()).unwrap();
        match Part::open_file_part(dir.path()) {
            Err(TslabError::CorruptPart { .. }) => {}
            Err(other) => panic!("expected corrupt part error, got {other}"),
            Ok(_) => panic!("expected corrupt part error, got a part"),
        }
    }
}
