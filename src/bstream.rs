//! Block streams: sequential readers and writers over part data.
//!
//! Parts store rows in blocks of up to [`MAX_ROWS_PER_BLOCK`] rows, each
//! bincode-encoded and zstd-compressed behind a little-endian length
//! prefix. Merging opens one reader per source part and streams the
//! combined, re-sorted rows into a writer building the destination part.

use crate::error::io_with_path;
use crate::fsutil;
use crate::inmemory::InmemoryPart;
use crate::part::{PartHeader, ROWS_FILE_NAME};
use crate::{RawRow, Result, TslabError};
use crossbeam_channel::{Receiver, TryRecvError};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of rows stored in a single block.
pub const MAX_ROWS_PER_BLOCK: usize = 8192;

/// A run of rows sorted by `(metric_id, timestamp)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Block {
    pub rows: Vec<RawRow>,
}

/// Sequential reader over the blocks of a single part.
pub enum BlockStreamReader {
    Inmemory {
        part: Arc<InmemoryPart>,
        next_block: usize,
    },
    FilePart {
        path: PathBuf,
        reader: BufReader<File>,
        blocks_read: u64,
        blocks_count: u64,
    },
}

impl BlockStreamReader {
    pub fn init_from_inmemory(part: Arc<InmemoryPart>) -> Self {
        BlockStreamReader::Inmemory {
            part,
            next_block: 0,
        }
    }

    pub fn init_from_file_part(dir: &Path) -> Result<Self> {
        let header = PartHeader::read_from_dir(dir)?;
        let rows_path = dir.join(ROWS_FILE_NAME);
        let file = File::open(&rows_path).map_err(|e| io_with_path(&rows_path, e))?;
        Ok(BlockStreamReader::FilePart {
            path: dir.to_path_buf(),
            reader: BufReader::new(file),
            blocks_read: 0,
            blocks_count: header.blocks_count,
        })
    }

    /// Returns the next block, or None once the part is exhausted.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        match self {
            BlockStreamReader::Inmemory { part, next_block } => {
                match part.blocks.get(*next_block) {
                    Some(block) => {
                        *next_block += 1;
                        Ok(Some(block.clone()))
                    }
                    None => Ok(None),
                }
            }
            BlockStreamReader::FilePart {
                path,
                reader,
                blocks_read,
                blocks_count,
            } => {
                if *blocks_read >= *blocks_count {
                    return Ok(None);
                }
                let mut len_buf = [0u8; 4];
                reader
                    .read_exact(&mut len_buf)
                    .map_err(|e| io_with_path(&*path, e))?;
                let len = u32::from_le_bytes(len_buf) as usize;
                let mut payload = vec![0u8; len];
                reader
                    .read_exact(&mut payload)
                    .map_err(|e| io_with_path(&*path, e))?;
                let decompressed = zstd::stream::decode_all(&payload[..])
                    .map_err(|e| io_with_path(&*path, e))?;
                let block: Block = bincode::deserialize(&decompressed)?;
                *blocks_read += 1;
                Ok(Some(block))
            }
        }
    }
}

/// Streaming writer building a new file part under a temporary path.
pub struct BlockStreamWriter {
    part_path: PathBuf,
    writer: BufWriter<File>,
    nocache: bool,
    compress_level: i32,
    pending_rows: Vec<RawRow>,
    rows_count: u64,
    blocks_count: u64,
    min_timestamp: i64,
    max_timestamp: i64,
}

impl BlockStreamWriter {
    /// Creates the destination part directory and its rows file. The
    /// directory must not exist yet.
    pub fn create_file_part(dir: &Path, nocache: bool, compress_level: i32) -> Result<Self> {
        fsutil::mkdir_all_fail_if_exist(dir)?;
        let rows_path = dir.join(ROWS_FILE_NAME);
        let file = File::create(&rows_path).map_err(|e| io_with_path(&rows_path, e))?;
        Ok(Self {
            part_path: dir.to_path_buf(),
            writer: BufWriter::new(file),
            nocache,
            compress_level,
            pending_rows: Vec::with_capacity(MAX_ROWS_PER_BLOCK),
            rows_count: 0,
            blocks_count: 0,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
        })
    }

    pub fn write_row(&mut self, row: RawRow) -> Result<()> {
        self.pending_rows.push(row);
        if self.pending_rows.len() >= MAX_ROWS_PER_BLOCK {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.pending_rows.is_empty() {
            return Ok(());
        }
        let block = Block {
            rows: std::mem::take(&mut self.pending_rows),
        };
        for row in &block.rows {
            self.min_timestamp = self.min_timestamp.min(row.timestamp);
            self.max_timestamp = self.max_timestamp.max(row.timestamp);
        }
        self.rows_count += block.rows.len() as u64;
        self.blocks_count += 1;

        let encoded = bincode::serialize(&block)?;
        let payload = zstd::stream::encode_all(&encoded[..], self.compress_level)
            .map_err(|e| io_with_path(&self.part_path, e))?;
        self.writer
            .write_all(&(payload.len() as u32).to_le_bytes())
            .map_err(|e| io_with_path(&self.part_path, e))?;
        self.writer
            .write_all(&payload)
            .map_err(|e| io_with_path(&self.part_path, e))?;

        self.pending_rows = block.rows;
        self.pending_rows.clear();
        Ok(())
    }

    /// Flushes the tail block, fsyncs the data, writes the header and
    /// returns it.
    pub fn finalize(mut self) -> Result<PartHeader> {
        self.flush_block()?;
        self.writer
            .flush()
            .map_err(|e| io_with_path(&self.part_path, e))?;
        let file = self.writer.get_ref();
        file.sync_all().map_err(|e| io_with_path(&self.part_path, e))?;
        if self.nocache {
            fsutil::advise_no_cache(file);
        }

        let header = PartHeader {
            rows_count: self.rows_count,
            blocks_count: self.blocks_count,
            min_timestamp: if self.rows_count > 0 { self.min_timestamp } else { 0 },
            max_timestamp: if self.rows_count > 0 { self.max_timestamp } else { 0 },
        };
        header.write_to_dir(&self.part_path)?;
        fsutil::sync_path(&self.part_path)?;
        Ok(header)
    }
}

struct RowCursor {
    reader: BlockStreamReader,
    block: Block,
    next_idx: usize,
    /// The row the heap key refers to; None once the stream is drained.
    current: Option<RawRow>,
}

impl RowCursor {
    fn new(reader: BlockStreamReader) -> Result<Self> {
        let mut cursor = Self {
            reader,
            block: Block::default(),
            next_idx: 0,
            current: None,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    /// Loads the next row of the stream into `current`.
    fn advance(&mut self) -> Result<()> {
        loop {
            if let Some(row) = self.block.rows.get(self.next_idx) {
                self.next_idx += 1;
                self.current = Some(*row);
                return Ok(());
            }
            match self.reader.next_block()? {
                Some(block) => {
                    self.block = block;
                    self.next_idx = 0;
                }
                None => {
                    self.current = None;
                    return Ok(());
                }
            }
        }
    }
}

/// Merges the sorted row streams of `bsrs` into `bsw`, dropping rows whose
/// metric id is in `deleted_metric_ids`. Observes the stop signal at block
/// boundaries, returning [`TslabError::ForciblyStopped`]. Returns the
/// header of the written part.
pub fn merge_block_streams(
    bsw: BlockStreamWriter,
    bsrs: Vec<BlockStreamReader>,
    stop_ch: Option<&Receiver<()>>,
    rows_merged: &AtomicU64,
    deleted_metric_ids: &HashSet<u64>,
    rows_deleted: &AtomicU64,
) -> Result<PartHeader> {
    let mut bsw = bsw;
    let mut cursors = Vec::with_capacity(bsrs.len());
    for bsr in bsrs {
        cursors.push(RowCursor::new(bsr)?);
    }

    // Min-heap keyed on (metric_id, timestamp, source index).
    let mut heap: BinaryHeap<Reverse<(u64, i64, usize)>> = BinaryHeap::with_capacity(cursors.len());
    for (i, cursor) in cursors.iter().enumerate() {
        if let Some(row) = cursor.current {
            heap.push(Reverse((row.metric_id, row.timestamp, i)));
        }
    }

    let mut merged_in_block = 0u64;
    let mut deleted_in_block = 0u64;
    let mut rows_since_stop_check = 0usize;

    while let Some(Reverse((_, _, i))) = heap.pop() {
        let cursor = &mut cursors[i];
        let row = match cursor.current {
            Some(row) => row,
            None => panic!("BUG: heap entry without a pending row"),
        };

        if deleted_metric_ids.contains(&row.metric_id) {
            deleted_in_block += 1;
        } else {
            bsw.write_row(row)?;
            merged_in_block += 1;
        }

        rows_since_stop_check += 1;
        if rows_since_stop_check >= MAX_ROWS_PER_BLOCK {
            rows_since_stop_check = 0;
            rows_merged.fetch_add(merged_in_block, Ordering::Relaxed);
            rows_deleted.fetch_add(deleted_in_block, Ordering::Relaxed);
            merged_in_block = 0;
            deleted_in_block = 0;
            if let Some(rx) = stop_ch
                && matches!(rx.try_recv(), Err(TryRecvError::Disconnected))
            {
                return Err(TslabError::ForciblyStopped);
            }
        }

        cursor.advance()?;
        if let Some(next) = cursor.current {
            heap.push(Reverse((next.metric_id, next.timestamp, i)));
        }
    }

    rows_merged.fetch_add(merged_in_block, Ordering::Relaxed);
    rows_deleted.fetch_add(deleted_in_block, Ordering::Relaxed);
    bsw.finalize()
}
