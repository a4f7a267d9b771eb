//! In-memory parts and the process-wide staging pools.
//!
//! Freshly flushed raw-row buffers become in-memory parts: already sorted
//! and blocked like their on-disk siblings, but held in RAM until the
//! in-memory parts flusher (or a merge) materializes them.

use crate::RawRow;
use crate::bstream::{Block, MAX_ROWS_PER_BLOCK};
use crate::part::PartHeader;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// An immutable, sorted, blocked run of rows living in RAM.
pub struct InmemoryPart {
    pub header: PartHeader,
    pub blocks: Vec<Block>,
    pub creation_time: Instant,
}

impl InmemoryPart {
    /// Builds an in-memory part from unsorted rows, reusing a pooled block
    /// shell for the outer vector.
    pub(crate) fn init_from_rows(mut blocks: Vec<Block>, rows: &[RawRow]) -> Self {
        assert!(!rows.is_empty(), "BUG: cannot build an empty inmemory part");

        let mut sorted = rows.to_vec();
        sorted.sort_unstable_by_key(|r| r.sort_key());

        let mut min_timestamp = i64::MAX;
        let mut max_timestamp = i64::MIN;
        for row in &sorted {
            min_timestamp = min_timestamp.min(row.timestamp);
            max_timestamp = max_timestamp.max(row.timestamp);
        }

        blocks.clear();
        for chunk in sorted.chunks(MAX_ROWS_PER_BLOCK) {
            blocks.push(Block {
                rows: chunk.to_vec(),
            });
        }

        Self {
            header: PartHeader {
                rows_count: sorted.len() as u64,
                blocks_count: blocks.len() as u64,
                min_timestamp,
                max_timestamp,
            },
            blocks,
            creation_time: Instant::now(),
        }
    }
}

const MAX_POOLED_PART_SHELLS: usize = 64;

/// Recycles the outer block vectors of retired in-memory parts.
pub struct InmemoryPartPool {
    shells: Mutex<Vec<Vec<Block>>>,
}

impl InmemoryPartPool {
    pub fn new() -> Self {
        Self {
            shells: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Vec<Block> {
        self.shells.lock().pop().unwrap_or_default()
    }

    /// Returns a retired part to the pool. The shell is recycled only when
    /// no merge reader still shares the part.
    pub fn release(&self, mp: Arc<InmemoryPart>) {
        if let Ok(mp) = Arc::try_unwrap(mp) {
            let mut blocks = mp.blocks;
            blocks.clear();
            let mut shells = self.shells.lock();
            if shells.len() < MAX_POOLED_PART_SHELLS {
                shells.push(blocks);
            }
        }
    }
}

impl Default for InmemoryPartPool {
    fn default() -> Self {
        Self::new()
    }
}

/// The number of size buckets in the raw-rows pool. The largest bucket
/// holds buffers of 2^18 rows.
const RAW_ROWS_POOL_BUCKETS: usize = 19;
const MAX_POOLED_BUFFERS_PER_BUCKET: usize = 32;

/// Size-bucketed pool of raw-row buffers, shared by every partition in the
/// process.
pub struct RawRowsPool {
    buckets: [Mutex<Vec<Vec<RawRow>>>; RAW_ROWS_POOL_BUCKETS],
}

impl RawRowsPool {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    /// Returns an empty buffer sized for at least `size` rows, rounded up
    /// to the bucket's power of two.
    pub fn acquire(&self, size: usize) -> Vec<RawRow> {
        let (idx, size_rounded) = bucket_for_size(size);
        match self.buckets[idx].lock().pop() {
            Some(buf) => buf,
            None => Vec::with_capacity(size_rounded),
        }
    }

    /// Returns a buffer to the pool, keyed by its capacity.
    pub fn release(&self, mut buf: Vec<RawRow>) {
        buf.clear();
        let (idx, _) = bucket_for_size(buf.capacity());
        let mut bucket = self.buckets[idx].lock();
        if bucket.len() < MAX_POOLED_BUFFERS_PER_BUCKET {
            bucket.push(buf);
        }
    }
}

impl Default for RawRowsPool {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_for_size(size: usize) -> (usize, usize) {
    let idx = if size <= 1 {
        0
    } else {
        (usize::BITS - (size - 1).leading_zeros()) as usize
    };
    let idx = idx.min(RAW_ROWS_POOL_BUCKETS - 1);
    (idx, 1usize << idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ts: i64, metric_id: u64, value: f64) -> RawRow {
        RawRow::new(ts, metric_id, value)
    }

    #[test]
    fn init_sorts_by_metric_then_timestamp() {
        let rows = vec![row(30, 2, 1.0), row(10, 1, 2.0), row(20, 1, 3.0)];
        let mp = InmemoryPart::init_from_rows(Vec::new(), &rows);

        assert_eq!(mp.header.rows_count, 3);
        assert_eq!(mp.header.blocks_count, 1);
        assert_eq!(mp.header.min_timestamp, 10);
        assert_eq!(mp.header.max_timestamp, 30);

        let flat: Vec<(u64, i64)> = mp.blocks[0]
            .rows
            .iter()
            .map(|r| (r.metric_id, r.timestamp))
            .collect();
        assert_eq!(flat, vec![(1, 10), (1, 20), (2, 30)]);
    }

    #[test]
    fn init_chunks_into_blocks() {
        let rows: Vec<RawRow> = (0..MAX_ROWS_PER_BLOCK as i64 + 1)
            .map(|i| row(i, 1, i as f64))
            .collect();
        let mp = InmemoryPart::init_from_rows(Vec::new(), &rows);
        assert_eq!(mp.header.blocks_count, 2);
        assert_eq!(mp.blocks[0].rows.len(), MAX_ROWS_PER_BLOCK);
        assert_eq!(mp.blocks[1].rows.len(), 1);
    }

    #[test]
    fn part_pool_recycles_unique_shells() {
        let pool = InmemoryPartPool::new();
        let mp = Arc::new(InmemoryPart::init_from_rows(pool.acquire(), &[row(1, 1, 1.0)]));
        pool.release(mp);
        // The recycled shell comes back empty.
        assert!(pool.acquire().is_empty());
    }

    #[test]
    fn part_pool_skips_shared_parts() {
        let pool = InmemoryPartPool::new();
        let mp = Arc::new(InmemoryPart::init_from_rows(Vec::new(), &[row(1, 1, 1.0)]));
        let extra_ref = Arc::clone(&mp);
        pool.release(mp);
        drop(extra_ref);
        assert_eq!(pool.shells.lock().len(), 0);
    }

    #[test]
    fn raw_rows_buckets_round_up() {
        assert_eq!(bucket_for_size(0), (0, 1));
        assert_eq!(bucket_for_size(1), (0, 1));
        assert_eq!(bucket_for_size(2), (1, 2));
        assert_eq!(bucket_for_size(3), (2, 4));
        assert_eq!(bucket_for_size(1 << 18), (18, 1 << 18));
        // Oversized requests land in the last bucket.
        assert_eq!(bucket_for_size(500_000), (18, 1 << 18));
    }

    #[test]
    fn raw_rows_pool_reuses_buffers() {
        let pool = RawRowsPool::new();
        let mut buf = pool.acquire(100);
        buf.push(row(1, 1, 1.0));
        pool.release(buf);
        let buf = pool.acquire(100);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 100);
    }
}
