//! The partition core: tiered part registry, ingest, background merging
//! and lifecycle.
//!
//! A partition owns two tiers of immutable parts ("small" and "big") for
//! one UTC calendar month. Freshly added rows pass through a raw-row
//! buffer, become in-memory parts, get materialized to small file parts
//! and are continuously compacted into fewer, bigger parts by background
//! merge workers. Every part-set mutation commits through the on-disk
//! transaction log, which makes merges atomic across crashes and lets
//! snapshot creation see a consistent part set.

use crate::bstream::{BlockStreamReader, BlockStreamWriter, merge_block_streams};
use crate::cgroup;
use crate::fsutil::{self, DiskSpaceCache};
use crate::inmemory::{InmemoryPart, InmemoryPartPool, RawRowsPool};
use crate::part::{Part, PartHeader};
use crate::timerange::TimeRange;
use crate::txn::{self, TXN_DIR_NAME};
use crate::{RawRow, Result, TslabError, check_precision_bits};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info};

/// The maximum number of rows in a small part.
///
/// Small part merges are finished synchronously during shutdown, so this
/// value must be small enough for a merge of
/// `MAX_ROWS_PER_SMALL_PART * DEFAULT_PARTS_TO_MERGE` rows to complete in
/// up to a minute.
pub const MAX_ROWS_PER_SMALL_PART: u64 = 300_000_000;

/// The maximum number of rows per big part. Bounds the time required for
/// building a single big part.
pub const MAX_ROWS_PER_BIG_PART: u64 = 1_000_000_000_000;

/// The maximum number of small parts in the partition before ingest
/// starts assisting the mergers.
pub const MAX_SMALL_PARTS_PER_PARTITION: usize = 256;

/// Default number of parts to merge at once. Obtained empirically - it
/// gives the lowest write amplification overhead.
pub const DEFAULT_PARTS_TO_MERGE: usize = 15;

/// The number of parts to merge at once during final merges. Must be
/// smaller than DEFAULT_PARTS_TO_MERGE. A lower value improves select
/// performance at the cost of increased write amplification.
pub const FINAL_PARTS_TO_MERGE: usize = 3;

/// The interval for converting recently added raw rows into parts, so
/// they become visible to search.
const RAW_ROWS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// The interval for flushing in-memory parts to persistent storage, so
/// they survive a process crash.
const INMEMORY_PARTS_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

const MIN_MERGE_SLEEP: Duration = Duration::from_millis(1);
const MAX_MERGE_SLEEP: Duration = Duration::from_secs(1);

/// Idle time after which a merger switches to final merges to improve
/// select performance.
const FINAL_MERGE_DELAY: Duration = Duration::from_secs(10);

const TMP_DIR_NAME: &str = "tmp";
/// Legacy directory name skipped when scanning parts.
const SNAPSHOTS_DIR_NAME: &str = "snapshots";

/// Returns the set of deleted metric ids a merge must drop. Supplied by
/// the enclosing table; must not close over the partition.
pub type DeletedMetricIdsFn = Arc<dyn Fn() -> HashSet<u64> + Send + Sync>;

/// Formats the `YYYY_MM` partition name for the month containing the
/// timestamp.
pub use crate::timerange::partition_name_from_timestamp;

/// Process-lifetime collaborators shared by every partition: the staging
/// pools, the free-disk-space cache and the sizing limits derived from
/// the machine. Constructed once at startup; tests inject their own.
pub struct PartitionEnv {
    pub raw_rows_pool: RawRowsPool,
    pub inmemory_part_pool: Arc<InmemoryPartPool>,
    pub disk_space_cache: DiskSpaceCache,
    /// Capacity of the raw-row buffer per partition.
    pub max_raw_rows_per_partition: usize,
    /// Number of merge workers per tier.
    pub merge_workers: usize,
}

impl PartitionEnv {
    /// Derives limits from the resources granted to the process.
    pub fn detect() -> Self {
        let row_size = std::mem::size_of::<RawRow>() as u64;
        let max_raw_rows = (cgroup::allowed_memory() / 256 / row_size) as usize;
        Self::with_limits(
            max_raw_rows.clamp(10_000, 500_000),
            (cgroup::available_cpus() / 2).max(1),
        )
    }

    /// Builds an environment with explicit limits.
    pub fn with_limits(max_raw_rows_per_partition: usize, merge_workers: usize) -> Self {
        assert!(max_raw_rows_per_partition > 0);
        assert!(merge_workers > 0);
        Self {
            raw_rows_pool: RawRowsPool::new(),
            inmemory_part_pool: Arc::new(InmemoryPartPool::new()),
            disk_space_cache: DiskSpaceCache::new(),
            max_raw_rows_per_partition,
            merge_workers,
        }
    }
}

/// The registry's unit of part ownership.
///
/// Wrappers are shared between the registry and concurrent searches via
/// reference counting: the registry holds one reference, every snapshot
/// adds one per wrapper. When the count reaches zero the in-memory
/// backing returns to its pool and the part closes.
pub struct PartWrapper {
    part: Part,

    /// The in-memory backing; present iff the part has not been
    /// materialized to a file yet. Only small-tier parts may carry one.
    mp: Mutex<Option<Arc<InmemoryPart>>>,

    ref_count: AtomicU64,

    /// Set while the planner has committed this wrapper to an ongoing
    /// merge. Read and written only under the registry's parts lock.
    in_merge: AtomicBool,

    pool: Arc<InmemoryPartPool>,
}

impl PartWrapper {
    fn new_inmemory(mp: InmemoryPart, pool: Arc<InmemoryPartPool>) -> Arc<Self> {
        Arc::new(Self {
            part: Part::from_inmemory_header(mp.header),
            mp: Mutex::new(Some(Arc::new(mp))),
            ref_count: AtomicU64::new(1),
            in_merge: AtomicBool::new(false),
            pool,
        })
    }

    fn new_file(part: Part, pool: Arc<InmemoryPartPool>) -> Arc<Self> {
        Arc::new(Self {
            part,
            mp: Mutex::new(None),
            ref_count: AtomicU64::new(1),
            in_merge: AtomicBool::new(false),
            pool,
        })
    }

    pub fn header(&self) -> &PartHeader {
        &self.part.header
    }

    pub fn rows_count(&self) -> u64 {
        self.part.header.rows_count
    }

    /// The canonical directory of a file part; None for memory-backed
    /// parts.
    pub fn part_path(&self) -> Option<&Path> {
        self.part.path.as_deref()
    }

    /// The in-memory backing, if the part has not been flushed yet.
    pub fn mem_part(&self) -> Option<Arc<InmemoryPart>> {
        self.mp.lock().clone()
    }

    fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    fn dec_ref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            panic!("BUG: part wrapper ref count dropped below zero");
        }
        if prev > 1 {
            return;
        }
        if let Some(mp) = self.mp.lock().take() {
            self.pool.release(mp);
        }
    }

    fn is_in_merge(&self) -> bool {
        self.in_merge.load(Ordering::Relaxed)
    }

    fn set_in_merge(&self, in_merge: bool) {
        self.in_merge.store(in_merge, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct PartLists {
    small: Vec<Arc<PartWrapper>>,
    big: Vec<Arc<PartWrapper>>,
}

struct RawRowsState {
    rows: Vec<RawRow>,
    last_flush_time: Instant,
}

/// Essential metrics for the partition, accumulated by `update_metrics`.
#[derive(Debug, Default, Clone)]
pub struct PartitionMetrics {
    pub pending_rows: u64,

    pub big_rows_count: u64,
    pub small_rows_count: u64,

    pub big_blocks_count: u64,
    pub small_blocks_count: u64,

    pub big_parts_count: u64,
    pub small_parts_count: u64,

    pub active_big_merges: u64,
    pub active_small_merges: u64,

    pub big_merges_count: u64,
    pub small_merges_count: u64,

    pub big_rows_merged: u64,
    pub small_rows_merged: u64,

    pub big_rows_deleted: u64,
    pub small_rows_deleted: u64,

    pub big_parts_ref_count: u64,
    pub small_parts_ref_count: u64,

    pub small_assisted_merges: u64,
}

/// A partition for a single UTC month.
pub struct Partition {
    /// Name of the partition in the form YYYY_MM.
    name: String,

    /// The time range covered by the partition, a whole month.
    tr: TimeRange,

    small_parts_path: PathBuf,
    big_parts_path: PathBuf,

    get_deleted_metric_ids: DeletedMetricIdsFn,

    env: Arc<PartitionEnv>,

    /// Guards the small and big part lists and every `in_merge` flag.
    parts: Mutex<PartLists>,

    /// Recently added rows that haven't been converted into parts yet.
    /// Not visible to search.
    raw_rows: Mutex<RawRowsState>,

    merge_idx: AtomicU64,

    /// Orders transaction appliers (readers) against snapshot creation
    /// (writer).
    snapshot_lock: RwLock<()>,

    /// Dropped on close; every background loop observes the disconnect.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,

    small_mergers: Mutex<Vec<JoinHandle<()>>>,
    big_mergers: Mutex<Vec<JoinHandle<()>>>,
    raw_rows_flusher: Mutex<Option<JoinHandle<()>>>,
    inmemory_parts_flusher: Mutex<Option<JoinHandle<()>>>,

    active_big_merges: AtomicU64,
    active_small_merges: AtomicU64,
    big_merges_count: AtomicU64,
    small_merges_count: AtomicU64,
    big_rows_merged: AtomicU64,
    small_rows_merged: AtomicU64,
    big_rows_deleted: AtomicU64,
    small_rows_deleted: AtomicU64,
    small_assisted_merges: AtomicU64,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition").field("name", &self.name).finish()
    }
}

/// Creates a new partition for the month containing `timestamp` under the
/// given small and big tier roots.
pub fn create_partition(
    timestamp: i64,
    small_partitions_path: &Path,
    big_partitions_path: &Path,
    get_deleted_metric_ids: DeletedMetricIdsFn,
    env: Arc<PartitionEnv>,
) -> Result<Arc<Partition>> {
    let name = partition_name_from_timestamp(timestamp);
    let small_parts_path = small_partitions_path.join(&name);
    let big_parts_path = big_partitions_path.join(&name);
    info!(
        "creating a partition {:?} with small_parts_path={:?}, big_parts_path={:?}",
        name, small_parts_path, big_parts_path
    );

    create_partition_dirs(&small_parts_path)?;
    create_partition_dirs(&big_parts_path)?;

    let tr = TimeRange::from_partition_timestamp(timestamp);
    let pt = Arc::new(Partition::new(
        name.clone(),
        tr,
        small_parts_path,
        big_parts_path,
        get_deleted_metric_ids,
        env,
    ));
    pt.start_merge_workers();
    pt.start_raw_rows_flusher();
    pt.start_inmemory_parts_flusher();

    info!("partition {:?} has been created", name);
    Ok(pt)
}

/// Opens an existing partition from its two tier directories. Pending
/// transactions are replayed before the part directories are scanned.
pub fn open_partition(
    small_parts_path: &Path,
    big_parts_path: &Path,
    get_deleted_metric_ids: DeletedMetricIdsFn,
    env: Arc<PartitionEnv>,
) -> Result<Arc<Partition>> {
    let name = small_parts_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TslabError::InvalidPartitionName {
            name: small_parts_path.display().to_string(),
        })?
        .to_string();
    if big_parts_path.file_name().and_then(|n| n.to_str()) != Some(name.as_str()) {
        return Err(TslabError::PartitionPathMismatch {
            small_path: small_parts_path.to_path_buf(),
            big_path: big_parts_path.to_path_buf(),
        });
    }
    let tr = TimeRange::from_partition_name(&name)?;

    let small_parts = open_parts(small_parts_path, big_parts_path, small_parts_path, &env)?;
    let big_parts = match open_parts(small_parts_path, big_parts_path, big_parts_path, &env) {
        Ok(parts) => parts,
        Err(e) => {
            must_close_parts(small_parts);
            return Err(e);
        }
    };

    let pt = Arc::new(Partition::new(
        name,
        tr,
        small_parts_path.to_path_buf(),
        big_parts_path.to_path_buf(),
        get_deleted_metric_ids,
        env,
    ));
    {
        let mut parts = pt.parts.lock();
        parts.small = small_parts;
        parts.big = big_parts;
    }
    pt.start_merge_workers();
    pt.start_raw_rows_flusher();
    pt.start_inmemory_parts_flusher();

    Ok(pt)
}

impl Partition {
    fn new(
        name: String,
        tr: TimeRange,
        small_parts_path: PathBuf,
        big_parts_path: PathBuf,
        get_deleted_metric_ids: DeletedMetricIdsFn,
        env: Arc<PartitionEnv>,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let raw_rows = env.raw_rows_pool.acquire(env.max_raw_rows_per_partition);
        let merge_idx = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        Self {
            name,
            tr,
            small_parts_path,
            big_parts_path,
            get_deleted_metric_ids,
            env,
            parts: Mutex::new(PartLists::default()),
            raw_rows: Mutex::new(RawRowsState {
                rows: raw_rows,
                last_flush_time: Instant::now(),
            }),
            merge_idx: AtomicU64::new(merge_idx),
            snapshot_lock: RwLock::new(()),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            small_mergers: Mutex::new(Vec::new()),
            big_mergers: Mutex::new(Vec::new()),
            raw_rows_flusher: Mutex::new(None),
            inmemory_parts_flusher: Mutex::new(None),
            active_big_merges: AtomicU64::new(0),
            active_small_merges: AtomicU64::new(0),
            big_merges_count: AtomicU64::new(0),
            small_merges_count: AtomicU64::new(0),
            big_rows_merged: AtomicU64::new(0),
            small_rows_merged: AtomicU64::new(0),
            big_rows_deleted: AtomicU64::new(0),
            small_rows_deleted: AtomicU64::new(0),
            small_assisted_merges: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn time_range(&self) -> TimeRange {
        self.tr
    }

    pub fn small_parts_path(&self) -> &Path {
        &self.small_parts_path
    }

    pub fn big_parts_path(&self) -> &Path {
        &self.big_parts_path
    }

    /// True if the partition covers the given timestamp.
    pub fn has_timestamp(&self, timestamp: i64) -> bool {
        self.tr.contains(timestamp)
    }

    /// Adds the given rows to the partition.
    ///
    /// All rows must fit the partition's time range and carry valid
    /// precision bits; violations are caller bugs and panic.
    pub fn add_rows(&self, rows: &[RawRow]) {
        if rows.is_empty() {
            return;
        }

        for row in rows {
            if !self.has_timestamp(row.timestamp) {
                panic!(
                    "BUG: {row} has timestamp outside partition {:?} range {:?}",
                    self.name, self.tr
                );
            }
            if let Err(e) = check_precision_bits(row.precision_bits) {
                panic!("BUG: {row} has invalid precision bits: {e}");
            }
        }

        let mut full_buffers = Vec::new();
        {
            let mut state = self.raw_rows.lock();
            let mut rows = rows;
            loop {
                let capacity = self
                    .env
                    .max_raw_rows_per_partition
                    .saturating_sub(state.rows.len());
                if capacity >= rows.len() {
                    // Fast path - the rows fit the buffer.
                    state.rows.extend_from_slice(rows);
                    break;
                }

                // Slow path - fill the buffer to capacity and swap it out
                // for conversion into a part.
                state.rows.extend_from_slice(&rows[..capacity]);
                rows = &rows[capacity..];
                let fresh = self
                    .env
                    .raw_rows_pool
                    .acquire(self.env.max_raw_rows_per_partition);
                full_buffers.push(std::mem::replace(&mut state.rows, fresh));
                state.last_flush_time = Instant::now();
            }
        }

        for buf in full_buffers {
            self.add_rows_part(&buf);
            self.env.raw_rows_pool.release(buf);
        }
    }

    /// Converts a batch of rows into an in-memory part registered in the
    /// small tier, assisting the mergers when the tier is over its cap.
    fn add_rows_part(&self, rows: &[RawRow]) {
        if rows.is_empty() {
            return;
        }

        let shell = self.env.inmemory_part_pool.acquire();
        let mp = InmemoryPart::init_from_rows(shell, rows);
        let ph = mp.header;
        if ph.min_timestamp > ph.max_timestamp {
            panic!(
                "BUG: part cannot be added to partition {:?}: min timestamp {} exceeds max timestamp {}",
                self.name, ph.min_timestamp, ph.max_timestamp
            );
        }
        if ph.min_timestamp < self.tr.min_timestamp || ph.max_timestamp > self.tr.max_timestamp {
            panic!(
                "BUG: part with range [{}, {}] cannot be added to partition {:?} covering {:?}",
                ph.min_timestamp, ph.max_timestamp, self.name, self.tr
            );
        }

        let pw = PartWrapper::new_inmemory(mp, Arc::clone(&self.env.inmemory_part_pool));
        let ok = {
            let mut parts = self.parts.lock();
            parts.small.push(pw);
            parts.small.len() <= MAX_SMALL_PARTS_PER_PARTITION
        };
        if ok {
            return;
        }

        // The small tier exceeds its cap. Help merging parts; this is the
        // sole backpressure throttling producers.
        match self.merge_small_parts(false) {
            Ok(()) => {
                self.small_assisted_merges.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_benign_merge_outcome() => {}
            Err(e) => {
                error!("cannot merge small parts on {:?}: {e}", self.small_parts_path);
                panic!("FATAL: cannot merge small parts: {e}");
            }
        }
    }

    /// Appends a reference-counted snapshot of every part to `dst`. The
    /// appended wrappers must be released with [`Partition::put_parts`].
    pub fn get_parts(&self, dst: &mut Vec<Arc<PartWrapper>>) {
        let parts = self.parts.lock();
        for pw in parts.small.iter().chain(parts.big.iter()) {
            pw.inc_ref();
            dst.push(Arc::clone(pw));
        }
    }

    /// Releases wrappers obtained via [`Partition::get_parts`].
    pub fn put_parts(&self, pws: &[Arc<PartWrapper>]) {
        for pw in pws {
            pw.dec_ref();
        }
    }

    /// Accumulates the partition's metrics into `m`.
    pub fn update_metrics(&self, m: &mut PartitionMetrics) {
        {
            let state = self.raw_rows.lock();
            m.pending_rows += state.rows.len() as u64;
            m.small_rows_count += state.rows.len() as u64;
        }

        {
            let parts = self.parts.lock();
            for pw in &parts.big {
                m.big_rows_count += pw.part.header.rows_count;
                m.big_blocks_count += pw.part.header.blocks_count;
                m.big_parts_ref_count += pw.ref_count.load(Ordering::SeqCst);
            }
            for pw in &parts.small {
                m.small_rows_count += pw.part.header.rows_count;
                m.small_blocks_count += pw.part.header.blocks_count;
                m.small_parts_ref_count += pw.ref_count.load(Ordering::SeqCst);
            }
            m.big_parts_count += parts.big.len() as u64;
            m.small_parts_count += parts.small.len() as u64;
        }

        m.active_big_merges += self.active_big_merges.load(Ordering::Relaxed);
        m.active_small_merges += self.active_small_merges.load(Ordering::Relaxed);
        m.big_merges_count += self.big_merges_count.load(Ordering::Relaxed);
        m.small_merges_count += self.small_merges_count.load(Ordering::Relaxed);
        m.big_rows_merged += self.big_rows_merged.load(Ordering::Relaxed);
        m.small_rows_merged += self.small_rows_merged.load(Ordering::Relaxed);
        m.big_rows_deleted += self.big_rows_deleted.load(Ordering::Relaxed);
        m.small_rows_deleted += self.small_rows_deleted.load(Ordering::Relaxed);
        m.small_assisted_merges += self.small_assisted_merges.load(Ordering::Relaxed);
    }

    // Background tasks.

    fn start_raw_rows_flusher(self: &Arc<Self>) {
        let pt = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("tslab-raw-rows-flusher".to_string())
            .spawn(move || pt.raw_rows_flusher_loop())
            .expect("failed to spawn raw rows flusher");
        *self.raw_rows_flusher.lock() = Some(handle);
    }

    fn raw_rows_flusher_loop(&self) {
        loop {
            match self.stop_rx.recv_timeout(RAW_ROWS_FLUSH_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => self.flush_raw_rows(false),
            }
        }
    }

    pub(crate) fn flush_raw_rows(&self, is_final: bool) {
        let mut stolen = None;
        {
            let mut state = self.raw_rows.lock();
            if is_final || state.last_flush_time.elapsed() > RAW_ROWS_FLUSH_INTERVAL {
                let fresh = self
                    .env
                    .raw_rows_pool
                    .acquire(self.env.max_raw_rows_per_partition);
                stolen = Some(std::mem::replace(&mut state.rows, fresh));
                state.last_flush_time = Instant::now();
            }
        }
        if let Some(rows) = stolen {
            self.add_rows_part(&rows);
            self.env.raw_rows_pool.release(rows);
        }
    }

    fn start_inmemory_parts_flusher(self: &Arc<Self>) {
        let pt = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("tslab-inmemory-parts-flusher".to_string())
            .spawn(move || pt.inmemory_parts_flusher_loop())
            .expect("failed to spawn inmemory parts flusher");
        *self.inmemory_parts_flusher.lock() = Some(handle);
    }

    fn inmemory_parts_flusher_loop(&self) {
        loop {
            match self.stop_rx.recv_timeout(INMEMORY_PARTS_FLUSH_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = self.flush_inmemory_parts(false) {
                        if e.is_benign_merge_outcome() {
                            continue;
                        }
                        error!("cannot flush inmemory parts on {:?}: {e}", self.small_parts_path);
                        panic!("FATAL: cannot flush inmemory parts: {e}");
                    }
                }
            }
        }
    }

    /// Materializes aged in-memory parts (all of them when `force` is
    /// set) to file parts via merging.
    pub(crate) fn flush_inmemory_parts(&self, force: bool) -> Result<()> {
        let mut pws = Vec::new();
        {
            let parts = self.parts.lock();
            for pw in &parts.small {
                let Some(mp) = pw.mem_part() else { continue };
                if pw.is_in_merge() {
                    continue;
                }
                if force || mp.creation_time.elapsed() >= INMEMORY_PARTS_FLUSH_INTERVAL {
                    pw.set_in_merge(true);
                    pws.push(Arc::clone(pw));
                }
            }
        }
        self.merge_parts_optimal(pws)
    }

    /// Merges the given parts in chunks of at most
    /// [`DEFAULT_PARTS_TO_MERGE`]. A single-part merge is still a merge:
    /// it materializes an in-memory part onto disk.
    fn merge_parts_optimal(&self, pws: Vec<Arc<PartWrapper>>) -> Result<()> {
        let mut rest = &pws[..];
        while rest.len() > DEFAULT_PARTS_TO_MERGE {
            self.merge_parts(rest[..DEFAULT_PARTS_TO_MERGE].to_vec(), None)?;
            rest = &rest[DEFAULT_PARTS_TO_MERGE..];
        }
        if !rest.is_empty() {
            self.merge_parts(rest.to_vec(), None)?;
        }
        Ok(())
    }

    fn start_merge_workers(self: &Arc<Self>) {
        for i in 0..self.env.merge_workers {
            let pt = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("tslab-small-merger-{i}"))
                .spawn(move || {
                    if let Err(e) = pt.parts_merger(Partition::merge_small_parts) {
                        error!(
                            "unrecoverable error when merging small parts in partition {:?}: {e}",
                            pt.small_parts_path
                        );
                        panic!("FATAL: unrecoverable error when merging small parts: {e}");
                    }
                })
                .expect("failed to spawn small parts merger");
            self.small_mergers.lock().push(handle);
        }

        for i in 0..self.env.merge_workers {
            let pt = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("tslab-big-merger-{i}"))
                .spawn(move || {
                    if let Err(e) = pt.parts_merger(Partition::merge_big_parts) {
                        error!(
                            "unrecoverable error when merging big parts in partition {:?}: {e}",
                            pt.big_parts_path
                        );
                        panic!("FATAL: unrecoverable error when merging big parts: {e}");
                    }
                })
                .expect("failed to spawn big parts merger");
            self.big_mergers.lock().push(handle);
        }
    }

    /// The merge worker loop: merge while there is work, back off
    /// exponentially while there is none, switch to final merges after
    /// 10 s of idleness.
    fn parts_merger(&self, merger_fn: fn(&Partition, bool) -> Result<()>) -> Result<()> {
        let mut sleep_time = MIN_MERGE_SLEEP;
        let mut last_merge_time = Instant::now();
        let mut is_final = false;
        loop {
            match merger_fn(self, is_final) {
                Ok(()) => {
                    // Try merging additional parts.
                    sleep_time = MIN_MERGE_SLEEP;
                    last_merge_time = Instant::now();
                    is_final = false;
                    continue;
                }
                Err(TslabError::ForciblyStopped) => return Ok(()),
                Err(TslabError::NothingToMerge) => {}
                Err(e) => return Err(e),
            }

            if last_merge_time.elapsed() > FINAL_MERGE_DELAY {
                // There is free time for merging into bigger parts to
                // improve select performance.
                last_merge_time = Instant::now();
                is_final = true;
                continue;
            }

            sleep_time = (sleep_time * 2).min(MAX_MERGE_SLEEP);
            match self.stop_rx.recv_timeout(sleep_time) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    /// The maximum number of rows in a big merge output, bounded by the
    /// free disk space split across the big-tier merge workers. Assumes
    /// each row compresses into one byte, which production simulation
    /// shows is a safe overestimate.
    fn max_out_part_rows(&self) -> Result<u64> {
        let free_space = self.env.disk_space_cache.free_space(&self.big_parts_path)?;
        Ok(free_space / self.env.merge_workers as u64)
    }

    fn merge_big_parts(&self, is_final: bool) -> Result<()> {
        let max_rows = self.max_out_part_rows()?.min(MAX_ROWS_PER_BIG_PART);

        let pws = {
            let parts = self.parts.lock();
            get_parts_to_merge(&parts.big, max_rows, is_final)
        };
        if pws.is_empty() {
            return Err(TslabError::NothingToMerge);
        }

        self.big_merges_count.fetch_add(1, Ordering::Relaxed);
        self.active_big_merges.fetch_add(1, Ordering::Relaxed);
        let res = self.merge_parts(pws, Some(&self.stop_rx));
        self.active_big_merges.fetch_sub(1, Ordering::Relaxed);
        res
    }

    fn merge_small_parts(&self, is_final: bool) -> Result<()> {
        let max_rows = MAX_ROWS_PER_SMALL_PART * DEFAULT_PARTS_TO_MERGE as u64;

        let pws = {
            let parts = self.parts.lock();
            get_parts_to_merge(&parts.small, max_rows, is_final)
        };
        if pws.is_empty() {
            return Err(TslabError::NothingToMerge);
        }

        self.small_merges_count.fetch_add(1, Ordering::Relaxed);
        self.active_small_merges.fetch_add(1, Ordering::Relaxed);
        let res = self.merge_parts(pws, Some(&self.stop_rx));
        self.active_small_merges.fetch_sub(1, Ordering::Relaxed);
        res
    }

    fn next_merge_idx(&self) -> u64 {
        self.merge_idx.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merges the given parts into a new part installed in the tier
    /// chosen by the output size, committing through a transaction file.
    /// The input wrappers must already carry the `in_merge` flag.
    pub(crate) fn merge_parts(
        &self,
        pws: Vec<Arc<PartWrapper>>,
        stop_ch: Option<&Receiver<()>>,
    ) -> Result<()> {
        if pws.is_empty() {
            return Err(TslabError::NothingToMerge);
        }
        let _clear_guard = ClearInMergeGuard { pt: self, pws: &pws };
        let start_time = Instant::now();

        // Prepare block stream readers for the source parts.
        let mut bsrs = Vec::with_capacity(pws.len());
        for pw in &pws {
            let bsr = match pw.mem_part() {
                Some(mp) => BlockStreamReader::init_from_inmemory(mp),
                None => {
                    let path = match pw.part_path() {
                        Some(path) => path,
                        None => panic!("BUG: file part without a canonical path"),
                    };
                    BlockStreamReader::init_from_file_part(path)?
                }
            };
            bsrs.push(bsr);
        }

        let out_rows_count: u64 = pws.iter().map(|pw| pw.rows_count()).sum();
        let is_big_part = out_rows_count > MAX_ROWS_PER_SMALL_PART;
        let nocache = is_big_part;
        let pt_path = if is_big_part {
            &self.big_parts_path
        } else {
            &self.small_parts_path
        };

        // Prepare the block stream writer for the destination part.
        let merge_idx = self.next_merge_idx();
        let tmp_part_path = pt_path.join(TMP_DIR_NAME).join(format!("{merge_idx:016X}"));
        let compress_level = compress_level_for_rows_count(out_rows_count);
        let bsw = BlockStreamWriter::create_file_part(&tmp_part_path, nocache, compress_level)?;

        // Merge the streams.
        let (rows_merged, rows_deleted) = if is_big_part {
            (&self.big_rows_merged, &self.big_rows_deleted)
        } else {
            (&self.small_rows_merged, &self.small_rows_deleted)
        };
        let dmis = (self.get_deleted_metric_ids)();
        let ph = merge_block_streams(bsw, bsrs, stop_ch, rows_merged, &dmis, rows_deleted)?;

        // Build the transaction atomically retiring the old parts and
        // installing the new one.
        let mut txn_body = String::new();
        for pw in &pws {
            if pw.mem_part().is_none()
                && let Some(path) = pw.part_path()
            {
                txn_body.push_str(&path.display().to_string());
                txn_body.push('\n');
            }
        }
        // The destination may be empty if every input row was deleted
        // during the merge.
        let dst_part_path =
            (ph.rows_count > 0).then(|| pt_path.join(ph.part_dir_name(merge_idx)));
        let dst_display = dst_part_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        txn_body.push_str(&format!("{} -> {dst_display}\n", tmp_part_path.display()));

        let txn_path = pt_path.join(TXN_DIR_NAME).join(format!("{merge_idx:016X}"));
        fsutil::write_file(&txn_path, txn_body.as_bytes())?;

        txn::run_transaction(
            &self.snapshot_lock,
            &self.small_parts_path,
            &self.big_parts_path,
            &txn_path,
        )?;

        // Open the merged part if it is non-empty.
        let new_pw = match &dst_part_path {
            Some(dst) => {
                let part = Part::open_file_part(dst)?;
                Some(PartWrapper::new_file(
                    part,
                    Arc::clone(&self.env.inmemory_part_pool),
                ))
            }
            None => None,
        };

        // Atomically swap the old parts for the new one in the registry.
        let mut to_remove: HashSet<*const PartWrapper> = HashSet::with_capacity(pws.len());
        for pw in &pws {
            to_remove.insert(Arc::as_ptr(pw));
        }
        if to_remove.len() != pws.len() {
            panic!(
                "BUG: {} duplicate parts found in the merge of {} parts",
                pws.len() - to_remove.len(),
                pws.len()
            );
        }
        {
            let mut parts = self.parts.lock();
            let removed_small = remove_parts(&mut parts.small, &to_remove);
            let removed_big = remove_parts(&mut parts.big, &to_remove);
            if let Some(pw) = &new_pw {
                if is_big_part {
                    if pw.mem_part().is_some() {
                        panic!("BUG: a memory-backed part cannot enter the big tier");
                    }
                    parts.big.push(Arc::clone(pw));
                } else {
                    parts.small.push(Arc::clone(pw));
                }
            }
            if removed_small + removed_big != pws.len() {
                panic!(
                    "BUG: unexpected number of parts removed; got {}, want {}",
                    removed_small + removed_big,
                    pws.len()
                );
            }
        }

        // Drop the registry references; the retired parts close once the
        // searches still holding them finish.
        for pw in &pws {
            pw.dec_ref();
        }

        let elapsed = start_time.elapsed();
        if elapsed > Duration::from_secs(10) {
            info!(
                "merged {out_rows_count} rows in {:.3}s at {} rows/sec to {dst_display:?}",
                elapsed.as_secs_f64(),
                (out_rows_count as f64 / elapsed.as_secs_f64()) as u64
            );
        }

        Ok(())
    }

    /// Creates a snapshot of the partition at the given destination
    /// directories using hard links, after force-flushing all in-memory
    /// state.
    pub fn create_snapshot_at(&self, small_path: &Path, big_path: &Path) -> Result<()> {
        info!(
            "creating partition snapshot of {:?} and {:?}...",
            self.small_parts_path, self.big_parts_path
        );
        let start_time = Instant::now();

        // Flush in-memory data to disk so the snapshot is complete.
        self.flush_raw_rows(true);
        self.flush_inmemory_parts(true)?;

        // The snapshot is created under the write lock to exclude
        // concurrent part-set mutations via run_transaction.
        let _guard = self.snapshot_lock.write();

        self.create_snapshot(&self.small_parts_path, small_path)?;
        self.create_snapshot(&self.big_parts_path, big_path)?;

        info!(
            "created partition snapshot at {:?} and {:?} in {:.3}s",
            small_path,
            big_path,
            start_time.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn create_snapshot(&self, src_dir: &Path, dst_dir: &Path) -> Result<()> {
        fsutil::mkdir_all_fail_if_exist(dst_dir)?;

        for entry in fs::read_dir(src_dir).map_err(|e| crate::error::io_with_path(src_dir, e))? {
            let entry = entry.map_err(|e| crate::error::io_with_path(src_dir, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| crate::error::io_with_path(entry.path(), e))?;
            if !fsutil::is_dir_or_symlink(&file_type) {
                continue;
            }
            let name = entry.file_name();
            if name == TMP_DIR_NAME || name == TXN_DIR_NAME || name == SNAPSHOTS_DIR_NAME {
                continue;
            }
            fsutil::hard_link_files(&entry.path(), &dst_dir.join(&name))?;
        }

        fsutil::sync_path(dst_dir)?;
        if let Some(parent) = dst_dir.parent() {
            fsutil::sync_path(parent)?;
        }
        Ok(())
    }

    /// Closes the partition: stops every background task, flushes all
    /// in-memory state to files and releases the registry's part
    /// references.
    pub fn close(&self) -> Result<()> {
        let stop_tx = self.stop_tx.lock().take();
        let Some(stop_tx) = stop_tx else {
            return Err(TslabError::AlreadyClosed);
        };
        // Dropping the sender disconnects every receiver clone.
        drop(stop_tx);

        info!("waiting for background tasks to stop on {:?}...", self.small_parts_path);
        if let Some(handle) = self.inmemory_parts_flusher.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.raw_rows_flusher.lock().take() {
            let _ = handle.join();
        }
        for handle in self.small_mergers.lock().drain(..) {
            let _ = handle.join();
        }
        for handle in self.big_mergers.lock().drain(..) {
            let _ = handle.join();
        }

        // Flush raw rows one last time before exit.
        self.flush_raw_rows(true);

        // Flush the remaining in-memory parts to files.
        let mut pws = Vec::new();
        {
            let parts = self.parts.lock();
            for pw in &parts.small {
                if pw.mem_part().is_none() {
                    continue;
                }
                if pw.is_in_merge() {
                    panic!(
                        "BUG: an inmemory part must not be in merge after the mergers have stopped"
                    );
                }
                pw.set_in_merge(true);
                pws.push(Arc::clone(pw));
            }
        }
        let flushed = pws.len();
        if let Err(e) = self.merge_parts_optimal(pws) {
            error!(
                "cannot flush {flushed} inmemory parts to files on {:?}: {e}",
                self.small_parts_path
            );
            panic!("FATAL: cannot flush {flushed} inmemory parts to files: {e}");
        }

        // Remove the registry references so the parts may close after all
        // outstanding searches are done.
        let small = {
            let mut parts = self.parts.lock();
            std::mem::take(&mut parts.small)
        };
        for pw in &small {
            pw.dec_ref();
        }
        let big = {
            let mut parts = self.parts.lock();
            std::mem::take(&mut parts.big)
        };
        for pw in &big {
            pw.dec_ref();
        }

        info!("partition {:?} has been closed", self.name);
        Ok(())
    }

    /// Removes all partition data on disk. Only valid after the partition
    /// has been detached from its enclosing table and closed.
    pub fn delete(&self) -> Result<()> {
        info!(
            "dropping partition {:?} at {:?} and {:?}",
            self.name, self.small_parts_path, self.big_parts_path
        );
        fsutil::remove_all(&self.small_parts_path)?;
        fsutil::remove_all(&self.big_parts_path)?;
        info!("partition {:?} has been dropped", self.name);
        Ok(())
    }
}

/// Clears the `in_merge` flags of a merge set when the merge finishes,
/// whether it succeeded or not.
struct ClearInMergeGuard<'a> {
    pt: &'a Partition,
    pws: &'a [Arc<PartWrapper>],
}

impl Drop for ClearInMergeGuard<'_> {
    fn drop(&mut self) {
        let _parts = self.pt.parts.lock();
        for pw in self.pws {
            if !pw.is_in_merge() && !thread::panicking() {
                panic!("BUG: missing in_merge flag on a merged part");
            }
            pw.set_in_merge(false);
        }
    }
}

fn remove_parts(pws: &mut Vec<Arc<PartWrapper>>, to_remove: &HashSet<*const PartWrapper>) -> usize {
    let before = pws.len();
    pws.retain(|pw| !to_remove.contains(&Arc::as_ptr(pw)));
    before - pws.len()
}

/// Selects the optimal parts to merge from a tier's list, marking them
/// in-merge. Must be called under the parts lock.
fn get_parts_to_merge(
    pws: &[Arc<PartWrapper>],
    max_rows: u64,
    is_final: bool,
) -> Vec<Arc<PartWrapper>> {
    let pws_remaining: Vec<Arc<PartWrapper>> = pws
        .iter()
        .filter(|pw| !pw.is_in_merge())
        .cloned()
        .collect();

    let mut pms = Vec::new();
    if is_final {
        let mut max_parts_to_merge = DEFAULT_PARTS_TO_MERGE;
        while pms.is_empty() && max_parts_to_merge >= FINAL_PARTS_TO_MERGE {
            pms = append_parts_to_merge(&pws_remaining, max_parts_to_merge, max_rows);
            max_parts_to_merge -= 1;
        }
    } else {
        pms = append_parts_to_merge(&pws_remaining, DEFAULT_PARTS_TO_MERGE, max_rows);
    }

    for pw in &pms {
        if pw.is_in_merge() {
            panic!("BUG: in_merge flag is already set on a selected part");
        }
        pw.set_in_merge(true);
    }
    pms
}

/// Finds the window of parts whose merge gives the highest write
/// amplification payoff, or nothing if no window clears the threshold.
fn append_parts_to_merge(
    src: &[Arc<PartWrapper>],
    max_parts_to_merge: usize,
    max_rows: u64,
) -> Vec<Arc<PartWrapper>> {
    if src.len() < 2 {
        // There is no need in merging zero or one part :)
        return Vec::new();
    }
    assert!(
        max_parts_to_merge >= 2,
        "BUG: max_parts_to_merge cannot be smaller than 2; got {max_parts_to_merge}"
    );

    // Filter out too big parts. This keeps the exhaustive search below
    // tractable and prevents a single oversized part from dominating.
    let max_in_part_rows = max_rows / 2;
    let mut src: Vec<Arc<PartWrapper>> = src
        .iter()
        .filter(|pw| pw.rows_count() <= max_in_part_rows)
        .cloned()
        .collect();

    // Sort by rows count and backwards timestamp. Grouping similarly
    // sized parts improves compaction locality; the timestamp tie-break
    // improves temporal locality of adjacent points in the merged output.
    src.sort_by(|a, b| {
        a.rows_count()
            .cmp(&b.rows_count())
            .then_with(|| b.header().min_timestamp.cmp(&a.header().min_timestamp))
    });

    let n = max_parts_to_merge.min(src.len());

    // Exhaustive search for the window giving the lowest write
    // amplification when merged.
    let mut best: Option<(usize, usize)> = None;
    let mut max_m = 0f64;
    for i in 2..=n {
        for j in 0..=src.len() - i {
            let window = &src[j..j + i];
            let rows_sum: u64 = window.iter().map(|pw| pw.rows_count()).sum();
            if rows_sum > max_rows {
                continue;
            }
            let m = rows_sum as f64 / window[i - 1].rows_count() as f64;
            if m < max_m {
                continue;
            }
            max_m = m;
            best = Some((j, i));
        }
    }

    let min_m = (max_parts_to_merge as f64 / 2.0).max(2.0);
    if max_m < min_m {
        // The win from merging such parts is too small.
        return Vec::new();
    }
    let Some((j, i)) = best else {
        return Vec::new();
    };
    src[j..j + i].to_vec()
}

fn compress_level_for_rows_count(rows_count: u64) -> i32 {
    if rows_count <= 1 << 19 {
        1
    } else if rows_count <= 1 << 22 {
        2
    } else if rows_count <= 1 << 25 {
        3
    } else if rows_count <= 1 << 28 {
        4
    } else {
        5
    }
}

fn create_partition_dirs(path: &Path) -> Result<()> {
    fsutil::mkdir_all_fail_if_exist(&path.join(TXN_DIR_NAME))?;
    fsutil::mkdir_all_fail_if_exist(&path.join(TMP_DIR_NAME))?;
    fsutil::sync_path(path)
}

/// Recovers pending transactions under `path`, resets its service
/// directories and opens every installed part.
fn open_parts(
    path_prefix1: &Path,
    path_prefix2: &Path,
    path: &Path,
    env: &Arc<PartitionEnv>,
) -> Result<Vec<Arc<PartWrapper>>> {
    // Snapshots cannot be created yet, so a local stand-in lock is used
    // while replaying transactions.
    let recovery_snapshot_lock = RwLock::new(());
    txn::run_transactions(&recovery_snapshot_lock, path_prefix1, path_prefix2, path)?;

    fsutil::remove_all(&path.join(TXN_DIR_NAME))?;
    fsutil::remove_all(&path.join(TMP_DIR_NAME))?;
    create_partition_dirs(path)?;

    let mut pws: Vec<Arc<PartWrapper>> = Vec::new();
    let entries = fs::read_dir(path).map_err(|e| crate::error::io_with_path(path, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| crate::error::io_with_path(path, e))?;
        let file_type = entry
            .file_type()
            .map_err(|e| crate::error::io_with_path(entry.path(), e))?;
        if !fsutil::is_dir_or_symlink(&file_type) {
            continue;
        }
        let name = entry.file_name();
        if name == TMP_DIR_NAME || name == TXN_DIR_NAME || name == SNAPSHOTS_DIR_NAME {
            continue;
        }

        let part_path = entry.path();
        let start_time = Instant::now();
        let part = match Part::open_file_part(&part_path) {
            Ok(part) => part,
            Err(e) => {
                must_close_parts(pws);
                return Err(e);
            }
        };
        info!(
            "opened part {:?} in {:.3}s",
            part_path,
            start_time.elapsed().as_secs_f64()
        );
        pws.push(PartWrapper::new_file(
            part,
            Arc::clone(&env.inmemory_part_pool),
        ));
    }

    Ok(pws)
}

fn must_close_parts(pws: Vec<Arc<PartWrapper>>) {
    for pw in &pws {
        let ref_count = pw.ref_count.load(Ordering::SeqCst);
        if ref_count != 1 {
            panic!("BUG: unexpected ref count {ref_count} when closing a freshly opened part; want 1");
        }
        pw.dec_ref();
    }
}
