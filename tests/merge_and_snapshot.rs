use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;
use tslab::bstream::BlockStreamReader;
use tslab::{
    DeletedMetricIdsFn, Partition, PartitionEnv, PartitionMetrics, RawRow, create_partition,
    open_partition, partition_name_from_timestamp,
};

// 2023-07-01T00:00:00Z
const JUL_2023: i64 = 1_688_169_600_000;

fn no_deleted_ids() -> DeletedMetricIdsFn {
    Arc::new(|| HashSet::new())
}

fn test_env() -> Arc<PartitionEnv> {
    Arc::new(PartitionEnv::with_limits(10_000, 1))
}

fn row(ts_offset: i64, metric_id: u64, value: f64) -> RawRow {
    RawRow::new(JUL_2023 + ts_offset, metric_id, value)
}

fn metrics_of(pt: &Partition) -> PartitionMetrics {
    let mut m = PartitionMetrics::default();
    pt.update_metrics(&mut m);
    m
}

fn read_all_rows(pt: &Partition) -> Vec<RawRow> {
    let mut pws = Vec::new();
    pt.get_parts(&mut pws);
    let mut rows = Vec::new();
    for pw in &pws {
        let mut bsr = match pw.mem_part() {
            Some(mp) => BlockStreamReader::init_from_inmemory(mp),
            None => BlockStreamReader::init_from_file_part(pw.part_path().unwrap()).unwrap(),
        };
        while let Some(block) = bsr.next_block().unwrap() {
            rows.extend(block.rows);
        }
    }
    pt.put_parts(&pws);
    rows
}

/// Installed part directories of a tier root, ignoring service dirs.
fn part_dirs(root: &Path) -> Vec<std::path::PathBuf> {
    fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| {
            let name = e.file_name();
            e.path().is_dir() && name != "tmp" && name != "txn"
        })
        .map(|e| e.path())
        .collect()
}

#[test]
fn tombstoned_metrics_vanish_after_merge() {
    let dir = TempDir::new().unwrap();
    let deleted: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
    let deleted_for_cb = Arc::clone(&deleted);
    let dmis: DeletedMetricIdsFn = Arc::new(move || deleted_for_cb.lock().clone());

    let pt = create_partition(
        JUL_2023,
        &dir.path().join("small"),
        &dir.path().join("big"),
        dmis,
        test_env(),
    )
    .unwrap();

    deleted.lock().insert(7);

    let mut rows: Vec<RawRow> = (0..100).map(|i| row(i, 7, 1.0)).collect();
    rows.extend((0..50).map(|i| row(i, 8, 2.0)));
    pt.add_rows(&rows);

    // Closing force-flushes through a merge, which applies the tombstones.
    pt.close().unwrap();

    let m = metrics_of(&pt);
    assert_eq!(m.small_rows_deleted, 100);

    let name = partition_name_from_timestamp(JUL_2023);
    let reopened = open_partition(
        &dir.path().join("small").join(&name),
        &dir.path().join("big").join(&name),
        no_deleted_ids(),
        test_env(),
    )
    .unwrap();

    let got = read_all_rows(&reopened);
    assert_eq!(got.len(), 50);
    assert!(got.iter().all(|r| r.metric_id == 8));
    reopened.close().unwrap();
}

#[test]
fn fully_tombstoned_partition_produces_no_parts() {
    let dir = TempDir::new().unwrap();
    let deleted: HashSet<u64> = [7].into_iter().collect();
    let dmis: DeletedMetricIdsFn = Arc::new(move || deleted.clone());

    let pt = create_partition(
        JUL_2023,
        &dir.path().join("small"),
        &dir.path().join("big"),
        dmis,
        test_env(),
    )
    .unwrap();

    pt.add_rows(&(0..40).map(|i| row(i, 7, 1.0)).collect::<Vec<_>>());
    pt.close().unwrap();

    assert!(part_dirs(pt.small_parts_path()).is_empty());
    assert!(part_dirs(pt.big_parts_path()).is_empty());
}

#[test]
fn snapshot_is_immune_to_later_writes_and_merges() {
    let dir = TempDir::new().unwrap();
    let small_root = dir.path().join("small");
    let big_root = dir.path().join("big");
    let pt = create_partition(JUL_2023, &small_root, &big_root, no_deleted_ids(), test_env())
        .unwrap();

    pt.add_rows(&(0..300).map(|i| row(i, 1, 1.0)).collect::<Vec<_>>());

    let name = partition_name_from_timestamp(JUL_2023);
    let snap_small = dir.path().join("snap-small").join(&name);
    let snap_big = dir.path().join("snap-big").join(&name);
    pt.create_snapshot_at(&snap_small, &snap_big).unwrap();

    // Writes and merges after the snapshot must not leak into it.
    pt.add_rows(&(0..100).map(|i| row(i, 2, 2.0)).collect::<Vec<_>>());
    pt.close().unwrap();

    let snapshot = open_partition(&snap_small, &snap_big, no_deleted_ids(), test_env()).unwrap();
    let got = read_all_rows(&snapshot);
    assert_eq!(got.len(), 300);
    assert!(got.iter().all(|r| r.metric_id == 1));
    snapshot.close().unwrap();

    let source = open_partition(
        &small_root.join(&name),
        &big_root.join(&name),
        no_deleted_ids(),
        test_env(),
    )
    .unwrap();
    assert_eq!(read_all_rows(&source).len(), 400);
    source.close().unwrap();
}

#[test]
fn snapshot_destination_must_not_exist() {
    let dir = TempDir::new().unwrap();
    let pt = create_partition(
        JUL_2023,
        &dir.path().join("small"),
        &dir.path().join("big"),
        no_deleted_ids(),
        test_env(),
    )
    .unwrap();

    let snap_small = dir.path().join("snap-small").join("2023_07");
    let snap_big = dir.path().join("snap-big").join("2023_07");
    fs::create_dir_all(&snap_small).unwrap();
    assert!(pt.create_snapshot_at(&snap_small, &snap_big).is_err());
    pt.close().unwrap();
}

#[test]
fn pending_transaction_replays_on_open() {
    let dir = TempDir::new().unwrap();
    let small_root = dir.path().join("small");
    let big_root = dir.path().join("big");
    let pt = create_partition(JUL_2023, &small_root, &big_root, no_deleted_ids(), test_env())
        .unwrap();
    pt.add_rows(&(0..120).map(|i| row(i, 3, 1.0)).collect::<Vec<_>>());
    pt.close().unwrap();

    let name = partition_name_from_timestamp(JUL_2023);
    let small = small_root.join(&name);

    // Simulate a crash between writing the transaction file and applying
    // it: the merge output sits in tmp/, a stale input part lingers, and
    // txn/ still holds the journal entry.
    let installed = part_dirs(&small);
    assert!(!installed.is_empty());
    let part_dir = &installed[0];
    let tmp_path = small.join("tmp").join("00000000000000AB");
    fs::rename(part_dir, &tmp_path).unwrap();

    let stale = small.join("stale_part");
    fs::create_dir(&stale).unwrap();

    let txn_body = format!(
        "{}\n{} -> {}\n",
        stale.display(),
        tmp_path.display(),
        part_dir.display()
    );
    fs::write(small.join("txn").join("00000000000000AB"), txn_body).unwrap();

    let reopened = open_partition(
        &small,
        &big_root.join(&name),
        no_deleted_ids(),
        test_env(),
    )
    .unwrap();

    // The transaction completed: stale input gone, output installed,
    // service directories reset.
    assert!(!stale.exists());
    assert!(part_dir.exists());
    assert!(fs::read_dir(small.join("txn")).unwrap().next().is_none());
    assert!(fs::read_dir(small.join("tmp")).unwrap().next().is_none());

    assert_eq!(read_all_rows(&reopened).len(), 120);
    reopened.close().unwrap();
}
