//! On-disk transactions for atomic part replacement.
//!
//! Every merge commits through a plain-text transaction file: absolute
//! paths of the retired parts to remove, then a terminal
//! `"<src> -> <dst>"` line installing the merge output (an empty `dst`
//! discards it). Files are named by merge index in 16-digit hex, so a
//! lexical sort replays them chronologically on open.

use crate::error::io_with_path;
use crate::fsutil;
use crate::{Result, TslabError};
use parking_lot::RwLock;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub(crate) const TXN_DIR_NAME: &str = "txn";

/// Replays every pending transaction under `<dir>/txn` in chronological
/// order. Used on partition open before the part directories are scanned.
pub(crate) fn run_transactions(
    snapshot_lock: &RwLock<()>,
    path_prefix1: &Path,
    path_prefix2: &Path,
    dir: &Path,
) -> Result<()> {
    let txn_dir = dir.join(TXN_DIR_NAME);
    let entries = match fs::read_dir(&txn_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_with_path(&txn_dir, e)),
    };

    let mut txn_paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_with_path(&txn_dir, e))?;
        txn_paths.push(entry.path());
    }
    txn_paths.sort();

    for txn_path in txn_paths {
        run_transaction(snapshot_lock, path_prefix1, path_prefix2, &txn_path)?;
    }
    Ok(())
}

/// Applies a single transaction file and deletes it. Runs under the
/// snapshot lock in read mode so concurrent appliers proceed in parallel
/// while snapshot creation is excluded.
pub(crate) fn run_transaction(
    snapshot_lock: &RwLock<()>,
    path_prefix1: &Path,
    path_prefix2: &Path,
    txn_path: &Path,
) -> Result<()> {
    let _guard = snapshot_lock.read();

    let data = fs::read_to_string(txn_path).map_err(|e| io_with_path(txn_path, e))?;
    let data = data.strip_suffix('\n').unwrap_or(&data);
    if data.is_empty() {
        return Err(TslabError::InvalidTransaction {
            path: txn_path.to_path_buf(),
            reason: "empty transaction".to_string(),
        });
    }

    let lines: Vec<&str> = data.split('\n').collect();
    let (last, rm_lines) = lines.split_last().expect("split on non-empty data");
    let (src, dst) = last.split_once(" -> ").ok_or_else(|| TslabError::InvalidTransaction {
        path: txn_path.to_path_buf(),
        reason: format!("invalid last line {last:?}; must contain `srcPath -> dstPath`"),
    })?;

    // Remove the retired parts. Missing paths were already removed by a
    // previous partial apply.
    for rm_line in rm_lines {
        let rm_path = validate_path(path_prefix1, path_prefix2, Path::new(rm_line))?;
        fsutil::remove_all(&rm_path)?;
    }

    let src_path = validate_path(path_prefix1, path_prefix2, Path::new(src))?;
    if dst.is_empty() {
        fsutil::remove_all(&src_path)?;
    } else {
        let dst_path = validate_path(path_prefix1, path_prefix2, Path::new(dst))?;
        if fsutil::is_path_exist(&src_path) {
            fs::rename(&src_path, &dst_path).map_err(|e| io_with_path(&dst_path, e))?;
        } else if !fsutil::is_path_exist(&dst_path) {
            return Err(TslabError::InvalidTransaction {
                path: txn_path.to_path_buf(),
                reason: format!(
                    "cannot find both source and destination paths: {src:?} -> {dst:?}"
                ),
            });
        }
    }

    fsutil::sync_path(path_prefix1)?;
    fsutil::sync_path(path_prefix2)?;

    fs::remove_file(txn_path).map_err(|e| io_with_path(txn_path, e))
}

/// Resolves `path` to an absolute path and verifies it lies strictly
/// inside one of the two tier roots.
fn validate_path(path_prefix1: &Path, path_prefix2: &Path, path: &Path) -> Result<PathBuf> {
    let prefix1 = std::path::absolute(path_prefix1).map_err(|e| io_with_path(path_prefix1, e))?;
    let prefix2 = std::path::absolute(path_prefix2).map_err(|e| io_with_path(path_prefix2, e))?;
    let path = std::path::absolute(path).map_err(|e| io_with_path(path, e))?;

    let inside1 = path.starts_with(&prefix1) && path != prefix1;
    let inside2 = path.starts_with(&prefix2) && path != prefix2;
    if !inside1 && !inside2 {
        return Err(TslabError::PathOutsidePartition { path });
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_roots(dir: &TempDir) -> (PathBuf, PathBuf) {
        let small = dir.path().join("small").join("2023_07");
        let big = dir.path().join("big").join("2023_07");
        fs::create_dir_all(small.join(TXN_DIR_NAME)).unwrap();
        fs::create_dir_all(big.join(TXN_DIR_NAME)).unwrap();
        (small, big)
    }

    fn write_txn(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(TXN_DIR_NAME).join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn applies_removes_and_rename() {
        let tmp = TempDir::new().unwrap();
        let (small, big) = setup_roots(&tmp);
        let lock = RwLock::new(());

        let old_part = small.join("old_part");
        fs::create_dir(&old_part).unwrap();
        let src = small.join("tmp_part");
        fs::create_dir(&src).unwrap();
        let dst = small.join("new_part");

        let txn = write_txn(
            &small,
            "0000000000000001",
            &format!("{}\n{} -> {}\n", old_part.display(), src.display(), dst.display()),
        );
        run_transaction(&lock, &small, &big, &txn).unwrap();

        assert!(!old_part.exists());
        assert!(!src.exists());
        assert!(dst.exists());
        assert!(!txn.exists());
    }

    #[test]
    fn replays_partially_applied_rename() {
        let tmp = TempDir::new().unwrap();
        let (small, big) = setup_roots(&tmp);
        let lock = RwLock::new(());

        // The rename already happened before the crash: src is gone, dst
        // exists. Replay must verify and succeed.
        let src = small.join("tmp_part");
        let dst = small.join("new_part");
        fs::create_dir(&dst).unwrap();

        let txn = write_txn(
            &small,
            "0000000000000001",
            &format!("{} -> {}\n", src.display(), dst.display()),
        );
        run_transaction(&lock, &small, &big, &txn).unwrap();
        assert!(dst.exists());
        assert!(!txn.exists());
    }

    #[test]
    fn missing_source_and_destination_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let (small, big) = setup_roots(&tmp);
        let lock = RwLock::new(());

        let txn = write_txn(
            &small,
            "0000000000000001",
            &format!(
                "{} -> {}\n",
                small.join("gone").display(),
                small.join("also_gone").display()
            ),
        );
        let err = run_transaction(&lock, &small, &big, &txn).unwrap_err();
        assert!(matches!(err, TslabError::InvalidTransaction { .. }));
        // A failed transaction file stays in place.
        assert!(txn.exists());
    }

    #[test]
    fn empty_destination_discards_source() {
        let tmp = TempDir::new().unwrap();
        let (small, big) = setup_roots(&tmp);
        let lock = RwLock::new(());

        let src = small.join("tmp_part");
        fs::create_dir(&src).unwrap();

        let txn = write_txn(
            &small,
            "0000000000000001",
            &format!("{} -> \n", src.display()),
        );
        run_transaction(&lock, &small, &big, &txn).unwrap();
        assert!(!src.exists());
    }

    #[test]
    fn rejects_paths_outside_the_roots() {
        let tmp = TempDir::new().unwrap();
        let (small, big) = setup_roots(&tmp);
        let lock = RwLock::new(());

        let outside = tmp.path().join("elsewhere");
        fs::create_dir(&outside).unwrap();
        let txn = write_txn(
            &small,
            "0000000000000001",
            &format!("{}\n{} -> \n", outside.display(), small.join("x").display()),
        );
        let err = run_transaction(&lock, &small, &big, &txn).unwrap_err();
        assert!(matches!(err, TslabError::PathOutsidePartition { .. }));
        assert!(outside.exists());

        // The tier root itself is not a valid target either.
        let txn = write_txn(
            &small,
            "0000000000000002",
            &format!("{} -> \n", small.display()),
        );
        let err = run_transaction(&lock, &small, &big, &txn).unwrap_err();
        assert!(matches!(err, TslabError::PathOutsidePartition { .. }));
    }

    #[test]
    fn runs_transactions_in_chronological_order() {
        let tmp = TempDir::new().unwrap();
        let (small, big) = setup_roots(&tmp);
        let lock = RwLock::new(());

        // txn 1 installs a part; txn 2 retires it again.
        let src1 = small.join("tmp_a");
        fs::create_dir(&src1).unwrap();
        let installed = small.join("part_a");
        write_txn(
            &small,
            "0000000000000001",
            &format!("{} -> {}\n", src1.display(), installed.display()),
        );
        write_txn(
            &small,
            "0000000000000002",
            &format!(
                "{}\n{} -> \n",
                installed.display(),
                small.join("tmp_b").display()
            ),
        );

        run_transactions(&lock, &small, &big, &small).unwrap();
        assert!(!installed.exists());
        assert!(fs::read_dir(small.join(TXN_DIR_NAME)).unwrap().next().is_none());
    }
}
