//! Filesystem helpers shared by the partition engine.

use crate::error::io_with_path;
use crate::{Result, TslabError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Creates the directory together with missing parents, failing if the
/// final component already exists.
pub fn mkdir_all_fail_if_exist(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(io_with_path(
            path,
            io::Error::new(io::ErrorKind::AlreadyExists, "directory already exists"),
        ));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_with_path(parent, e))?;
    }
    fs::create_dir(path).map_err(|e| io_with_path(path, e))
}

/// Fsyncs the file or directory metadata at the given path.
pub fn sync_path(path: &Path) -> Result<()> {
    let f = File::open(path).map_err(|e| io_with_path(path, e))?;
    f.sync_all().map_err(|e| io_with_path(path, e))
}

/// Atomically creates a new file with the given contents: the file must not
/// exist, the data is fsynced, and so is the parent directory.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| io_with_path(path, e))?;
    f.write_all(data).map_err(|e| io_with_path(path, e))?;
    f.sync_all().map_err(|e| io_with_path(path, e))?;
    if let Some(parent) = path.parent() {
        sync_path(parent)?;
    }
    Ok(())
}

/// Creates `dst_dir` and hard-links every regular file from `src_dir` into
/// it. Part directories are flat, so no recursion is needed.
pub fn hard_link_files(src_dir: &Path, dst_dir: &Path) -> Result<()> {
    mkdir_all_fail_if_exist(dst_dir)?;
    for entry in fs::read_dir(src_dir).map_err(|e| io_with_path(src_dir, e))? {
        let entry = entry.map_err(|e| io_with_path(src_dir, e))?;
        let file_type = entry.file_type().map_err(|e| io_with_path(entry.path(), e))?;
        if !file_type.is_file() {
            continue;
        }
        let dst = dst_dir.join(entry.file_name());
        fs::hard_link(entry.path(), &dst).map_err(|e| io_with_path(dst, e))?;
    }
    Ok(())
}

/// True if the path exists (file or directory).
pub fn is_path_exist(path: &Path) -> bool {
    path.exists()
}

/// True for directories and symlinks, the only entries a tier root may
/// legitimately contain besides loose files left by other tools.
pub fn is_dir_or_symlink(file_type: &fs::FileType) -> bool {
    file_type.is_dir() || file_type.is_symlink()
}

/// Removes the file or directory tree at the path. A missing path is not
/// an error.
pub fn remove_all(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_with_path(path, e)),
    };
    let res = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_with_path(path, e)),
    }
}

/// Hints the kernel that the file's pages won't be reused, keeping large
/// one-shot merge outputs from evicting the hot part cache.
#[cfg(target_os = "linux")]
pub fn advise_no_cache(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn advise_no_cache(_file: &File) {}

/// Free-disk-space lookups with a 1 s TTL, shared process-wide so that
/// concurrent big-tier mergers don't hammer statvfs.
pub struct DiskSpaceCache {
    entries: Mutex<HashMap<PathBuf, FreeSpaceEntry>>,
}

struct FreeSpaceEntry {
    update_time: Instant,
    free_space: u64,
}

const FREE_SPACE_TTL: Duration = Duration::from_secs(1);

impl DiskSpaceCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the free space in bytes on the filesystem holding `path`.
    pub fn free_space(&self, path: &Path) -> Result<u64> {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.get(path)
            && e.update_time.elapsed() < FREE_SPACE_TTL
        {
            return Ok(e.free_space);
        }

        let free_space = statvfs_free_space(path).map_err(|e| TslabError::FreeDiskSpace {
            path: path.to_path_buf(),
            source: e,
        })?;
        entries.insert(
            path.to_path_buf(),
            FreeSpaceEntry {
                update_time: Instant::now(),
                free_space,
            },
        );
        Ok(free_space)
    }
}

impl Default for DiskSpaceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn statvfs_free_space(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn statvfs_free_space(_path: &Path) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "free disk space probing is only supported on unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_file_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txn");
        write_file(&path, b"a -> b\n").unwrap();
        assert!(write_file(&path, b"other\n").is_err());
        assert_eq!(fs::read(&path).unwrap(), b"a -> b\n");
    }

    #[test]
    fn mkdir_fails_on_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b");
        mkdir_all_fail_if_exist(&path).unwrap();
        assert!(mkdir_all_fail_if_exist(&path).is_err());
    }

    #[test]
    fn remove_all_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        remove_all(&dir.path().join("nope")).unwrap();

        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        remove_all(&file).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn hard_links_share_inodes() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("data"), b"payload").unwrap();

        let dst = dir.path().join("dst");
        hard_link_files(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("data")).unwrap(), b"payload");

        // Removing the source must not affect the link.
        fs::remove_dir_all(&src).unwrap();
        assert_eq!(fs::read(dst.join("data")).unwrap(), b"payload");
    }

    #[test]
    fn free_space_is_cached() {
        let cache = DiskSpaceCache::new();
        let dir = TempDir::new().unwrap();
        let first = cache.free_space(dir.path()).unwrap();
        let second = cache.free_space(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
