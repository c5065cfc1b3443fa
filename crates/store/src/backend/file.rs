//! File-based storage backend.
//!
//! Uses position-based I/O (`pread`/`pwrite` on Unix, `seek_read`/`seek_write`
//! on Windows) so concurrent readers never contend on a shared cursor. Writes
//! are serialized through `write_lock`.
//!
//! When a mapping limit is configured, the leading `min(limit, len)` bytes of
//! the file are also mapped read-only and reads that fall entirely inside the
//! window are served from memory. The window is refreshed as the file grows
//! and is always dropped before the file is truncated.

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, RwLock};
use snafu::ResultExt;

use super::StorageBackend;
use crate::error::{IoOp, IoSnafu, Result};

/// Growth past the mapped window that triggers a remap.
const REMAP_STEP: u64 = 1 << 20;

/// File-based storage backend.
pub struct FileBackend {
    file: File,
    path: PathBuf,
    /// Serializes writes and length changes.
    write_lock: Mutex<()>,
    /// Cached file length; this handle is the only writer of the file.
    len: AtomicU64,
    /// Read-only window over the head of the file.
    map: RwLock<Option<Mmap>>,
    /// Upper bound on the window size; 0 disables mapping.
    map_limit: u64,
}

impl FileBackend {
    /// Opens an existing file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be opened
    /// or mapped.
    pub fn open(path: impl AsRef<Path>, writable: bool, map_limit: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path.as_ref())
            .context(IoSnafu { op: IoOp::Open })?;
        Self::from_file(file, path.as_ref(), map_limit)
    }

    /// Creates a new empty file, truncating any existing one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be created.
    pub fn create(path: impl AsRef<Path>, map_limit: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .context(IoSnafu { op: IoOp::Open })?;
        Self::from_file(file, path.as_ref(), map_limit)
    }

    /// Opens a file for writing, creating it empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be opened.
    pub fn open_or_create(path: impl AsRef<Path>, map_limit: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())
            .context(IoSnafu { op: IoOp::Open })?;
        Self::from_file(file, path.as_ref(), map_limit)
    }

    fn from_file(file: File, path: &Path, map_limit: u64) -> Result<Self> {
        let len = file.metadata().context(IoSnafu { op: IoOp::Stat })?.len();
        let backend = Self {
            file,
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
            len: AtomicU64::new(len),
            map: RwLock::new(None),
            map_limit,
        };
        *backend.map.write() = backend.create_map(len)?;
        Ok(backend)
    }

    /// Returns the path this backend was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of bytes currently served from the mapping.
    pub fn mapped_len(&self) -> u64 {
        self.map.read().as_ref().map_or(0, |map| map.len() as u64)
    }

    fn create_map(&self, file_len: u64) -> Result<Option<Mmap>> {
        let window = file_len.min(self.map_limit);
        if window == 0 {
            return Ok(None);
        }
        map_window(&self.file, window as usize).map(Some).context(IoSnafu { op: IoOp::Mmap })
    }

    /// Refreshes the window after growth. Caller holds `write_lock`.
    fn grow_map(&self, new_len: u64) -> Result<()> {
        if self.map_limit == 0 {
            return Ok(());
        }
        let mapped = self.mapped_len();
        if mapped >= self.map_limit {
            return Ok(());
        }
        if mapped > 0 && new_len < mapped + REMAP_STEP.min(self.map_limit - mapped) {
            return Ok(());
        }
        let mut map = self.map.write();
        *map = None;
        *map = self.create_map(new_len)?;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        {
            let map = self.map.read();
            if let Some(map) = map.as_ref() {
                let end = offset + buf.len() as u64;
                if end <= map.len() as u64 {
                    buf.copy_from_slice(&map[offset as usize..end as usize]);
                    return Ok(());
                }
            }
        }

        let read = read_at_offset(&self.file, buf, offset).context(IoSnafu { op: IoOp::Read })?;
        buf[read..].fill(0);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        write_all_at_offset(&self.file, data, offset).context(IoSnafu { op: IoOp::Write })?;
        let end = offset + data.len() as u64;
        if end > self.len.load(Ordering::Acquire) {
            self.len.store(end, Ordering::Release);
            self.grow_map(end)?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data().context(IoSnafu { op: IoOp::Sync })
    }

    fn len(&self) -> Result<u64> {
        Ok(self.len.load(Ordering::Acquire))
    }

    fn set_len(&self, len: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut map = self.map.write();
        // The window must never cover bytes past the end of the file.
        *map = None;
        self.file.set_len(len).context(IoSnafu { op: IoOp::Truncate })?;
        self.len.store(len, Ordering::Release);
        *map = self.create_map(len)?;
        Ok(())
    }
}

#[allow(unsafe_code)]
fn map_window(file: &File, len: usize) -> io::Result<Mmap> {
    // SAFETY: the mapping is read-only and never outlives `file`. Every
    // length change of the file goes through `FileBackend::set_len`, which
    // drops the mapping under the map write lock before truncating, so no
    // reader can observe pages past the end of the file. Other processes are
    // excluded from writing by the table's advisory lock.
    unsafe { MmapOptions::new().len(len).map(file) }
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

/// Reads into `buf` at `offset` until it is full or the file ends.
///
/// Returns the number of bytes read.
#[cfg(unix)]
fn read_at_offset(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        match file.read_at(&mut buf[pos..], offset + pos as u64) {
            Ok(0) => break,
            Ok(n) => pos += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(pos)
}

/// Windows fallback: `seek_read` updates the file cursor, which is harmless
/// because every access passes an explicit offset.
#[cfg(windows)]
fn read_at_offset(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        match file.seek_read(&mut buf[pos..], offset + pos as u64) {
            Ok(0) => break,
            Ok(n) => pos += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(pos)
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "seek_write wrote nothing"));
        }
        pos += n;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::{sync::Arc, thread};

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.tbl");
        {
            let backend = FileBackend::create(&path, 0).unwrap();
            backend.write_at(0, b"tabula").unwrap();
            backend.sync().unwrap();
        }
        let backend = FileBackend::open(&path, false, 0).unwrap();
        assert_eq!(backend.len().unwrap(), 6);
        assert_eq!(backend.read_vec(0, 6).unwrap(), b"tabula");
        assert_eq!(backend.path(), path.as_path());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempdir().unwrap();
        let err = FileBackend::open(dir.path().join("missing"), true, 0).err().unwrap();
        assert_eq!(err.code(), crate::ErrorCode::NoFile);
    }

    #[test]
    fn test_open_or_create_keeps_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.tbl");
        FileBackend::open_or_create(&path, 0).unwrap().write_at(4, b"abc").unwrap();
        let backend = FileBackend::open_or_create(&path, 0).unwrap();
        assert_eq!(backend.read_vec(4, 3).unwrap(), b"abc");
    }

    #[test]
    fn test_mapped_window_tracks_growth_and_truncation() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path().join("mapped.tbl"), 4 * REMAP_STEP).unwrap();
        assert_eq!(backend.mapped_len(), 0);

        let chunk = vec![7u8; REMAP_STEP as usize];
        backend.write_at(0, &chunk).unwrap();
        assert_eq!(backend.mapped_len(), REMAP_STEP);
        backend.write_at(REMAP_STEP, &chunk).unwrap();
        backend.write_at(2 * REMAP_STEP, &chunk).unwrap();
        assert_eq!(backend.mapped_len(), 3 * REMAP_STEP);

        // Writes after mapping are visible through the window.
        backend.write_at(100, b"fresh").unwrap();
        assert_eq!(backend.read_vec(100, 5).unwrap(), b"fresh");

        backend.set_len(10).unwrap();
        assert_eq!(backend.mapped_len(), 10);
        assert_eq!(backend.read_vec(8, 4).unwrap(), vec![7, 7, 0, 0]);
    }

    #[test]
    fn test_mapping_is_capped_by_limit() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path().join("capped.tbl"), 4096).unwrap();
        backend.write_at(0, &vec![1u8; 3 * REMAP_STEP as usize]).unwrap();
        assert_eq!(backend.mapped_len(), 4096);
        assert_eq!(backend.read_vec(4090, 10).unwrap(), vec![1u8; 10]);
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::create(dir.path().join("conc.tbl"), 1 << 16).unwrap());
        for i in 0..64u64 {
            backend.write_at(i * 64, &[i as u8; 64]).unwrap();
        }

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let backend = Arc::clone(&backend);
            handles.push(thread::spawn(move || {
                for round in 0..200u64 {
                    let slot = (t * 16 + round) % 64;
                    let data = backend.read_vec(slot * 64, 64).unwrap();
                    assert!(data.iter().all(|&b| b == slot as u8));
                }
            }));
        }
        let writer = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                for i in 64..256u64 {
                    backend.write_at(i * 64, &[i as u8; 64]).unwrap();
                }
            })
        };
        for handle in handles {
            handle.join().unwrap();
        }
        writer.join().unwrap();
        assert_eq!(backend.len().unwrap(), 256 * 64);
    }
}
