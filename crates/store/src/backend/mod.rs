//! Storage backend abstraction for the table engine.
//!
//! Backends are byte-addressed: the record store lays out variable-sized
//! blocks and the index files lay out fixed-size pages on top of the same
//! trait. Two implementations exist:
//!
//! - [`FileBackend`]: positional reads/writes on a file, with an optional
//!   read-only memory-mapped window over the leading bytes.
//! - [`InMemoryBackend`]: a growable buffer for tests.
//!
//! [`Journal`] wraps a data backend together with a log backend and records
//! before-images so that a unit of work can be rolled back.

mod file;
mod journal;
mod lock;
mod memory;

pub use file::FileBackend;
pub use journal::{Journal, JournalState, Savepoint};
pub use lock::{FileLock, LockKind};
pub use memory::InMemoryBackend;

use crate::error::Result;

/// Storage backend trait for abstracting file I/O.
pub trait StorageBackend: Send + Sync {
    /// Reads `buf.len()` bytes at `offset`.
    ///
    /// Bytes beyond the end of the storage read as zero.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` at `offset`, extending the storage if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flushes all writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn sync(&self) -> Result<()>;

    /// Returns the current length in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the length cannot be determined.
    fn len(&self) -> Result<u64>;

    /// Truncates or extends the storage to exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the length cannot be changed.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Reads `len` bytes at `offset` into a new buffer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Returns true if the storage holds no bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the length cannot be determined.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn exercise(backend: &dyn StorageBackend) {
        assert!(backend.is_empty().unwrap());
        backend.write_at(10, b"hello").unwrap();
        assert_eq!(backend.len().unwrap(), 15);
        assert_eq!(backend.read_vec(10, 5).unwrap(), b"hello");
        // Gap before the first write reads as zeros, as does the region past the end.
        assert_eq!(backend.read_vec(0, 10).unwrap(), vec![0u8; 10]);
        assert_eq!(backend.read_vec(12, 8).unwrap(), b"llo\0\0\0\0\0");

        backend.set_len(12).unwrap();
        assert_eq!(backend.len().unwrap(), 12);
        assert_eq!(backend.read_vec(10, 4).unwrap(), b"he\0\0");
        backend.sync().unwrap();
    }

    #[test]
    fn memory_backend_contract() {
        exercise(&InMemoryBackend::new());
    }

    #[test]
    fn file_backend_contract() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path().join("contract.tbl"), 0).unwrap();
        exercise(&backend);
    }

    #[test]
    fn mapped_file_backend_contract() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path().join("mapped.tbl"), 1 << 20).unwrap();
        exercise(&backend);
    }
}
