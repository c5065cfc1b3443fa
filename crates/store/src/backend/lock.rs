//! Advisory locking of table files.
//!
//! Writers take an exclusive lock and readers a shared lock on the main table
//! file, through a dedicated handle so the lock lives exactly as long as the
//! [`FileLock`]. Uses OS-level locking (`flock` on Unix, `LockFileEx` on
//! Windows), which the OS releases even if the process crashes.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use tracing::{debug, error};

use crate::error::{Error, IoOp, Result};

/// Requested lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Many holders, used by reader handles.
    Shared,
    /// Single holder, used by writer handles.
    Exclusive,
}

/// A held advisory lock on a table file, released on drop.
pub struct FileLock {
    file: File,
    path: PathBuf,
    kind: LockKind,
}

impl FileLock {
    /// Acquires a lock on `path`, which must exist.
    ///
    /// With `blocking` set the call waits for conflicting holders to go away;
    /// otherwise it fails immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] with [`IoOp::Lock`] if the lock is held elsewhere
    /// (non-blocking) or cannot be taken, and [`IoOp::Open`] if the file
    /// cannot be opened.
    pub fn acquire(path: impl AsRef<Path>, kind: LockKind, blocking: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Io { op: IoOp::Open, source })?;

        let result = match (kind, blocking) {
            (LockKind::Shared, true) => FileExt::lock_shared(&file),
            (LockKind::Shared, false) => FileExt::try_lock_shared(&file),
            (LockKind::Exclusive, true) => FileExt::lock_exclusive(&file),
            (LockKind::Exclusive, false) => FileExt::try_lock_exclusive(&file),
        };

        match result {
            Ok(()) => {
                debug!(path = %path.display(), kind = ?kind, "Acquired table file lock");
                Ok(Self { file, path: path.to_path_buf(), kind })
            },
            Err(e) => {
                if is_contended(&e) {
                    debug!(path = %path.display(), kind = ?kind, "Table file is locked elsewhere");
                } else {
                    error!(path = %path.display(), error = %e, "Failed to lock table file");
                }
                Err(Error::Io { op: IoOp::Lock, source: e })
            },
        }
    }

    /// Returns the lock strength.
    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

fn is_contended(e: &io::Error) -> bool {
    // EWOULDBLOCK/EAGAIN is 11 on Linux and 35 on macOS.
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == Some(11)
        || e.raw_os_error() == Some(35)
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            error!(path = %self.path.display(), error = %e, "Failed to release table file lock");
        } else {
            debug!(path = %self.path.display(), "Released table file lock");
        }
    }
}
