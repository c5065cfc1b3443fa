//! Error types for the tabula storage engine.
//!
//! Every fallible operation returns [`Result`]. Each [`Error`] maps onto a
//! stable numeric [`ErrorCode`] through [`Error::code`], which is what the
//! table handle records as its last error.

use std::{fmt, io};

use snafu::Snafu;

/// Page identifier type.
pub type PageId = u64;

/// Result type alias for tabula operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The file operation that failed at the I/O layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    /// Opening a file.
    Open,
    /// Closing a file.
    Close,
    /// Changing a file's length.
    Truncate,
    /// Flushing a file to stable storage.
    Sync,
    /// Reading file metadata.
    Stat,
    /// Positioning within a file.
    Seek,
    /// Reading file contents.
    Read,
    /// Writing file contents.
    Write,
    /// Creating or refreshing a memory mapping.
    Mmap,
    /// Acquiring or releasing an advisory lock.
    Lock,
    /// Removing a file.
    Unlink,
    /// Renaming a file.
    Rename,
    /// Creating a directory.
    Mkdir,
    /// Removing a directory.
    Rmdir,
}

impl IoOp {
    fn code(self) -> ErrorCode {
        match self {
            IoOp::Open => ErrorCode::Open,
            IoOp::Close => ErrorCode::Close,
            IoOp::Truncate => ErrorCode::Truncate,
            IoOp::Sync => ErrorCode::Sync,
            IoOp::Stat => ErrorCode::Stat,
            IoOp::Seek => ErrorCode::Seek,
            IoOp::Read => ErrorCode::Read,
            IoOp::Write => ErrorCode::Write,
            IoOp::Mmap => ErrorCode::Mmap,
            IoOp::Lock => ErrorCode::Lock,
            IoOp::Unlink => ErrorCode::Unlink,
            IoOp::Rename => ErrorCode::Rename,
            IoOp::Mkdir => ErrorCode::Mkdir,
            IoOp::Rmdir => ErrorCode::Rmdir,
        }
    }
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoOp::Open => "open",
            IoOp::Close => "close",
            IoOp::Truncate => "truncate",
            IoOp::Sync => "sync",
            IoOp::Stat => "stat",
            IoOp::Seek => "seek",
            IoOp::Read => "read",
            IoOp::Write => "write",
            IoOp::Mmap => "mmap",
            IoOp::Lock => "lock",
            IoOp::Unlink => "unlink",
            IoOp::Rename => "rename",
            IoOp::Mkdir => "mkdir",
            IoOp::Rmdir => "rmdir",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during tabula operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Operation is invalid for the current lock or transaction state.
    #[snafu(display("Threading error: {message}"))]
    Threading {
        /// What was attempted.
        message: String,
    },

    /// Invalid argument or operation.
    #[snafu(display("Invalid operation: {message}"))]
    InvalidOperation {
        /// Why the operation was rejected.
        message: String,
    },

    /// File header or catalog is malformed.
    #[snafu(display("Invalid metadata: {reason}"))]
    Metadata {
        /// Description of the problem.
        reason: String,
    },

    /// A record block has an unexpected magic byte or impossible sizes.
    #[snafu(display("Invalid record header at offset {offset}"))]
    RecordHeader {
        /// File offset of the block.
        offset: u64,
    },

    /// Index file structure is corrupted.
    #[snafu(display("Corrupted index: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Page checksum verification failed.
    #[snafu(display("Page {page_id} checksum mismatch"))]
    PageChecksumMismatch {
        /// The page whose checksum failed.
        page_id: PageId,
    },

    /// I/O error from the underlying storage.
    #[snafu(display("I/O error during {op}: {source}"))]
    Io {
        /// The failed operation.
        op: IoOp,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Keep-mode write found an existing record or index.
    #[snafu(display("Record already exists"))]
    RecordExists,

    /// No record (or index) with the given key.
    #[snafu(display("Record not found"))]
    RecordNotFound,

    /// Compression or decompression failed.
    #[snafu(display("Codec error: {reason}"))]
    Codec {
        /// Description of the failure.
        reason: String,
    },

    /// Page is full and cannot accept more data even after splitting.
    #[snafu(display("Page is full"))]
    PageFull,
}

impl Error {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Threading { .. } => ErrorCode::Threading,
            Error::InvalidOperation { .. } => ErrorCode::Invalid,
            Error::Metadata { .. }
            | Error::Corrupted { .. }
            | Error::PageChecksumMismatch { .. } => ErrorCode::Metadata,
            Error::RecordHeader { .. } => ErrorCode::RecordHeader,
            Error::Io { op, source } => match source.kind() {
                io::ErrorKind::NotFound => ErrorCode::NoFile,
                io::ErrorKind::PermissionDenied => ErrorCode::NoPermission,
                _ => op.code(),
            },
            Error::RecordExists => ErrorCode::Keep,
            Error::RecordNotFound => ErrorCode::NoRecord,
            Error::Codec { .. } | Error::PageFull => ErrorCode::Misc,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidOperation { message: message.into() }
    }

    pub(crate) fn threading(message: impl Into<String>) -> Self {
        Error::Threading { message: message.into() }
    }

    pub(crate) fn metadata(reason: impl Into<String>) -> Self {
        Error::Metadata { reason: reason.into() }
    }

    pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
        Error::Corrupted { reason: reason.into() }
    }
}

/// Numeric error codes recorded on a table handle.
///
/// Values are stable and match the classic table database codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// The last operation succeeded.
    Success = 0,
    /// Threading or transaction-state misuse.
    Threading = 1,
    /// Invalid argument or operation.
    Invalid = 2,
    /// File not found.
    NoFile = 3,
    /// Permission denied.
    NoPermission = 4,
    /// Invalid metadata.
    Metadata = 5,
    /// Invalid record header.
    RecordHeader = 6,
    /// Open failure.
    Open = 7,
    /// Close failure.
    Close = 8,
    /// Truncate failure.
    Truncate = 9,
    /// Sync failure.
    Sync = 10,
    /// Stat failure.
    Stat = 11,
    /// Seek failure.
    Seek = 12,
    /// Read failure.
    Read = 13,
    /// Write failure.
    Write = 14,
    /// Memory-map failure.
    Mmap = 15,
    /// Lock failure.
    Lock = 16,
    /// Unlink failure.
    Unlink = 17,
    /// Rename failure.
    Rename = 18,
    /// Mkdir failure.
    Mkdir = 19,
    /// Rmdir failure.
    Rmdir = 20,
    /// Record already exists.
    Keep = 21,
    /// No record found.
    NoRecord = 22,
    /// Miscellaneous error.
    Misc = 9999,
}

impl ErrorCode {
    /// Returns the numeric value of the code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Converts a numeric value back into a code. Unknown values map to [`ErrorCode::Misc`].
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => ErrorCode::Success,
            1 => ErrorCode::Threading,
            2 => ErrorCode::Invalid,
            3 => ErrorCode::NoFile,
            4 => ErrorCode::NoPermission,
            5 => ErrorCode::Metadata,
            6 => ErrorCode::RecordHeader,
            7 => ErrorCode::Open,
            8 => ErrorCode::Close,
            9 => ErrorCode::Truncate,
            10 => ErrorCode::Sync,
            11 => ErrorCode::Stat,
            12 => ErrorCode::Seek,
            13 => ErrorCode::Read,
            14 => ErrorCode::Write,
            15 => ErrorCode::Mmap,
            16 => ErrorCode::Lock,
            17 => ErrorCode::Unlink,
            18 => ErrorCode::Rename,
            19 => ErrorCode::Mkdir,
            20 => ErrorCode::Rmdir,
            21 => ErrorCode::Keep,
            22 => ErrorCode::NoRecord,
            _ => ErrorCode::Misc,
        }
    }

    /// Returns a short human-readable description.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::Threading => "threading error",
            ErrorCode::Invalid => "invalid operation",
            ErrorCode::NoFile => "file not found",
            ErrorCode::NoPermission => "no permission",
            ErrorCode::Metadata => "invalid meta data",
            ErrorCode::RecordHeader => "invalid record header",
            ErrorCode::Open => "open error",
            ErrorCode::Close => "close error",
            ErrorCode::Truncate => "trunc error",
            ErrorCode::Sync => "sync error",
            ErrorCode::Stat => "stat error",
            ErrorCode::Seek => "seek error",
            ErrorCode::Read => "read error",
            ErrorCode::Write => "write error",
            ErrorCode::Mmap => "mmap error",
            ErrorCode::Lock => "lock error",
            ErrorCode::Unlink => "unlink error",
            ErrorCode::Rename => "rename error",
            ErrorCode::Mkdir => "mkdir error",
            ErrorCode::Rmdir => "rmdir error",
            ErrorCode::Keep => "existing record",
            ErrorCode::NoRecord => "no record found",
            ErrorCode::Misc => "miscellaneous error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Page types in an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Free/unused page.
    Free = 0,
    /// B-tree branch (internal) node.
    BTreeBranch = 1,
    /// B-tree leaf node.
    BTreeLeaf = 2,
    /// Free list continuation page.
    FreeList = 4,
}

impl PageType {
    /// Decodes a page type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PageType::Free),
            1 => Some(PageType::BTreeBranch),
            2 => Some(PageType::BTreeLeaf),
            4 => Some(PageType::FreeList),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn io_error(op: IoOp, kind: io::ErrorKind) -> Error {
        Error::Io { op, source: io::Error::new(kind, "boom") }
    }

    #[test]
    fn io_errors_map_to_operation_codes() {
        assert_eq!(io_error(IoOp::Read, io::ErrorKind::Other).code(), ErrorCode::Read);
        assert_eq!(io_error(IoOp::Write, io::ErrorKind::Other).code(), ErrorCode::Write);
        assert_eq!(io_error(IoOp::Lock, io::ErrorKind::WouldBlock).code(), ErrorCode::Lock);
        assert_eq!(io_error(IoOp::Rename, io::ErrorKind::Other).code(), ErrorCode::Rename);
    }

    #[test]
    fn missing_file_and_permission_take_precedence() {
        assert_eq!(io_error(IoOp::Open, io::ErrorKind::NotFound).code(), ErrorCode::NoFile);
        assert_eq!(
            io_error(IoOp::Open, io::ErrorKind::PermissionDenied).code(),
            ErrorCode::NoPermission
        );
    }

    #[test]
    fn expected_outcomes_have_their_own_codes() {
        assert_eq!(Error::RecordExists.code(), ErrorCode::Keep);
        assert_eq!(Error::RecordNotFound.code(), ErrorCode::NoRecord);
        assert_eq!(Error::threading("busy").code(), ErrorCode::Threading);
        assert_eq!(Error::invalid("bad").code(), ErrorCode::Invalid);
    }

    #[test]
    fn codes_round_trip_through_integers() {
        for value in (0..=22).chain([9999]) {
            assert_eq!(ErrorCode::from_i32(value).as_i32(), value);
        }
        assert_eq!(ErrorCode::from_i32(77), ErrorCode::Misc);
    }

    #[test]
    fn display_messages() {
        let err = Error::RecordHeader { offset: 42 };
        assert_eq!(err.to_string(), "Invalid record header at offset 42");
        assert_eq!(
            io_error(IoOp::Sync, io::ErrorKind::Other).to_string(),
            "I/O error during sync: boom"
        );
        assert_eq!(ErrorCode::NoRecord.to_string(), "no record found");
    }

    #[test]
    fn page_type_decoding() {
        assert_eq!(PageType::from_u8(2), Some(PageType::BTreeLeaf));
        assert_eq!(PageType::from_u8(3), None);
    }
}
