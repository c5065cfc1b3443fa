//! Crash simulation for recovery tests.
//!
//! A process crash leaves on disk exactly the bytes that were written before
//! it. [`capture_crash_image`] copies every file of a live table directory
//! into a fresh [`TestDir`] while the handle is still open, so opening the
//! copy behaves like reopening after the process died at that moment.
//!
//! ```text
//! begin ─ put ─ put ──┬── commit
//!                     │
//!             capture_crash_image  → reopen copy → rolled back
//! ```

// Test utilities are expected to panic on failure - that's their purpose
#![allow(clippy::expect_used)]

use std::{
    fs::{self, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::Path,
};

use crate::TestDir;

/// Copies every regular file in `dir` into a new temporary directory.
///
/// # Panics
///
/// Panics if a file cannot be read or written.
#[must_use]
pub fn capture_crash_image(dir: &Path) -> TestDir {
    let image = TestDir::new();
    for entry in fs::read_dir(dir).expect("failed to read table directory") {
        let entry = entry.expect("failed to read directory entry");
        if entry.file_type().expect("failed to stat entry").is_file() {
            fs::copy(entry.path(), image.join(entry.file_name()))
                .expect("failed to copy table file");
        }
    }
    image
}

/// Flips every bit of the byte at `offset`, simulating media corruption.
///
/// # Panics
///
/// Panics if the file cannot be read or written.
pub fn corrupt_byte(path: &Path, offset: u64) {
    let bytes = fs::read(path).expect("failed to read file");
    let index = usize::try_from(offset).expect("offset fits in usize");
    let flipped = !bytes[index];
    let mut file = OpenOptions::new().write(true).open(path).expect("failed to open file");
    file.seek(SeekFrom::Start(offset)).expect("failed to seek");
    file.write_all(&[flipped]).expect("failed to write");
}

/// Cuts `path` to `len` bytes, simulating a torn write at the end of a file.
///
/// # Panics
///
/// Panics if the file cannot be truncated.
pub fn truncate_file(path: &Path, len: u64) {
    let file = OpenOptions::new().write(true).open(path).expect("failed to open file");
    file.set_len(len).expect("failed to truncate file");
}
