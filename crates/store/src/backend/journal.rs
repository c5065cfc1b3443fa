//! Before-image journal.
//!
//! A [`Journal`] pairs a data backend with a log backend. While a unit of
//! work is open, every write to the data backend first appends the bytes it
//! is about to overwrite to the log:
//!
//! ```text
//! log header (32 bytes):  magic[8] seq[8] base_len[8] xxh3[8]
//! entry:                  offset[8] len[4] before-image[len] xxh3[8]
//! ```
//!
//! Rolling back replays the entries newest-first and truncates the data back
//! to the length it had when the unit (or savepoint) began. Completing a unit
//! truncates the log to zero bytes; a non-empty log found at open therefore
//! always describes an interrupted unit.
//!
//! In synchronous mode the log is forced to stable storage after each
//! appended entry and before the data write it protects, so an overwritten
//! region never reaches the disk ahead of its before-image.
//!
//! Each savepoint starts a new segment. Within a segment a region is logged
//! once, and regions at or beyond the data length at the segment start are
//! never logged because the truncation on rollback removes them.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::StorageBackend;
use crate::{
    encoding::{get_u32, get_u64, put_u64},
    error::{Error, Result},
};

/// Magic bytes at the start of a journal.
pub const JOURNAL_MAGIC: &[u8; 8] = b"TBLJRNL1";

/// Journal header size in bytes.
pub const JOURNAL_HEADER_SIZE: u64 = 32;

const ENTRY_OVERHEAD: usize = 8 + 4 + 8;

/// A position a unit of work can be rolled back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint {
    log_pos: u64,
    data_len: u64,
}

/// Observable journal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    /// No unit of work is open.
    Idle,
    /// A unit of work with the given sequence number is open.
    Active {
        /// Sequence number recorded in the log header.
        seq: u64,
    },
}

struct LogState {
    active: bool,
    seq: u64,
    base_len: u64,
    end: u64,
    segment_len: u64,
    logged: HashSet<(u64, usize)>,
}

/// A data backend whose writes can be undone.
pub struct Journal<B: StorageBackend> {
    data: B,
    log: B,
    sync: bool,
    state: Mutex<LogState>,
}

impl<B: StorageBackend> Journal<B> {
    /// Wraps `data`, logging before-images to `log`.
    ///
    /// Call [`Journal::recover`] before using a journal whose log may hold an
    /// interrupted unit.
    pub fn new(data: B, log: B) -> Self {
        Self {
            data,
            log,
            sync: false,
            state: Mutex::new(LogState {
                active: false,
                seq: 0,
                base_len: 0,
                end: 0,
                segment_len: 0,
                logged: HashSet::new(),
            }),
        }
    }

    /// Forces the log to stable storage before every logged data write.
    #[must_use]
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// The wrapped data backend. Reads go straight to it.
    pub fn data(&self) -> &B {
        &self.data
    }

    /// Splits the journal back into its data and log backends.
    pub fn into_parts(self) -> (B, B) {
        (self.data, self.log)
    }

    /// Returns the current state.
    pub fn state(&self) -> JournalState {
        let state = self.state.lock();
        if state.active { JournalState::Active { seq: state.seq } } else { JournalState::Idle }
    }

    /// Returns true if the log holds an interrupted unit.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the log cannot be read.
    pub fn has_pending(&self) -> Result<bool> {
        Ok(self.read_log_header()?.is_some())
    }

    /// Opens a unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Threading`] if a unit is already open, or `Error::Io`
    /// if the log header cannot be written.
    pub fn begin(&self, seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.active {
            return Err(Error::threading("journal already has an open unit"));
        }
        let base_len = self.data.len()?;
        let mut header = [0u8; JOURNAL_HEADER_SIZE as usize];
        header[0..8].copy_from_slice(JOURNAL_MAGIC);
        put_u64(&mut header, 8, seq);
        put_u64(&mut header, 16, base_len);
        let checksum = xxh3_64(&header[0..24]);
        put_u64(&mut header, 24, checksum);
        self.log.set_len(0)?;
        self.log.write_at(0, &header)?;

        state.active = true;
        state.seq = seq;
        state.base_len = base_len;
        state.end = JOURNAL_HEADER_SIZE;
        state.segment_len = base_len;
        state.logged.clear();
        Ok(())
    }

    /// Starts a new segment and returns a savepoint at its beginning.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the data length cannot be read.
    pub fn savepoint(&self) -> Result<Savepoint> {
        let mut state = self.state.lock();
        let data_len = self.data.len()?;
        state.segment_len = data_len;
        state.logged.clear();
        Ok(Savepoint { log_pos: state.end, data_len })
    }

    /// Writes `bytes` at `offset`, logging the overwritten region first when
    /// a unit is open.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the log or data write fails.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            if state.active
                && offset < state.segment_len
                && !state.logged.contains(&(offset, bytes.len()))
            {
                let before = self.data.read_vec(offset, bytes.len())?;
                let mut entry = Vec::with_capacity(ENTRY_OVERHEAD + before.len());
                entry.extend_from_slice(&offset.to_le_bytes());
                entry.extend_from_slice(&(before.len() as u32).to_le_bytes());
                entry.extend_from_slice(&before);
                let checksum = xxh3_64(&entry);
                entry.extend_from_slice(&checksum.to_le_bytes());
                self.log.write_at(state.end, &entry)?;
                if self.sync {
                    self.log.sync()?;
                }
                state.end += entry.len() as u64;
                state.logged.insert((offset, bytes.len()));
            }
        }
        self.data.write_at(offset, bytes)
    }

    /// Changes the data length. Only growth is journaled; shrinking inside a
    /// unit is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] when shrinking inside a unit.
    pub fn set_len(&self, len: u64) -> Result<()> {
        let state = self.state.lock();
        if state.active && len < self.data.len()? {
            return Err(Error::invalid("cannot shrink a journaled file inside a unit of work"));
        }
        self.data.set_len(len)
    }

    /// Undoes every write made since `savepoint`, keeping the unit open.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the log cannot be read or the data restored.
    pub fn rollback_to(&self, savepoint: Savepoint) -> Result<usize> {
        let mut state = self.state.lock();
        let restored = self.undo(savepoint.log_pos, state.end, savepoint.data_len)?;
        self.log.set_len(savepoint.log_pos)?;
        state.end = savepoint.log_pos;
        state.segment_len = savepoint.data_len;
        state.logged.clear();
        Ok(restored)
    }

    /// Undoes the whole unit and closes it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the log cannot be read or the data restored.
    pub fn rollback(&self) -> Result<usize> {
        let mut state = self.state.lock();
        if !state.active {
            return Ok(0);
        }
        let restored = self.undo(JOURNAL_HEADER_SIZE, state.end, state.base_len)?;
        self.log.set_len(0)?;
        state.active = false;
        state.logged.clear();
        Ok(restored)
    }

    /// Closes the unit, making its writes permanent. This is the commit point
    /// for this file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the log cannot be truncated or synced.
    pub fn complete(&self, sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        self.log.set_len(0)?;
        if sync {
            self.log.sync()?;
        }
        state.active = false;
        state.logged.clear();
        Ok(())
    }

    /// Rolls back an interrupted unit left in the log by a crash.
    ///
    /// Returns the number of before-images restored. A torn or corrupt tail
    /// ends the replay; a corrupt header means no data write happened yet.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the log cannot be read or the data restored.
    pub fn recover(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let Some((seq, base_len)) = self.read_log_header()? else {
            if self.log.len()? > 0 {
                warn!("Discarding journal with unreadable header");
                self.log.set_len(0)?;
                self.log.sync()?;
            }
            return Ok(0);
        };
        let end = self.log.len()?;
        let restored = self.undo(JOURNAL_HEADER_SIZE, end, base_len)?;
        self.data.sync()?;
        self.log.set_len(0)?;
        self.log.sync()?;
        warn!(seq, restored, base_len, "Rolled back interrupted unit of work");
        state.active = false;
        Ok(restored)
    }

    /// Drops the log contents without touching the data.
    ///
    /// Used for journals whose unit was already committed elsewhere.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the log cannot be truncated.
    pub fn discard(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.log.len()? > 0 {
            debug!("Discarding journal of a committed unit");
            self.log.set_len(0)?;
            self.log.sync()?;
        }
        state.active = false;
        state.logged.clear();
        Ok(())
    }

    fn read_log_header(&self) -> Result<Option<(u64, u64)>> {
        if self.log.len()? < JOURNAL_HEADER_SIZE {
            return Ok(None);
        }
        let header = self.log.read_vec(0, JOURNAL_HEADER_SIZE as usize)?;
        if &header[0..8] != JOURNAL_MAGIC || xxh3_64(&header[0..24]) != get_u64(&header, 24) {
            return Ok(None);
        }
        Ok(Some((get_u64(&header, 8), get_u64(&header, 16))))
    }

    /// Replays entries in `[from, to)` newest-first and sets the data length.
    fn undo(&self, from: u64, to: u64, data_len: u64) -> Result<usize> {
        let images = self.parse_entries(from, to)?;
        for (offset, image) in images.iter().rev() {
            self.data.write_at(*offset, image)?;
        }
        if self.data.len()? != data_len {
            self.data.set_len(data_len)?;
        }
        Ok(images.len())
    }

    fn parse_entries(&self, from: u64, to: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        if to <= from {
            return Ok(Vec::new());
        }
        let raw = self.log.read_vec(from, (to - from) as usize)?;
        let mut images = Vec::new();
        let mut pos = 0usize;
        while pos + ENTRY_OVERHEAD <= raw.len() {
            let offset = get_u64(&raw, pos);
            let len = get_u32(&raw, pos + 8) as usize;
            let body_end = pos + 12 + len;
            if body_end + 8 > raw.len() {
                warn!(position = from + pos as u64, "Journal ends with a torn entry");
                break;
            }
            if xxh3_64(&raw[pos..body_end]) != get_u64(&raw, body_end) {
                warn!(position = from + pos as u64, "Journal entry checksum mismatch");
                break;
            }
            images.push((offset, raw[pos + 12..body_end].to_vec()));
            pos = body_end + 8;
        }
        Ok(images)
    }
}
