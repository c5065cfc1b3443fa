//! Primary record store.
//!
//! Records live in a hash table of chains. The xxh3 hash of a primary key
//! selects a bucket, the bucket slot holds the offset of the newest record in
//! its chain, and every record block links to the next one. A record is
//! found by walking its chain and comparing the hash-check byte, the key size
//! and finally the key bytes.
//!
//! Every write goes through the file's [`Journal`], so a caller that opened a
//! unit of work can undo it. In-memory state (header counters and the free
//! pool) is captured with [`HashStore::snapshot`] and put back with
//! [`HashStore::restore`] when a unit is rolled back.
//!
//! Concurrency: 64 striped locks guard the buckets. Readers of a bucket share
//! its stripe; a writer holds it exclusively while relinking the chain.
//! Mutations are serialized by the caller, and counters plus the pool sit
//! behind one mutex.

mod allocator;
mod header;
mod record;

pub use allocator::FreePool;
pub use header::{CatalogEntry, HEADER_SIZE, Header};
pub use record::{Layout, RecordHeader};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    backend::{Journal, StorageBackend},
    columns,
    config::{Compression, MAX_ALIGNMENT_POWER, MAX_FREE_POOL_POWER, TableConfig},
    encoding::align_up,
    error::{Error, Result},
};

use record::{decode_pool, encode_free, encode_pool, encode_record, record_body_size};

/// Number of bucket lock stripes.
pub const STRIPES: usize = 64;

/// Bytes read speculatively after a record header so short keys need one read.
const KEY_PROBE: usize = 64;

/// Buckets scanned per read when looking for the next non-empty chain.
const BUCKET_SCAN_BATCH: u64 = 4096;

#[derive(Debug, Clone)]
struct StoreState {
    header: Header,
    pool: FreePool,
}

/// In-memory store state captured at a savepoint.
#[derive(Debug, Clone)]
pub struct StoreSnapshot(StoreState);

/// Where a chain walk currently stands.
///
/// `next == 0` means "at the head of `bucket`".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainPosition {
    bucket: u64,
    next: u64,
}

impl ChainPosition {
    /// Bucket the position is in.
    pub fn bucket(&self) -> u64 {
        self.bucket
    }
}

/// A record located in its chain.
struct Located {
    header: RecordHeader,
    prev: Option<u64>,
}

/// Hash-bucketed record store over a journaled backend.
pub struct HashStore<B: StorageBackend> {
    journal: Journal<B>,
    layout: Layout,
    state: Mutex<StoreState>,
    stripes: Vec<RwLock<()>>,
}

impl<B: StorageBackend> HashStore<B> {
    /// Lays out a new, empty table in `journal`'s data backend.
    ///
    /// Any existing contents are discarded.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be written, or
    /// [`Error::InvalidOperation`] if the layout does not fit normal mode.
    pub fn create(journal: Journal<B>, config: &TableConfig) -> Result<Self> {
        config.validate()?;
        let layout = Layout {
            bucket_count: config.bucket_count,
            alignment_power: config.alignment_power,
            free_pool_power: config.free_pool_power,
            large: config.large,
            compression: config.compression,
        };
        let records = layout.records_offset();
        layout.check_file_size(records)?;

        let header = Header {
            large: layout.large,
            opened: false,
            compression: layout.compression,
            alignment_power: layout.alignment_power,
            free_pool_power: layout.free_pool_power,
            bucket_count: layout.bucket_count,
            record_count: 0,
            file_size: records,
            first_record: records,
            unique_id: 0,
            catalog: Vec::new(),
        };
        journal.set_len(0)?;
        journal.set_len(records)?;
        journal.write_at(0, &header.to_bytes()?)?;
        journal.data().sync()?;
        debug!(
            buckets = layout.bucket_count,
            alignment_power = layout.alignment_power,
            large = layout.large,
            "Created record store"
        );

        let pool = FreePool::new(layout.pool_capacity(), config.defrag_unit);
        Ok(Self::assemble(journal, layout, header, pool))
    }

    /// Opens an existing table.
    ///
    /// Returns the store and whether the file was left open for writing by a
    /// handle that never closed it. In that case the persisted free pool is
    /// not trusted and the store starts with an empty one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Metadata`] if the header is invalid.
    pub fn open(journal: Journal<B>, writable: bool, defrag_unit: u32) -> Result<(Self, bool)> {
        let data = journal.data();
        let physical = data.len()?;
        if physical < HEADER_SIZE as u64 {
            return Err(Error::metadata(format!("file is too short ({physical} bytes)")));
        }
        let header = Header::from_bytes(&data.read_vec(0, HEADER_SIZE)?)?;
        if header.alignment_power > MAX_ALIGNMENT_POWER
            || header.free_pool_power > MAX_FREE_POOL_POWER
        {
            return Err(Error::metadata("alignment or pool power out of range"));
        }
        let layout = Layout {
            bucket_count: header.bucket_count,
            alignment_power: header.alignment_power,
            free_pool_power: header.free_pool_power,
            large: header.large,
            compression: header.compression,
        };
        if header.first_record != layout.records_offset() || header.file_size < header.first_record
        {
            return Err(Error::metadata("record area offsets are inconsistent"));
        }
        if physical < header.file_size {
            return Err(Error::metadata(format!(
                "file is truncated ({physical} of {} bytes)",
                header.file_size
            )));
        }

        let unclean = header.opened;
        let pool = if writable && !unclean {
            let region = data.read_vec(layout.pool_offset(), layout.pool_size() as usize)?;
            FreePool::from_blocks(decode_pool(&region)?, layout.pool_capacity(), defrag_unit)
        } else {
            FreePool::new(layout.pool_capacity(), defrag_unit)
        };
        Ok((Self::assemble(journal, layout, header, pool), unclean))
    }

    fn assemble(journal: Journal<B>, layout: Layout, header: Header, pool: FreePool) -> Self {
        Self {
            journal,
            layout,
            state: Mutex::new(StoreState { header, pool }),
            stripes: (0..STRIPES).map(|_| RwLock::new(())).collect(),
        }
    }

    /// The journal every write goes through.
    pub fn journal(&self) -> &Journal<B> {
        &self.journal
    }

    /// Consumes the store, returning its journal.
    pub fn into_journal(self) -> Journal<B> {
        self.journal
    }

    /// File geometry.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Number of live records.
    pub fn record_count(&self) -> u64 {
        self.state.lock().header.record_count
    }

    /// Logical file size.
    pub fn file_size(&self) -> u64 {
        self.state.lock().header.file_size
    }

    /// Number of blocks in the free pool.
    pub fn free_block_count(&self) -> usize {
        self.state.lock().pool.len()
    }

    /// Indexes recorded in the header.
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.state.lock().header.catalog.clone()
    }

    /// Replaces the index catalog and writes the header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] if the catalog does not fit.
    pub fn set_catalog(&self, catalog: Vec<CatalogEntry>) -> Result<()> {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.header.catalog, catalog);
        if let Err(e) = self.write_header(&state.header) {
            state.header.catalog = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Advances the persisted unique-id counter and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the header cannot be written.
    pub fn next_unique_id(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state.header.unique_id += 1;
        self.write_header(&state.header)?;
        Ok(state.header.unique_id)
    }

    /// Current value of the unique-id counter.
    pub fn unique_id(&self) -> u64 {
        self.state.lock().header.unique_id
    }

    /// Sets the unique-id counter, e.g. when carrying it into a rebuilt file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the header cannot be written.
    pub fn set_unique_id(&self, unique_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.header.unique_id = unique_id;
        self.write_header(&state.header)
    }

    /// Captures the in-memory state for a later [`HashStore::restore`].
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot(self.state.lock().clone())
    }

    /// Puts back state captured by [`HashStore::snapshot`].
    pub fn restore(&self, snapshot: StoreSnapshot) {
        *self.state.lock() = snapshot.0;
    }

    /// Sets the "open for writing" flag and makes it durable.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the header cannot be written or synced.
    pub fn mark_open(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.header.opened = true;
        self.write_header(&state.header)?;
        self.journal.data().sync()
    }

    /// Persists the free pool and header and flushes the file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if a write or the sync fails.
    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock();
        self.persist_pool(&state.pool)?;
        self.write_header(&state.header)?;
        self.journal.data().sync()
    }

    /// Persists everything, clears the open flag and trims the file to its
    /// logical size.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if a write, the truncation or the sync fails.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.persist_pool(&state.pool)?;
        state.header.opened = false;
        self.write_header(&state.header)?;
        self.journal.set_len(state.header.file_size)?;
        self.journal.data().sync()?;
        debug!(
            records = state.header.record_count,
            file_size = state.header.file_size,
            "Closed record store"
        );
        Ok(())
    }

    /// Returns the stored value of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordHeader`] if a block in the chain is damaged.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (bucket, check) = self.locate(key);
        let _stripe = self.stripe(bucket).read();
        match self.find(bucket, check, key)? {
            Some(found) => Ok(Some(self.read_value(&found.header)?)),
            None => Ok(None),
        }
    }

    /// Returns the uncompressed size of the value stored for `key`.
    ///
    /// Only the record header and the compression frame prefix are read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordHeader`] if a block in the chain is damaged.
    pub fn value_size(&self, key: &[u8]) -> Result<Option<usize>> {
        let (bucket, check) = self.locate(key);
        let _stripe = self.stripe(bucket).read();
        let Some(found) = self.find(bucket, check, key)? else {
            return Ok(None);
        };
        if self.layout.compression == Compression::None {
            return Ok(Some(found.header.value_size as usize));
        }
        let prefix_len = (found.header.value_size as usize).min(10);
        let prefix = self.journal.data().read_vec(found.header.value_offset(), prefix_len)?;
        Ok(Some(columns::raw_size(self.layout.compression, &prefix)?))
    }

    /// Stores `value` under `key`.
    ///
    /// With `keep` set an existing record is left alone and
    /// [`Error::RecordExists`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] if the record or file grows past
    /// its limits.
    pub fn put(&self, key: &[u8], value: &[u8], keep: bool) -> Result<()> {
        let body = record_body_size(&self.layout, key, value);
        if body > u64::from(u32::MAX) {
            return Err(Error::invalid(format!("record of {body} bytes is too large")));
        }
        let (bucket, check) = self.locate(key);
        let _stripe = self.stripe(bucket).write();
        let mut state = self.state.lock();

        match self.find(bucket, check, key)? {
            Some(found) => {
                if keep {
                    return Err(Error::RecordExists);
                }
                let old_size = found.header.block_size();
                let offset = found.header.offset;
                if body <= old_size {
                    let needed = align_up(body, self.layout.alignment());
                    let tail = old_size - needed;
                    let block_size =
                        if tail >= self.layout.min_block() { needed } else { old_size };
                    let next = found.header.next;
                    let block = encode_record(&self.layout, check, next, key, value, block_size);
                    self.journal.write_at(offset, &block)?;
                    if block_size < old_size {
                        self.free_block(&mut state, offset + block_size, tail)?;
                    }
                } else {
                    let (new_offset, block_size) = self.allocate(&mut state, body)?;
                    let next = found.header.next;
                    let block = encode_record(&self.layout, check, next, key, value, block_size);
                    self.journal.write_at(new_offset, &block)?;
                    self.link(found.prev, bucket, new_offset)?;
                    self.free_block(&mut state, offset, old_size)?;
                }
            },
            None => {
                let head = self.bucket_head(bucket)?;
                let (offset, block_size) = self.allocate(&mut state, body)?;
                let block = encode_record(&self.layout, check, head, key, value, block_size);
                self.journal.write_at(offset, &block)?;
                self.link(None, bucket, offset)?;
                state.header.record_count += 1;
            },
        }
        self.write_header(&state.header)
    }

    /// Removes `key`. Returns false if it was absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordHeader`] if a block in the chain is damaged.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let (bucket, check) = self.locate(key);
        let _stripe = self.stripe(bucket).write();
        let mut state = self.state.lock();
        let Some(found) = self.find(bucket, check, key)? else {
            return Ok(false);
        };
        self.link(found.prev, bucket, found.header.next)?;
        self.free_block(&mut state, found.header.offset, found.header.block_size())?;
        state.header.record_count = state.header.record_count.saturating_sub(1);
        self.write_header(&state.header)?;
        Ok(true)
    }

    /// Removes every record.
    ///
    /// The caller must exclude all other access for the duration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the bucket array cannot be cleared.
    pub fn vanish(&self) -> Result<()> {
        let mut state = self.state.lock();
        let start = self.layout.bucket_offset();
        let end = start + self.layout.bucket_count * self.layout.bucket_width();
        let zeros = vec![0u8; 1 << 16];
        let mut pos = start;
        while pos < end {
            let len = (end - pos).min(zeros.len() as u64) as usize;
            self.journal.write_at(pos, &zeros[..len])?;
            pos += len as u64;
        }
        state.header.record_count = 0;
        state.header.file_size = self.layout.records_offset();
        state.pool.clear();
        self.write_header(&state.header)?;
        info!(buckets = self.layout.bucket_count, "Removed every record");
        Ok(())
    }

    /// Advances `pos` to the next record and returns its key, plus its
    /// stored value when `with_value` is set.
    ///
    /// Each step reads under the bucket's stripe lock. A position whose block
    /// was freed or moved to another chain since the previous step abandons
    /// the chain and continues with the next bucket.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if a read fails.
    pub fn next_record(
        &self,
        pos: &mut ChainPosition,
        with_value: bool,
    ) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        loop {
            if pos.next == 0 {
                match self.next_nonempty_bucket(pos.bucket)? {
                    Some(bucket) => pos.bucket = bucket,
                    None => {
                        pos.bucket = self.layout.bucket_count;
                        return Ok(None);
                    },
                }
            }
            let bucket = pos.bucket;
            let _stripe = self.stripe(bucket).read();
            let offset = if pos.next == 0 { self.bucket_head(bucket)? } else { pos.next };
            if offset == 0 {
                pos.bucket += 1;
                pos.next = 0;
                continue;
            }
            match self.read_chain_entry(offset, bucket, with_value)? {
                Some((next, key, value)) => {
                    pos.next = next;
                    if next == 0 {
                        pos.bucket += 1;
                    }
                    return Ok(Some((key, value)));
                },
                None => {
                    pos.bucket += 1;
                    pos.next = 0;
                },
            }
        }
    }

    /// Visits every record with its stored value until `f` returns false.
    ///
    /// # Errors
    ///
    /// Propagates read errors and errors returned by `f`.
    pub fn scan<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Vec<u8>, Vec<u8>) -> Result<bool>,
    {
        let mut pos = ChainPosition::default();
        while let Some((key, value)) = self.next_record(&mut pos, true)? {
            if !f(key, value.unwrap_or_default())? {
                break;
            }
        }
        Ok(())
    }

    fn locate(&self, key: &[u8]) -> (u64, u8) {
        let hash = xxh3_64(key);
        (hash % self.layout.bucket_count, (hash >> 56) as u8)
    }

    fn stripe(&self, bucket: u64) -> &RwLock<()> {
        &self.stripes[(bucket % STRIPES as u64) as usize]
    }

    fn bucket_head(&self, bucket: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        let width = self.layout.bucket_width() as usize;
        self.journal.data().read_at(self.layout.bucket_entry_offset(bucket), &mut buf[..width])?;
        Ok(self.layout.read_slot(&buf, 0))
    }

    fn next_nonempty_bucket(&self, from: u64) -> Result<Option<u64>> {
        let width = self.layout.bucket_width();
        let mut bucket = from;
        while bucket < self.layout.bucket_count {
            let count = (self.layout.bucket_count - bucket).min(BUCKET_SCAN_BATCH);
            let slots = self
                .journal
                .data()
                .read_vec(self.layout.bucket_entry_offset(bucket), (count * width) as usize)?;
            for i in 0..count {
                if self.layout.read_slot(&slots, (i * width) as usize) != 0 {
                    return Ok(Some(bucket + i));
                }
            }
            bucket += count;
        }
        Ok(None)
    }

    /// Reads a record header together with the first bytes of its key.
    fn read_record(&self, offset: u64) -> Result<(RecordHeader, Vec<u8>)> {
        let probe_len = self.layout.record_header_size() + KEY_PROBE;
        let probe = self.journal.data().read_vec(offset, probe_len)?;
        let header = RecordHeader::parse(&self.layout, offset, &probe)?;
        let physical = self.journal.data().len()?;
        if offset.saturating_add(header.block_size()) > physical {
            return Err(Error::RecordHeader { offset });
        }
        Ok((header, probe))
    }

    fn read_key(&self, header: &RecordHeader, probe: &[u8]) -> Result<Vec<u8>> {
        let start = header.header_size;
        let len = header.key_size as usize;
        if start + len <= probe.len() {
            return Ok(probe[start..start + len].to_vec());
        }
        self.journal.data().read_vec(header.key_offset(), len)
    }

    fn read_value(&self, header: &RecordHeader) -> Result<Vec<u8>> {
        self.journal.data().read_vec(header.value_offset(), header.value_size as usize)
    }

    fn find(&self, bucket: u64, check: u8, key: &[u8]) -> Result<Option<Located>> {
        let mut prev = None;
        let mut offset = self.bucket_head(bucket)?;
        while offset != 0 {
            let (header, probe) = self.read_record(offset)?;
            if header.check == check
                && header.key_size as usize == key.len()
                && self.read_key(&header, &probe)? == key
            {
                return Ok(Some(Located { header, prev }));
            }
            prev = Some(offset);
            offset = header.next;
        }
        Ok(None)
    }

    /// Reads the chain entry at `offset`, or `None` if it no longer belongs
    /// to `bucket`.
    fn read_chain_entry(
        &self,
        offset: u64,
        bucket: u64,
        with_value: bool,
    ) -> Result<Option<(u64, Vec<u8>, Option<Vec<u8>>)>> {
        let (header, probe) = match self.read_record(offset) {
            Ok(found) => found,
            Err(Error::RecordHeader { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let key = self.read_key(&header, &probe)?;
        let (key_bucket, check) = self.locate(&key);
        if key_bucket != bucket || check != header.check {
            return Ok(None);
        }
        let value = if with_value { Some(self.read_value(&header)?) } else { None };
        Ok(Some((header.next, key, value)))
    }

    /// Points the predecessor (or the bucket slot) at `target`.
    fn link(&self, prev: Option<u64>, bucket: u64, target: u64) -> Result<()> {
        let at = match prev {
            Some(prev) => self.layout.next_field(prev),
            None => self.layout.bucket_entry_offset(bucket),
        };
        self.journal.write_at(at, &self.layout.write_slot(target))
    }

    /// Finds room for a record body. Returns `(offset, block_size)`.
    fn allocate(&self, state: &mut StoreState, body: u64) -> Result<(u64, u64)> {
        let needed = align_up(body, self.layout.alignment());
        if let Some((offset, size)) = state.pool.take(needed) {
            let rest = size - needed;
            if rest >= self.layout.min_block() {
                self.free_block(state, offset + needed, rest)?;
                return Ok((offset, needed));
            }
            return Ok((offset, size));
        }
        let offset = state.header.file_size;
        let end = offset + needed;
        self.layout.check_file_size(end)?;
        state.header.file_size = end;
        Ok((offset, needed))
    }

    fn free_block(&self, state: &mut StoreState, offset: u64, size: u64) -> Result<()> {
        // Marked free even past the logical end, so stale cursors never read
        // a dead record.
        self.journal.write_at(offset, &encode_free(size))?;
        if offset + size == state.header.file_size {
            state.header.file_size = offset;
            self.shrink_tail(state);
            return Ok(());
        }
        if state.pool.release(offset, size) {
            self.defragment(state)?;
        }
        Ok(())
    }

    /// Pulls pooled blocks that end at the logical end of the file back out
    /// of the pool by shrinking the file.
    fn shrink_tail(&self, state: &mut StoreState) {
        while let Some((offset, _)) = state.pool.take_ending_at(state.header.file_size) {
            state.header.file_size = offset;
        }
    }

    fn defragment(&self, state: &mut StoreState) -> Result<()> {
        let merged = state.pool.coalesce(u64::from(u32::MAX));
        for &(offset, size) in &merged {
            self.journal.write_at(offset, &encode_free(size))?;
        }
        let before = state.header.file_size;
        self.shrink_tail(state);
        debug!(
            merged = merged.len(),
            pooled = state.pool.len(),
            reclaimed = before - state.header.file_size,
            "Coalesced free blocks"
        );
        Ok(())
    }

    fn persist_pool(&self, pool: &FreePool) -> Result<()> {
        let region = encode_pool(&pool.blocks(), self.layout.pool_size());
        self.journal.write_at(self.layout.pool_offset(), &region)
    }

    fn write_header(&self, header: &Header) -> Result<()> {
        self.journal.write_at(0, &header.to_bytes()?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::backend::InMemoryBackend;

    fn config(buckets: u64) -> TableConfig {
        TableConfig::builder().bucket_count(buckets).free_pool_power(4).build().unwrap()
    }

    fn store(buckets: u64) -> HashStore<InMemoryBackend> {
        let journal = Journal::new(InMemoryBackend::new(), InMemoryBackend::new());
        HashStore::create(journal, &config(buckets)).unwrap()
    }

    fn all_keys(store: &HashStore<InMemoryBackend>) -> BTreeSet<Vec<u8>> {
        let mut keys = BTreeSet::new();
        let mut pos = ChainPosition::default();
        while let Some((key, value)) = store.next_record(&mut pos, false).unwrap() {
            assert!(value.is_none());
            assert!(keys.insert(key), "key yielded twice");
        }
        keys
    }

    #[test]
    fn test_put_get_remove() {
        let store = store(17);
        store.put(b"alpha", b"one", false).unwrap();
        store.put(b"beta", b"two", false).unwrap();
        assert_eq!(store.get(b"alpha").unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get(b"gamma").unwrap(), None);
        assert_eq!(store.record_count(), 2);

        assert!(store.remove(b"alpha").unwrap());
        assert!(!store.remove(b"alpha").unwrap());
        assert_eq!(store.get(b"alpha").unwrap(), None);
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_keep_leaves_existing_value() {
        let store = store(17);
        store.put(b"k", b"first", true).unwrap();
        assert!(matches!(store.put(b"k", b"second", true), Err(Error::RecordExists)));
        assert_eq!(store.get(b"k").unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn test_overwrite_in_place_and_relocated() {
        // One bucket puts every record in the same chain.
        let store = store(1);
        for i in 0..10u8 {
            store.put(&[b'k', i], &[i; 8], false).unwrap();
        }
        store.put(b"k\x05", &[0xAA; 300], false).unwrap();
        store.put(b"k\x03", b"", false).unwrap();
        for i in 0..10u8 {
            let expected = match i {
                5 => vec![0xAA; 300],
                3 => Vec::new(),
                _ => vec![i; 8],
            };
            assert_eq!(store.get(&[b'k', i]).unwrap(), Some(expected));
        }
        assert_eq!(all_keys(&store).len(), 10);
        assert_eq!(store.record_count(), 10);
    }

    #[test]
    fn test_freed_blocks_are_reused() {
        let journal = Journal::new(InMemoryBackend::new(), InMemoryBackend::new());
        let config = TableConfig::builder().bucket_count(31).build().unwrap();
        let store = HashStore::create(journal, &config).unwrap();
        for i in 0..50u32 {
            store.put(&i.to_le_bytes(), &[1u8; 100], false).unwrap();
        }
        let settled = store.file_size();
        for round in 0..20u8 {
            for i in (1..50u32).step_by(2) {
                store.remove(&i.to_le_bytes()).unwrap();
            }
            for i in (1..50u32).step_by(2) {
                store.put(&i.to_le_bytes(), &[round; 100], false).unwrap();
            }
        }
        assert_eq!(store.file_size(), settled);
        assert_eq!(store.get(&7u32.to_le_bytes()).unwrap(), Some(vec![19u8; 100]));
    }

    #[test]
    fn test_defragmentation_merges_neighbours_for_reuse() {
        let journal = Journal::new(InMemoryBackend::new(), InMemoryBackend::new());
        let config = TableConfig::builder().bucket_count(7).defrag_unit(4).build().unwrap();
        let store = HashStore::create(journal, &config).unwrap();
        for key in [b"a", b"b", b"c", b"d", b"e"] {
            // 18 + 1 + 109 = 128 bytes per block.
            store.put(key, &[0u8; 109], false).unwrap();
        }
        let size = store.file_size();
        for key in [b"a", b"b", b"c", b"d"] {
            store.remove(key).unwrap();
        }
        assert_eq!(store.free_block_count(), 1);

        store.put(b"big", &[1u8; 400], false).unwrap();
        assert_eq!(store.file_size(), size);
        assert_eq!(store.get(b"big").unwrap(), Some(vec![1u8; 400]));
        assert_eq!(store.get(b"e").unwrap(), Some(vec![0u8; 109]));
    }

    #[test]
    fn test_removing_the_last_block_shrinks_the_file() {
        let store = store(7);
        let empty = store.file_size();
        store.put(b"a", b"1", false).unwrap();
        store.put(b"b", b"2", false).unwrap();
        store.remove(b"a").unwrap();
        store.remove(b"b").unwrap();
        assert_eq!(store.file_size(), empty);
        assert_eq!(store.free_block_count(), 0);
    }

    #[test]
    fn test_iteration_visits_every_key_once() {
        let store = store(13);
        let expected: BTreeSet<Vec<u8>> =
            (0..200u32).map(|i| format!("key-{i}").into_bytes()).collect();
        for key in &expected {
            store.put(key, b"v", false).unwrap();
        }
        assert_eq!(all_keys(&store), expected);

        let mut values = 0;
        store
            .scan(|_, value| {
                assert_eq!(value, b"v");
                values += 1;
                Ok(true)
            })
            .unwrap();
        assert_eq!(values, 200);
    }

    #[test]
    fn test_cursor_skips_a_block_reused_by_another_bucket() {
        let store = store(64);
        for i in 0..64u32 {
            store.put(&i.to_be_bytes(), &[7u8; 32], false).unwrap();
        }
        let mut pos = ChainPosition::default();
        let (first, _) = store.next_record(&mut pos, false).unwrap().unwrap();
        // Drop everything, then refill with other keys; the cursor's saved
        // offset now points into unrelated chains or free space.
        for i in 0..64u32 {
            store.remove(&i.to_be_bytes()).unwrap();
        }
        for i in 100..164u32 {
            store.put(&i.to_be_bytes(), &[9u8; 32], false).unwrap();
        }
        let live = all_keys(&store);
        while let Some((key, _)) = store.next_record(&mut pos, false).unwrap() {
            assert!(live.contains(&key), "yielded a key that does not exist");
        }
        assert!(!live.contains(&first));
    }

    #[test]
    fn test_vanish() {
        let store = store(11);
        for i in 0..20u8 {
            store.put(&[i], b"x", false).unwrap();
        }
        store.vanish().unwrap();
        assert_eq!(store.record_count(), 0);
        assert_eq!(store.file_size(), store.layout().records_offset());
        assert!(all_keys(&store).is_empty());
        store.put(b"again", b"y", false).unwrap();
        assert_eq!(store.get(b"again").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn test_rollback_with_snapshot_restores_state() {
        let store = store(11);
        store.put(b"stay", b"1", false).unwrap();

        store.journal().begin(1).unwrap();
        let snapshot = store.snapshot();
        store.put(b"stay", b"changed and longer", false).unwrap();
        store.put(b"gone", b"2", false).unwrap();
        store.journal().rollback().unwrap();
        store.restore(snapshot);

        assert_eq!(store.get(b"stay").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"gone").unwrap(), None);
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_reopen_after_close_and_after_crash() {
        let store = store(11);
        store.mark_open().unwrap();
        store.put(b"a", &[1u8; 64], false).unwrap();
        store.put(b"b", &[2u8; 64], false).unwrap();
        store.remove(b"a").unwrap();
        assert_eq!(store.free_block_count(), 1);
        store.close().unwrap();

        let (data, log) = store.into_journal().into_parts();
        let (reopened, unclean) = HashStore::open(Journal::new(data, log), true, 0).unwrap();
        assert!(!unclean);
        assert_eq!(reopened.free_block_count(), 1);
        assert_eq!(reopened.get(b"b").unwrap(), Some(vec![2u8; 64]));
        assert_eq!(reopened.next_unique_id().unwrap(), 1);

        // Never closed: the open flag survives and the pool is discarded.
        reopened.mark_open().unwrap();
        let (data, log) = reopened.into_journal().into_parts();
        let (crashed, unclean) = HashStore::open(Journal::new(data, log), true, 0).unwrap();
        assert!(unclean);
        assert_eq!(crashed.free_block_count(), 0);
        assert_eq!(crashed.record_count(), 1);
        assert_eq!(crashed.next_unique_id().unwrap(), 2);
    }

    #[test]
    fn test_value_size_reads_frame_prefix() {
        let journal = Journal::new(InMemoryBackend::new(), InMemoryBackend::new());
        let config = TableConfig::builder()
            .bucket_count(7)
            .compression(Compression::Deflate)
            .build()
            .unwrap();
        let store = HashStore::create(journal, &config).unwrap();
        let raw = vec![b'z'; 5000];
        let stored = columns::compress(Compression::Deflate, &raw).unwrap();
        store.put(b"k", &stored, false).unwrap();
        assert_eq!(store.value_size(b"k").unwrap(), Some(5000));
        assert_eq!(store.value_size(b"missing").unwrap(), None);
    }

    #[test]
    fn test_large_mode_round_trip() {
        let journal = Journal::new(InMemoryBackend::new(), InMemoryBackend::new());
        let config = TableConfig::builder().bucket_count(5).large(true).build().unwrap();
        let store = HashStore::create(journal, &config).unwrap();
        assert_eq!(store.layout().record_header_size(), 22);
        for i in 0..30u8 {
            store.put(&[i], &[i; 20], false).unwrap();
        }
        for i in 0..30u8 {
            assert_eq!(store.get(&[i]).unwrap(), Some(vec![i; 20]));
        }
    }
}
