//! Index files: a 512-byte header followed by 8 KiB pages.
//!
//! ```text
//! Offset  Size   Field
//! ------  ----   -----
//! 0       8      Magic "TABULAIX"
//! 8       4      Format version
//! 12      1      Index kind
//! 13      1      Page size power (13 = 8 KiB)
//! 16      8      Root page (0 = empty tree)
//! 24      8      Total pages (next fresh page id)
//! 32      8      Head of the persisted free list
//! 40      8      Entry count
//! 48      8      Entries whose value was truncated
//! 504     8      XXH3-64 of bytes 0..504
//! ```
//!
//! Page `n` (ids start at 1) lives at `512 + (n - 1) * 8192`. Pages read from
//! disk are verified against their checksum and kept in one of two clock
//! caches, leaves and branches separately. Modified pages stay pinned in the
//! cache until [`IndexFile::flush`] writes them through the journal.

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use super::IndexKind;
use crate::{
    backend::{Journal, StorageBackend},
    btree::PageProvider,
    cache::CacheStats,
    encoding::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64},
    error::{Error, PageId, PageType, Result},
    page::{INDEX_PAGE_SIZE, PAGE_HEADER_SIZE, Page, PageAllocator, PageCache},
};

/// Index file header size in bytes.
pub const INDEX_HEADER_SIZE: u64 = 512;

/// Magic bytes identifying an index file.
pub const INDEX_MAGIC: &[u8; 8] = b"TABULAIX";

const INDEX_VERSION: u32 = 1;
const CHECKSUM_OFFSET: usize = INDEX_HEADER_SIZE as usize - 8;

/// Free-list page content: next u64, count u16, then page ids.
const FREE_LIST_IDS_OFFSET: usize = 10;
const FREE_LIST_CAPACITY: usize = (INDEX_PAGE_SIZE - PAGE_HEADER_SIZE - FREE_LIST_IDS_OFFSET) / 8;

/// Decoded index file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub(crate) kind: IndexKind,
    pub(crate) root: PageId,
    pub(crate) total_pages: PageId,
    pub(crate) free_head: PageId,
    pub(crate) entry_count: u64,
    pub(crate) truncated: u64,
}

impl IndexHeader {
    fn new(kind: IndexKind) -> Self {
        Self { kind, root: 0, total_pages: 1, free_head: 0, entry_count: 0, truncated: 0 }
    }

    fn to_bytes(self) -> [u8; INDEX_HEADER_SIZE as usize] {
        let mut buf = [0u8; INDEX_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(INDEX_MAGIC);
        put_u32(&mut buf, 8, INDEX_VERSION);
        buf[12] = self.kind.id();
        buf[13] = INDEX_PAGE_SIZE.trailing_zeros() as u8;
        put_u64(&mut buf, 16, self.root);
        put_u64(&mut buf, 24, self.total_pages);
        put_u64(&mut buf, 32, self.free_head);
        put_u64(&mut buf, 40, self.entry_count);
        put_u64(&mut buf, 48, self.truncated);
        let checksum = xxh3_64(&buf[..CHECKSUM_OFFSET]);
        put_u64(&mut buf, CHECKSUM_OFFSET, checksum);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < INDEX_HEADER_SIZE as usize || &buf[0..8] != INDEX_MAGIC {
            return Err(Error::metadata("not an index file (bad magic)"));
        }
        if get_u32(buf, 8) != INDEX_VERSION {
            return Err(Error::metadata(format!("unsupported index version {}", get_u32(buf, 8))));
        }
        if xxh3_64(&buf[..CHECKSUM_OFFSET]) != get_u64(buf, CHECKSUM_OFFSET) {
            return Err(Error::metadata("index header checksum mismatch"));
        }
        if u32::from(buf[13]) != INDEX_PAGE_SIZE.trailing_zeros() {
            return Err(Error::metadata(format!("unsupported index page size power {}", buf[13])));
        }
        let kind = IndexKind::from_id(buf[12])
            .ok_or_else(|| Error::metadata(format!("unknown index kind {}", buf[12])))?;
        let header = Self {
            kind,
            root: get_u64(buf, 16),
            total_pages: get_u64(buf, 24),
            free_head: get_u64(buf, 32),
            entry_count: get_u64(buf, 40),
            truncated: get_u64(buf, 48),
        };
        if header.total_pages == 0 || header.root >= header.total_pages {
            return Err(Error::metadata("index root lies outside the file"));
        }
        Ok(header)
    }
}

/// Allocator state captured at a savepoint.
#[derive(Debug, Clone)]
pub struct IndexFileSnapshot {
    free: Vec<PageId>,
    reserved: Vec<PageId>,
}

/// A paged, journaled, cached index file.
pub struct IndexFile<B: StorageBackend> {
    journal: Journal<B>,
    header: IndexHeader,
    allocator: PageAllocator,
    leaf_cache: PageCache,
    nonleaf_cache: PageCache,
    /// Pages holding the persisted free list; handed out again at the next
    /// persist.
    reserved: Vec<PageId>,
    sequence: u64,
}

fn page_offset(page_id: PageId) -> u64 {
    INDEX_HEADER_SIZE + (page_id - 1) * INDEX_PAGE_SIZE as u64
}

impl<B: StorageBackend> IndexFile<B> {
    /// Initializes an empty index file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the header cannot be written.
    pub fn create(
        journal: Journal<B>,
        kind: IndexKind,
        leaf_cache: usize,
        nonleaf_cache: usize,
    ) -> Result<Self> {
        let header = IndexHeader::new(kind);
        journal.set_len(0)?;
        journal.write_at(0, &header.to_bytes())?;
        Ok(Self::assemble(journal, header, leaf_cache, nonleaf_cache))
    }

    /// Opens an existing index file.
    ///
    /// The persisted free list is loaded unless `trust_free_list` is false,
    /// in which case the caller rebuilds it with [`IndexFile::set_free_pages`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Metadata`] if the header is invalid.
    pub fn open(
        journal: Journal<B>,
        leaf_cache: usize,
        nonleaf_cache: usize,
        trust_free_list: bool,
    ) -> Result<Self> {
        let bytes = journal.data().read_vec(0, INDEX_HEADER_SIZE as usize)?;
        let header = IndexHeader::from_bytes(&bytes)?;
        let mut file = Self::assemble(journal, header, leaf_cache, nonleaf_cache);
        if trust_free_list {
            let free = file.load_free_list()?;
            file.allocator.reset(header.total_pages, free);
        }
        Ok(file)
    }

    fn assemble(
        journal: Journal<B>,
        header: IndexHeader,
        leaf_cache: usize,
        nonleaf_cache: usize,
    ) -> Self {
        Self {
            journal,
            allocator: PageAllocator::new(header.total_pages),
            header,
            leaf_cache: PageCache::new(leaf_cache),
            nonleaf_cache: PageCache::new(nonleaf_cache),
            reserved: Vec::new(),
            sequence: 0,
        }
    }

    /// The journal every page write goes through.
    pub fn journal(&self) -> &Journal<B> {
        &self.journal
    }

    /// Consumes the file, returning its journal.
    pub fn into_journal(self) -> Journal<B> {
        self.journal
    }

    /// The in-memory header.
    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut IndexHeader {
        &mut self.header
    }

    /// Stamps pages written from now on with `sequence`.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Leaf and non-leaf cache statistics.
    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        (self.leaf_cache.stats(), self.nonleaf_cache.stats())
    }

    /// Number of pages waiting for reuse.
    pub fn free_page_count(&self) -> usize {
        self.allocator.free_page_count()
    }

    /// Replaces the free list, e.g. after rebuilding it from the tree.
    pub fn set_free_pages(&mut self, free: Vec<PageId>) {
        self.reserved.clear();
        self.allocator.reset(self.header.total_pages, free);
    }

    /// Writes every modified page and the header through the journal.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if a write fails.
    pub fn flush(&mut self, root: PageId) -> Result<()> {
        self.header.root = root;
        self.header.total_pages = self.allocator.next_page_id();

        let mut dirty = self.leaf_cache.collect_where(|page| page.dirty);
        dirty.extend(self.nonleaf_cache.collect_where(|page| page.dirty));
        dirty.sort_by_key(|page| page.id);
        for mut page in dirty {
            page.seal();
            self.journal.write_at(page_offset(page.id), &page.data)?;
            let clean = |cached: &mut Page| cached.dirty = false;
            if !self.leaf_cache.update(&page.id, clean) {
                self.nonleaf_cache.update(&page.id, clean);
            }
        }
        self.journal.write_at(0, &self.header.to_bytes())
    }

    /// Drops cached pages and reloads the header after the journal restored
    /// the file, putting the allocator back to `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Metadata`] if the restored header is invalid.
    pub fn reload(&mut self, snapshot: IndexFileSnapshot) -> Result<()> {
        self.leaf_cache.clear();
        self.nonleaf_cache.clear();
        let bytes = self.journal.data().read_vec(0, INDEX_HEADER_SIZE as usize)?;
        self.header = IndexHeader::from_bytes(&bytes)?;
        self.allocator.reset(self.header.total_pages, snapshot.free);
        self.reserved = snapshot.reserved;
        Ok(())
    }

    /// Captures the allocator state.
    pub fn snapshot(&self) -> IndexFileSnapshot {
        IndexFileSnapshot { free: self.allocator.free_list(), reserved: self.reserved.clone() }
    }

    /// Writes the free list as a chain of free-list pages and records its
    /// head in the header. The chain pages stay out of circulation until the
    /// next persist.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if a write fails.
    pub fn persist_free_list(&mut self, root: PageId) -> Result<()> {
        let mut free = self.allocator.take_free_list();
        free.append(&mut self.reserved);
        free.sort_unstable();
        free.dedup();

        let mut chain = Vec::new();
        while free.len() > chain.len() * FREE_LIST_CAPACITY {
            match free.pop() {
                Some(page_id) => chain.push(page_id),
                None => break,
            }
        }
        for (i, &page_id) in chain.iter().enumerate() {
            let next = chain.get(i + 1).copied().unwrap_or(0);
            let ids = free
                .iter()
                .skip(i * FREE_LIST_CAPACITY)
                .take(FREE_LIST_CAPACITY)
                .copied()
                .collect::<Vec<_>>();
            let mut page = Page::new(page_id, INDEX_PAGE_SIZE, PageType::FreeList, self.sequence);
            let content = page.content_mut();
            put_u64(content, 0, next);
            put_u16(content, 8, ids.len() as u16);
            for (j, id) in ids.iter().enumerate() {
                put_u64(content, FREE_LIST_IDS_OFFSET + j * 8, *id);
            }
            page.seal();
            self.journal.write_at(page_offset(page_id), &page.data)?;
            self.leaf_cache.remove(&page_id);
            self.nonleaf_cache.remove(&page_id);
        }

        self.header.free_head = chain.first().copied().unwrap_or(0);
        debug!(free = free.len(), chain = chain.len(), "Persisted index free list");
        self.allocator.reset(self.allocator.next_page_id(), free);
        self.reserved = chain;
        self.flush(root)
    }

    fn load_free_list(&self) -> Result<Vec<PageId>> {
        let mut free = Vec::new();
        let mut current = self.header.free_head;
        let mut hops = 0;
        while current != 0 {
            if current >= self.header.total_pages || hops >= self.header.total_pages {
                return Err(Error::corrupted("index free list leaves the file or loops"));
            }
            let page = self.read_from_disk(current)?;
            if page.page_type()? != PageType::FreeList {
                return Err(Error::corrupted(format!("page {current} is not a free-list page")));
            }
            let content = page.content();
            let count = get_u16(content, 8) as usize;
            if count > FREE_LIST_CAPACITY {
                return Err(Error::corrupted(format!("free-list page {current} overflows")));
            }
            free.extend((0..count).map(|j| get_u64(content, FREE_LIST_IDS_OFFSET + j * 8)));
            free.push(current);
            current = get_u64(content, 0);
            hops += 1;
        }
        Ok(free)
    }

    fn read_from_disk(&self, page_id: PageId) -> Result<Page> {
        let data = self.journal.data().read_vec(page_offset(page_id), INDEX_PAGE_SIZE)?;
        let page = Page::from_bytes(page_id, data);
        if !page.verify() {
            return Err(Error::PageChecksumMismatch { page_id });
        }
        Ok(page)
    }

    fn cache_for(&self, page: &Page) -> &PageCache {
        match page.page_type() {
            Ok(PageType::BTreeBranch) => &self.nonleaf_cache,
            _ => &self.leaf_cache,
        }
    }
}

impl<B: StorageBackend> PageProvider for IndexFile<B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        let cached = self.leaf_cache.get(&page_id).or_else(|| self.nonleaf_cache.get(&page_id));
        if let Some(page) = cached {
            return Ok(page);
        }
        if page_id == 0 || page_id >= self.allocator.next_page_id() {
            return Err(Error::corrupted(format!("page {page_id} lies outside the index file")));
        }
        let page = self.read_from_disk(page_id)?;
        self.cache_for(&page).insert(page_id, page.clone());
        Ok(page)
    }

    fn write_page(&mut self, mut page: Page) {
        page.dirty = true;
        page.set_sequence(self.sequence);
        let page_id = page.id;
        // A recycled page may change between leaf and branch.
        match page.page_type() {
            Ok(PageType::BTreeBranch) => {
                self.leaf_cache.remove(&page_id);
                self.nonleaf_cache.insert(page_id, page);
            },
            _ => {
                self.nonleaf_cache.remove(&page_id);
                self.leaf_cache.insert(page_id, page);
            },
        }
    }

    fn allocate_page(&mut self, page_type: PageType) -> Page {
        let page_id = self.allocator.allocate();
        Page::new(page_id, INDEX_PAGE_SIZE, page_type, self.sequence)
    }

    fn free_page(&mut self, page_id: PageId) {
        self.leaf_cache.remove(&page_id);
        self.nonleaf_cache.remove(&page_id);
        self.allocator.free(page_id);
    }

    fn page_size(&self) -> usize {
        INDEX_PAGE_SIZE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{backend::InMemoryBackend, btree::BTree};

    fn new_file() -> IndexFile<InMemoryBackend> {
        let journal = Journal::new(InMemoryBackend::new(), InMemoryBackend::new());
        IndexFile::create(journal, IndexKind::Lexical, 4, 2).unwrap()
    }

    fn reopen(file: IndexFile<InMemoryBackend>, trust: bool) -> IndexFile<InMemoryBackend> {
        let (data, log) = file.into_journal().into_parts();
        IndexFile::open(Journal::new(data, log), 4, 2, trust).unwrap()
    }

    #[test]
    fn test_header_round_trip() {
        let header = IndexHeader {
            kind: IndexKind::QGram,
            root: 3,
            total_pages: 9,
            free_head: 4,
            entry_count: 100,
            truncated: 2,
        };
        assert_eq!(IndexHeader::from_bytes(&header.to_bytes()).unwrap(), header);
        let mut bytes = header.to_bytes();
        bytes[20] ^= 1;
        assert!(IndexHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_tree_survives_flush_and_reopen() {
        let mut tree = BTree::new(0, new_file());
        for i in 0..2000u32 {
            tree.insert(format!("key-{i:05}").as_bytes(), b"").unwrap();
        }
        let root = tree.root_page();
        tree.provider_mut().flush(root).unwrap();
        let (leaf, nonleaf) = tree.provider().cache_stats();
        assert_eq!(leaf.pinned + nonleaf.pinned, 0);

        let file = reopen(tree.into_provider(), true);
        let tree = BTree::new(file.header().root, file);
        assert_eq!(tree.count_entries().unwrap(), 2000);
        assert!(tree.get(b"key-01234").unwrap().is_some());
    }

    #[test]
    fn test_free_list_persists_across_reopen() {
        let mut tree = BTree::new(0, new_file());
        for i in 0..3000u32 {
            tree.insert(&i.to_be_bytes(), &[0u8; 64]).unwrap();
        }
        for i in 0..3000u32 {
            tree.delete(&i.to_be_bytes()).unwrap();
        }
        tree.compact(0.5).unwrap();
        let root = tree.root_page();
        tree.provider_mut().persist_free_list(root).unwrap();
        let freed = tree.provider().free_page_count() + tree.provider().reserved.len();
        assert!(freed > 0);

        let file = reopen(tree.into_provider(), true);
        assert_eq!(file.free_page_count(), freed);
    }

    #[test]
    fn test_corrupt_page_is_detected() {
        let mut tree = BTree::new(0, new_file());
        tree.insert(b"a", b"1").unwrap();
        let root = tree.root_page();
        tree.provider_mut().flush(root).unwrap();
        let file = tree.into_provider();
        file.journal().data().write_at(page_offset(root) + 100, b"garbage").unwrap();

        let file = reopen(file, true);
        let tree = BTree::new(file.header().root, file);
        assert!(matches!(tree.get(b"a"), Err(Error::PageChecksumMismatch { .. })));
    }
}
