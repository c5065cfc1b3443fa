//! Fixed-size pages for index files.
//!
//! Index files are a header followed by pages of [`INDEX_PAGE_SIZE`] bytes.
//! Page `n` lives at `INDEX_HEADER_SIZE + (n - 1) * INDEX_PAGE_SIZE`; page 0 is
//! never allocated and serves as the "no page" link.
//!
//! ```text
//! Offset  Size   Field
//! ------  ----   -----
//! 0       1      Page type (PageType enum)
//! 1       1      Reserved
//! 2       2      Cell count (B+ tree nodes)
//! 4       4      Checksum of the content, seeded with the page id
//! 8       8      Sequence number of the unit that last wrote this page
//! ```
//!
//! Seeding the checksum with the page id means a page image written at the
//! wrong offset fails verification just like a torn one.

mod allocator;

pub use allocator::PageAllocator;

use crate::{
    cache::ClockCache,
    encoding::{get_u16, get_u32, get_u64, put_u32, put_u64},
    error::{Error, PageId, PageType, Result},
};

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Page size used by index files.
pub const INDEX_PAGE_SIZE: usize = 8192;

const TYPE_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 2;
const CHECKSUM_OFFSET: usize = 4;
const SEQUENCE_OFFSET: usize = 8;

/// Page cache keyed by page id; dirty pages are pinned.
pub type PageCache = ClockCache<PageId, Page>;

/// One index page: header plus content, as read from or bound for the file.
#[derive(Clone)]
pub struct Page {
    /// Page id within the index file.
    pub id: PageId,
    /// Raw page bytes including the header.
    pub data: Vec<u8>,
    /// Modified since it was last written.
    pub dirty: bool,
}

impl Page {
    /// Creates a zeroed page of `page_type`, stamped with `sequence`.
    pub fn new(id: PageId, page_size: usize, page_type: PageType, sequence: u64) -> Self {
        let mut data = vec![0u8; page_size];
        data[TYPE_OFFSET] = page_type as u8;
        put_u64(&mut data, SEQUENCE_OFFSET, sequence);
        Self { id, data, dirty: true }
    }

    /// Wraps bytes read from storage.
    pub fn from_bytes(id: PageId, data: Vec<u8>) -> Self {
        Self { id, data, dirty: false }
    }

    /// Returns the page type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the type byte is unknown.
    pub fn page_type(&self) -> Result<PageType> {
        let byte = self.data[TYPE_OFFSET];
        PageType::from_u8(byte).ok_or_else(|| {
            Error::corrupted(format!("page {} has unknown type byte {byte}", self.id))
        })
    }

    /// Number of cells a B+ tree node holds.
    pub fn count(&self) -> usize {
        get_u16(&self.data, COUNT_OFFSET) as usize
    }

    /// Sequence number of the unit that last wrote this page.
    pub fn sequence(&self) -> u64 {
        get_u64(&self.data, SEQUENCE_OFFSET)
    }

    /// Stamps the page with the writing unit's sequence number.
    pub fn set_sequence(&mut self, sequence: u64) {
        put_u64(&mut self.data, SEQUENCE_OFFSET, sequence);
    }

    /// Page size in bytes, header included.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Content bytes after the header.
    pub fn content(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    /// Mutable content bytes; marks the page dirty.
    pub fn content_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    fn checksum(&self) -> u32 {
        xxhash_rust::xxh3::xxh3_64_with_seed(self.content(), self.id) as u32
    }

    /// Stores the content checksum. Called right before the page is written.
    pub fn seal(&mut self) {
        let checksum = self.checksum();
        put_u32(&mut self.data, CHECKSUM_OFFSET, checksum);
    }

    /// Checks the stored checksum against the content and the page id.
    pub fn verify(&self) -> bool {
        get_u32(&self.data, CHECKSUM_OFFSET) == self.checksum()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("type", &self.page_type().ok())
            .field("count", &self.count())
            .field("sequence", &self.sequence())
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_fields() {
        let page = Page::new(7, INDEX_PAGE_SIZE, PageType::BTreeBranch, 12345);
        assert_eq!(page.page_type().unwrap(), PageType::BTreeBranch);
        assert_eq!(page.sequence(), 12345);
        assert_eq!(page.count(), 0);
        assert!(page.dirty);
        assert_eq!(page.size(), INDEX_PAGE_SIZE);
        assert_eq!(page.content().len(), INDEX_PAGE_SIZE - PAGE_HEADER_SIZE);
    }

    #[test]
    fn test_unknown_page_type_is_corruption() {
        let mut page = Page::new(3, INDEX_PAGE_SIZE, PageType::BTreeLeaf, 1);
        page.data[0] = 0x77;
        assert!(matches!(page.page_type(), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_seal_and_verify() {
        let mut page = Page::new(1, INDEX_PAGE_SIZE, PageType::BTreeLeaf, 1);
        page.content_mut()[0] = 0x42;
        page.content_mut()[100] = 0xFF;
        page.seal();
        assert!(page.verify());

        page.data[PAGE_HEADER_SIZE + 50] ^= 0xFF;
        assert!(!page.verify());
    }

    #[test]
    fn test_misplaced_page_fails_verification() {
        let mut page = Page::new(4, INDEX_PAGE_SIZE, PageType::BTreeLeaf, 1);
        page.content_mut()[10] = 9;
        page.seal();

        let moved = Page::from_bytes(5, page.data.clone());
        assert!(!moved.verify());
        assert!(Page::from_bytes(4, page.data).verify());
    }
}
