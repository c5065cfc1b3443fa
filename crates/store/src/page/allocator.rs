//! Page allocation for index files.
//!
//! Freed pages are reused lowest id first, which keeps live pages packed
//! toward the start of the file; fresh pages come from the end. The index
//! file persists the free set as a chain of free-list pages on flush and
//! rebuilds it by walking the tree after an unclean shutdown.

use std::collections::BTreeSet;

use tracing::warn;

use crate::error::PageId;

/// Allocates page ids within one index file.
#[derive(Debug, Default)]
pub struct PageAllocator {
    free: BTreeSet<PageId>,
    next_page: PageId,
}

impl PageAllocator {
    /// Creates an allocator whose next fresh page is `next_page`.
    pub fn new(next_page: PageId) -> Self {
        Self { free: BTreeSet::new(), next_page }
    }

    /// Allocates a page, preferring the lowest freed one.
    pub fn allocate(&mut self) -> PageId {
        if let Some(page_id) = self.free.pop_first() {
            return page_id;
        }
        let page_id = self.next_page;
        self.next_page += 1;
        page_id
    }

    /// Returns a page to the free set. A double free is logged and ignored.
    pub fn free(&mut self, page_id: PageId) {
        if page_id == 0 || page_id >= self.next_page || !self.free.insert(page_id) {
            warn!(page_id, next_page = self.next_page, "Ignoring invalid page free");
        }
    }

    /// Returns the id the next fresh page would get.
    pub fn next_page_id(&self) -> PageId {
        self.next_page
    }

    /// Number of pages waiting in the free set.
    pub fn free_page_count(&self) -> usize {
        self.free.len()
    }

    /// Replaces the allocator state, e.g. after a rollback reloads the header.
    pub fn reset(&mut self, next_page: PageId, free_pages: impl IntoIterator<Item = PageId>) {
        self.next_page = next_page;
        self.free = free_pages.into_iter().filter(|&id| id != 0 && id < next_page).collect();
    }

    /// Returns the free pages in ascending order.
    pub fn free_list(&self) -> Vec<PageId> {
        self.free.iter().copied().collect()
    }

    /// Takes the free pages in ascending order, leaving the set empty.
    pub fn take_free_list(&mut self) -> Vec<PageId> {
        std::mem::take(&mut self.free).into_iter().collect()
    }
}
