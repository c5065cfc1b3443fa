//! Slotted leaf and branch node layouts.
//!
//! Both node kinds share one layout inside the page content (after the
//! 16-byte page header, whose item count holds the number of cells):
//!
//! ```text
//! Offset  Size        Field
//! ------  ----        -----
//! 0       8           Link: next leaf (leaf) or rightmost child (branch)
//! 8       2           free_end: start of the cell data area
//! 10      2 * count   Cell pointers (content offsets), sorted by key
//! ...                 Free space
//! free_end ..         Cell data, growing down from the end of the page
//! ```
//!
//! Leaf cell: `[key_len u16][value_len u16][key][value]`.
//! Branch cell: `[key_len u16][child u64][key]`. The child of cell `i` holds
//! keys strictly below key `i`; the rightmost child holds keys at or above the
//! last key.
//!
//! Deleting a cell only removes its pointer. The dead bytes are reclaimed by
//! [`defragment`] when an insert would not otherwise fit.

use crate::{
    encoding::{get_u16, get_u64, put_u16, put_u64},
    error::{Error, PageId, PageType, Result},
    page::{PAGE_HEADER_SIZE, Page},
};

const LINK_OFFSET: usize = 0;
const FREE_END_OFFSET: usize = 8;
const POINTERS_OFFSET: usize = 10;
const POINTER_SIZE: usize = 2;
const LEAF_CELL_HEADER: usize = 4;
const BRANCH_CELL_HEADER: usize = 10;

/// Outcome of a binary search over a node's keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// The key is at this index.
    Found(usize),
    /// The key is absent; this is where it would be inserted.
    NotFound(usize),
}

#[derive(Clone, Copy)]
enum Kind {
    Leaf,
    Branch,
}

fn cell_count(data: &[u8]) -> usize {
    get_u16(data, 2) as usize
}

fn set_cell_count(data: &mut [u8], count: usize) {
    put_u16(data, 2, count as u16);
}

fn content(data: &[u8]) -> &[u8] {
    &data[PAGE_HEADER_SIZE..]
}

fn content_mut(data: &mut [u8]) -> &mut [u8] {
    &mut data[PAGE_HEADER_SIZE..]
}

fn cell_offset(data: &[u8], idx: usize) -> usize {
    get_u16(content(data), POINTERS_OFFSET + idx * POINTER_SIZE) as usize
}

fn free_end(data: &[u8]) -> usize {
    get_u16(content(data), FREE_END_OFFSET) as usize
}

fn free_space(data: &[u8]) -> usize {
    let pointers_end = POINTERS_OFFSET + cell_count(data) * POINTER_SIZE;
    free_end(data).saturating_sub(pointers_end)
}

fn cell_len(data: &[u8], kind: Kind, offset: usize) -> usize {
    let c = content(data);
    let key_len = get_u16(c, offset) as usize;
    match kind {
        Kind::Leaf => LEAF_CELL_HEADER + key_len + get_u16(c, offset + 2) as usize,
        Kind::Branch => BRANCH_CELL_HEADER + key_len,
    }
}

fn key_at(data: &[u8], kind: Kind, idx: usize) -> &[u8] {
    let offset = cell_offset(data, idx);
    let c = content(data);
    let key_len = get_u16(c, offset) as usize;
    let start = offset
        + match kind {
            Kind::Leaf => LEAF_CELL_HEADER,
            Kind::Branch => BRANCH_CELL_HEADER,
        };
    &c[start..start + key_len]
}

fn search(data: &[u8], kind: Kind, key: &[u8]) -> SearchResult {
    let mut lo = 0;
    let mut hi = cell_count(data);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match key_at(data, kind, mid).cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return SearchResult::Found(mid),
        }
    }
    SearchResult::NotFound(lo)
}

/// Bytes used by live cells and their pointers.
fn live_bytes(data: &[u8], kind: Kind) -> usize {
    (0..cell_count(data)).map(|i| cell_len(data, kind, cell_offset(data, i)) + POINTER_SIZE).sum()
}

/// Rewrites the cell area so that live cells are contiguous at the page end.
fn defragment(data: &mut [u8], kind: Kind) {
    let count = cell_count(data);
    let cells: Vec<Vec<u8>> = (0..count)
        .map(|i| {
            let offset = cell_offset(data, i);
            let len = cell_len(data, kind, offset);
            content(data)[offset..offset + len].to_vec()
        })
        .collect();

    let c = content_mut(data);
    let mut end = c.len();
    for (i, cell) in cells.iter().enumerate() {
        end -= cell.len();
        c[end..end + cell.len()].copy_from_slice(cell);
        put_u16(c, POINTERS_OFFSET + i * POINTER_SIZE, end as u16);
    }
    put_u16(c, FREE_END_OFFSET, end as u16);
}

fn insert_cell(page: &mut Page, kind: Kind, idx: usize, cell: &[u8]) -> Result<()> {
    let needed = cell.len() + POINTER_SIZE;
    if free_space(&page.data) < needed {
        defragment(&mut page.data, kind);
        if free_space(&page.data) < needed {
            return Err(Error::PageFull);
        }
    }

    let count = cell_count(&page.data);
    let start = free_end(&page.data) - cell.len();
    let c = content_mut(&mut page.data);
    c[start..start + cell.len()].copy_from_slice(cell);
    put_u16(c, FREE_END_OFFSET, start as u16);

    let slot = POINTERS_OFFSET + idx * POINTER_SIZE;
    let pointers_end = POINTERS_OFFSET + count * POINTER_SIZE;
    c.copy_within(slot..pointers_end, slot + POINTER_SIZE);
    put_u16(c, slot, start as u16);

    set_cell_count(&mut page.data, count + 1);
    page.dirty = true;
    Ok(())
}

fn remove_cell(page: &mut Page, idx: usize) -> Result<()> {
    let count = cell_count(&page.data);
    if idx >= count {
        return Err(Error::corrupted(format!("cell index {idx} out of bounds ({count} cells)")));
    }
    let slot = POINTERS_OFFSET + idx * POINTER_SIZE;
    let pointers_end = POINTERS_OFFSET + count * POINTER_SIZE;
    let c = content_mut(&mut page.data);
    c.copy_within(slot + POINTER_SIZE..pointers_end, slot);
    set_cell_count(&mut page.data, count - 1);
    page.dirty = true;
    Ok(())
}

fn init(page: &mut Page, link: u64) {
    let len = page.content().len();
    let c = page.content_mut();
    c.fill(0);
    put_u64(c, LINK_OFFSET, link);
    put_u16(c, FREE_END_OFFSET, len as u16);
    set_cell_count(&mut page.data, 0);
}

fn check_type(page: &Page, expected: PageType) -> Result<()> {
    let found = page.page_type()?;
    if found != expected {
        return Err(Error::corrupted(format!(
            "page {} has type {found:?}, expected {expected:?}",
            page.id
        )));
    }
    Ok(())
}

/// Bytes available for cells and pointers in a node of `page_size`.
pub(crate) fn node_capacity(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE - POINTERS_OFFSET
}

/// Space a leaf entry takes, pointer included.
pub(crate) fn leaf_cell_size(key: &[u8], value: &[u8]) -> usize {
    LEAF_CELL_HEADER + key.len() + value.len() + POINTER_SIZE
}

/// Space a branch separator takes, pointer included.
pub(crate) fn branch_cell_size(key: &[u8]) -> usize {
    BRANCH_CELL_HEADER + key.len() + POINTER_SIZE
}

/// Largest key plus value a leaf of `page_size` can hold while still
/// splitting into two valid halves.
pub fn max_leaf_entry(page_size: usize) -> usize {
    node_capacity(page_size) / 2 - LEAF_CELL_HEADER - POINTER_SIZE
}

/// Fraction of a leaf page's content occupied by live cells.
pub(crate) fn leaf_fill(page: &Page) -> f64 {
    live_bytes(&page.data, Kind::Leaf) as f64 / node_capacity(page.size()) as f64
}

/// Read-only view of a leaf page.
pub struct LeafNodeRef<'a> {
    page: &'a Page,
}

impl<'a> LeafNodeRef<'a> {
    /// Wraps a leaf page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the page is not a leaf.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        check_type(page, PageType::BTreeLeaf)?;
        Ok(Self { page })
    }

    /// Returns the number of entries.
    pub fn cell_count(&self) -> usize {
        cell_count(&self.page.data)
    }

    /// Returns the key at `idx`.
    pub fn key(&self, idx: usize) -> &'a [u8] {
        key_at(&self.page.data, Kind::Leaf, idx)
    }

    /// Returns the value at `idx`.
    pub fn value(&self, idx: usize) -> &'a [u8] {
        leaf_value(&self.page.data, idx)
    }

    /// Returns the entry at `idx`.
    pub fn get(&self, idx: usize) -> (&'a [u8], &'a [u8]) {
        (self.key(idx), self.value(idx))
    }

    /// Binary-searches the keys.
    pub fn search(&self, key: &[u8]) -> SearchResult {
        search(&self.page.data, Kind::Leaf, key)
    }

    /// Returns the next leaf in key order (0 for the last leaf).
    pub fn next_leaf(&self) -> PageId {
        get_u64(content(&self.page.data), LINK_OFFSET)
    }
}

fn leaf_value(data: &[u8], idx: usize) -> &[u8] {
    let offset = cell_offset(data, idx);
    let c = content(data);
    let key_len = get_u16(c, offset) as usize;
    let value_len = get_u16(c, offset + 2) as usize;
    let start = offset + LEAF_CELL_HEADER + key_len;
    &c[start..start + value_len]
}

/// Mutable view of a leaf page.
pub struct LeafNode<'a> {
    page: &'a mut Page,
}

impl<'a> LeafNode<'a> {
    /// Formats `page` as an empty leaf.
    pub fn init(page: &mut Page) {
        page.data[0] = PageType::BTreeLeaf as u8;
        init(page, 0);
    }

    /// Wraps a leaf page for modification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the page is not a leaf.
    pub fn from_page(page: &'a mut Page) -> Result<Self> {
        check_type(page, PageType::BTreeLeaf)?;
        Ok(Self { page })
    }

    /// Returns the number of entries.
    pub fn cell_count(&self) -> usize {
        cell_count(&self.page.data)
    }

    /// Returns the key at `idx`.
    pub fn key(&self, idx: usize) -> &[u8] {
        key_at(&self.page.data, Kind::Leaf, idx)
    }

    /// Returns the value at `idx`.
    pub fn value(&self, idx: usize) -> &[u8] {
        leaf_value(&self.page.data, idx)
    }

    /// Returns the entry at `idx`.
    pub fn get(&self, idx: usize) -> (&[u8], &[u8]) {
        (self.key(idx), self.value(idx))
    }

    /// Binary-searches the keys.
    pub fn search(&self, key: &[u8]) -> SearchResult {
        search(&self.page.data, Kind::Leaf, key)
    }

    /// Returns the next leaf in key order (0 for the last leaf).
    pub fn next_leaf(&self) -> PageId {
        get_u64(content(&self.page.data), LINK_OFFSET)
    }

    /// Sets the next leaf pointer.
    pub fn set_next_leaf(&mut self, next: PageId) {
        put_u64(self.page.content_mut(), LINK_OFFSET, next);
    }

    /// Checks whether an entry fits, counting reclaimable dead space.
    pub fn can_insert(&self, key: &[u8], value: &[u8]) -> bool {
        live_bytes(&self.page.data, Kind::Leaf) + leaf_cell_size(key, value)
            <= node_capacity(self.page.size())
    }

    /// Inserts an entry at `idx`, which must keep the keys sorted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageFull`] if the entry does not fit.
    pub fn insert(&mut self, idx: usize, key: &[u8], value: &[u8]) -> Result<()> {
        let mut cell = Vec::with_capacity(LEAF_CELL_HEADER + key.len() + value.len());
        cell.extend_from_slice(&(key.len() as u16).to_le_bytes());
        cell.extend_from_slice(&(value.len() as u16).to_le_bytes());
        cell.extend_from_slice(key);
        cell.extend_from_slice(value);
        insert_cell(self.page, Kind::Leaf, idx, &cell)
    }

    /// Overwrites the value at `idx` if the new value has the same length.
    pub fn update(&mut self, idx: usize, value: &[u8]) -> bool {
        if self.value(idx).len() != value.len() {
            return false;
        }
        let offset = cell_offset(&self.page.data, idx);
        let key_len = get_u16(content(&self.page.data), offset) as usize;
        let start = offset + LEAF_CELL_HEADER + key_len;
        self.page.content_mut()[start..start + value.len()].copy_from_slice(value);
        true
    }

    /// Removes the entry at `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if `idx` is out of bounds.
    pub fn delete(&mut self, idx: usize) -> Result<()> {
        remove_cell(self.page, idx)
    }
}

/// Read-only view of a branch page.
pub struct BranchNodeRef<'a> {
    page: &'a Page,
}

impl<'a> BranchNodeRef<'a> {
    /// Wraps a branch page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the page is not a branch.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        check_type(page, PageType::BTreeBranch)?;
        Ok(Self { page })
    }

    /// Returns the number of separator keys.
    pub fn cell_count(&self) -> usize {
        cell_count(&self.page.data)
    }

    /// Returns the separator key at `idx`.
    pub fn key(&self, idx: usize) -> &'a [u8] {
        key_at(&self.page.data, Kind::Branch, idx)
    }

    /// Returns the child left of separator `idx`.
    pub fn child(&self, idx: usize) -> PageId {
        branch_child(&self.page.data, idx)
    }

    /// Returns the rightmost child.
    pub fn rightmost_child(&self) -> PageId {
        get_u64(content(&self.page.data), LINK_OFFSET)
    }

    /// Returns the child whose subtree covers `key`.
    pub fn child_for_key(&self, key: &[u8]) -> PageId {
        branch_child_for_key(&self.page.data, key)
    }
}

fn branch_child(data: &[u8], idx: usize) -> PageId {
    get_u64(content(data), cell_offset(data, idx) + 2)
}

fn branch_child_for_key(data: &[u8], key: &[u8]) -> PageId {
    let idx = match search(data, Kind::Branch, key) {
        // Equal keys live to the right of their separator.
        SearchResult::Found(idx) => idx + 1,
        SearchResult::NotFound(idx) => idx,
    };
    if idx >= cell_count(data) {
        get_u64(content(data), LINK_OFFSET)
    } else {
        branch_child(data, idx)
    }
}

/// Mutable view of a branch page.
pub struct BranchNode<'a> {
    page: &'a mut Page,
}

impl<'a> BranchNode<'a> {
    /// Formats `page` as an empty branch pointing at `rightmost_child`.
    pub fn init(page: &mut Page, rightmost_child: PageId) {
        page.data[0] = PageType::BTreeBranch as u8;
        init(page, rightmost_child);
    }

    /// Wraps a branch page for modification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the page is not a branch.
    pub fn from_page(page: &'a mut Page) -> Result<Self> {
        check_type(page, PageType::BTreeBranch)?;
        Ok(Self { page })
    }

    /// Returns the number of separator keys.
    pub fn cell_count(&self) -> usize {
        cell_count(&self.page.data)
    }

    /// Returns the separator key at `idx`.
    pub fn key(&self, idx: usize) -> &[u8] {
        key_at(&self.page.data, Kind::Branch, idx)
    }

    /// Returns the child left of separator `idx`.
    pub fn child(&self, idx: usize) -> PageId {
        branch_child(&self.page.data, idx)
    }

    /// Returns the rightmost child.
    pub fn rightmost_child(&self) -> PageId {
        get_u64(content(&self.page.data), LINK_OFFSET)
    }

    /// Returns the child whose subtree covers `key`.
    pub fn child_for_key(&self, key: &[u8]) -> PageId {
        branch_child_for_key(&self.page.data, key)
    }

    /// Returns the position a new separator `key` takes.
    pub fn insertion_index(&self, key: &[u8]) -> usize {
        match search(&self.page.data, Kind::Branch, key) {
            SearchResult::Found(idx) | SearchResult::NotFound(idx) => idx,
        }
    }

    /// Sets the child left of separator `idx`.
    pub fn set_child(&mut self, idx: usize, child: PageId) {
        let offset = cell_offset(&self.page.data, idx);
        put_u64(self.page.content_mut(), offset + 2, child);
    }

    /// Sets the rightmost child.
    pub fn set_rightmost_child(&mut self, child: PageId) {
        put_u64(self.page.content_mut(), LINK_OFFSET, child);
    }

    /// Checks whether a separator fits, counting reclaimable dead space.
    pub fn can_insert(&self, key: &[u8]) -> bool {
        live_bytes(&self.page.data, Kind::Branch) + branch_cell_size(key)
            <= node_capacity(self.page.size())
    }

    /// Inserts separator `key` at `idx` with `child` as its left child.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageFull`] if the separator does not fit.
    pub fn insert(&mut self, idx: usize, key: &[u8], child: PageId) -> Result<()> {
        let mut cell = Vec::with_capacity(BRANCH_CELL_HEADER + key.len());
        cell.extend_from_slice(&(key.len() as u16).to_le_bytes());
        cell.extend_from_slice(&child.to_le_bytes());
        cell.extend_from_slice(key);
        insert_cell(self.page, Kind::Branch, idx, &cell)
    }

    /// Removes separator `idx` together with its left child pointer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if `idx` is out of bounds.
    pub fn delete(&mut self, idx: usize) -> Result<()> {
        remove_cell(self.page, idx)
    }
}
