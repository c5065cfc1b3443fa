//! Key ranges and forward iteration over the leaf chain.
//!
//! A [`BTreeIterator`](super::BTreeIterator) descends once to the first leaf
//! of its range and then follows `next_leaf` links, so a scan reads each leaf
//! exactly once.

use super::node::{LeafNodeRef, SearchResult};
use crate::{
    error::{PageId, Result},
    page::Page,
};

/// One end of a key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    /// No limit on this side.
    Unbounded,
    /// The key itself is part of the range.
    Included(Vec<u8>),
    /// The range stops just short of the key.
    Excluded(Vec<u8>),
}

/// A range of keys in byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    /// Lower end.
    pub start: Bound,
    /// Upper end.
    pub end: Bound,
}

impl Range {
    /// Every key.
    pub fn all() -> Self {
        Self { start: Bound::Unbounded, end: Bound::Unbounded }
    }

    /// The half-open range `[start, end)`.
    pub fn new(start: &[u8], end: &[u8]) -> Self {
        Self { start: Bound::Included(start.to_vec()), end: Bound::Excluded(end.to_vec()) }
    }

    /// Every key at or above `start`.
    pub fn from(start: &[u8]) -> Self {
        Self { start: Bound::Included(start.to_vec()), end: Bound::Unbounded }
    }

    /// Every key that starts with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        let end = match prefix_successor(prefix) {
            Some(next) => Bound::Excluded(next),
            None => Bound::Unbounded,
        };
        Self { start: Bound::Included(prefix.to_vec()), end }
    }

    /// Checks if `key` lies inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Unbounded => true,
            Bound::Included(start) => key >= start.as_slice(),
            Bound::Excluded(start) => key > start.as_slice(),
        };
        after_start && self.before_end(key)
    }

    /// Checks the upper end only; a forward scan stops at the first failure.
    pub fn before_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => true,
            Bound::Included(end) => key <= end.as_slice(),
            Bound::Excluded(end) => key < end.as_slice(),
        }
    }

    pub(crate) fn start_key(&self) -> Option<&[u8]> {
        match &self.start {
            Bound::Unbounded => None,
            Bound::Included(k) | Bound::Excluded(k) => Some(k),
        }
    }
}

/// Smallest key greater than every key with this prefix, if one exists.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < u8::MAX {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}

/// Position of a cursor inside the current leaf.
#[derive(Debug, Clone, Default)]
pub struct CursorPosition {
    /// Leaf the cursor is on.
    pub leaf_page_id: Option<PageId>,
    /// Cell index inside that leaf.
    pub leaf_index: usize,
    /// False once the cursor ran off the end.
    pub valid: bool,
}

impl CursorPosition {
    /// Checks if the cursor points at an entry.
    pub fn is_valid(&self) -> bool {
        self.valid && self.leaf_page_id.is_some()
    }

    /// Marks the cursor exhausted.
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.leaf_page_id = None;
    }
}

/// Positions the cursor on the first entry at or after `key` inside `page`.
///
/// Returns true if such an entry exists in this leaf.
pub(crate) fn seek_in_leaf(position: &mut CursorPosition, page: &Page, key: &[u8]) -> Result<bool> {
    let leaf = LeafNodeRef::from_page(page)?;
    let idx = match leaf.search(key) {
        SearchResult::Found(idx) | SearchResult::NotFound(idx) => idx,
    };
    position.leaf_page_id = Some(page.id);
    position.leaf_index = idx;
    position.valid = idx < leaf.cell_count();
    Ok(position.valid)
}

/// Positions the cursor on the first entry of `page`.
pub(crate) fn first_in_leaf(position: &mut CursorPosition, page: &Page) -> Result<bool> {
    let leaf = LeafNodeRef::from_page(page)?;
    position.leaf_page_id = Some(page.id);
    position.leaf_index = 0;
    position.valid = leaf.cell_count() > 0;
    Ok(position.valid)
}

/// Returns the entry under the cursor.
pub(crate) fn current(
    position: &CursorPosition,
    page: &Page,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    if !position.valid || position.leaf_page_id != Some(page.id) {
        return Ok(None);
    }
    let leaf = LeafNodeRef::from_page(page)?;
    if position.leaf_index >= leaf.cell_count() {
        return Ok(None);
    }
    let (key, value) = leaf.get(position.leaf_index);
    Ok(Some((key.to_vec(), value.to_vec())))
}
