//! B+ tree over fixed-size pages, used by the secondary indexes.
//!
//! The tree stores byte keys in sorted order. Leaves are linked left to right
//! so range scans read each leaf once. Deletion does not rebalance; underfull
//! leaves are merged later by [`BTree::compact`].
//!
//! ## Structure
//!
//! - `node.rs`: Slotted leaf and branch page layouts
//! - `cursor.rs`: Key ranges and cursor positioning
//! - `split.rs`: Node splitting and merging

/// Key ranges and cursor positioning.
pub mod cursor;
/// Slotted leaf and branch page layouts.
pub mod node;
/// Node splitting and merging.
pub mod split;

pub use cursor::{Bound, Range, prefix_successor};
use cursor::CursorPosition;
use node::{BranchNode, BranchNodeRef, LeafNode, LeafNodeRef, SearchResult, max_leaf_entry};
use split::{
    can_merge_leaves, insert_separator, leaf_fill_factor, merge_leaves, split_branch_for_key,
    split_leaf_for_key,
};

use crate::{
    error::{Error, PageId, PageType, Result},
    page::Page,
};

/// Page access for the tree.
///
/// Index files implement this over their page caches and journal; tests use
/// an in-memory map.
pub trait PageProvider {
    /// Reads a page by ID.
    fn read_page(&self, page_id: PageId) -> Result<Page>;

    /// Stores a modified page.
    fn write_page(&mut self, page: Page);

    /// Allocates a new page of the given type.
    fn allocate_page(&mut self, page_type: PageType) -> Page;

    /// Frees a page for later reuse.
    fn free_page(&mut self, page_id: PageId);

    /// Returns the page size.
    fn page_size(&self) -> usize;
}

/// Statistics returned by B+ tree compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Number of leaf page merges performed.
    pub pages_merged: u64,
    /// Number of pages freed (returned to the provider).
    pub pages_freed: u64,
}

type InsertOutcome = (Option<(Vec<u8>, PageId)>, Option<Vec<u8>>);

/// B+ tree rooted at one page of a [`PageProvider`].
pub struct BTree<P: PageProvider> {
    provider: P,
    /// Root page ID (0 = empty tree).
    root_page: PageId,
    split_count: u64,
}

impl<P: PageProvider> BTree<P> {
    /// Creates a tree accessor over `provider` rooted at `root_page`.
    pub fn new(root_page: PageId, provider: P) -> Self {
        Self { provider, root_page, split_count: 0 }
    }

    /// Returns the page provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns the page provider mutably.
    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Consumes the tree, returning its provider.
    pub fn into_provider(self) -> P {
        self.provider
    }

    /// Returns the number of page splits performed through this accessor.
    pub fn split_count(&self) -> u64 {
        self.split_count
    }

    /// Checks if the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.root_page == 0
    }

    /// Returns the root page ID.
    pub fn root_page(&self) -> PageId {
        self.root_page
    }

    /// Sets the root page ID.
    pub fn set_root_page(&mut self, page_id: PageId) {
        self.root_page = page_id;
    }

    /// Computes the depth (0 = empty, 1 = root is a leaf).
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a page is not a tree node.
    pub fn depth(&self) -> Result<u32> {
        if self.root_page == 0 {
            return Ok(0);
        }
        let mut depth = 1;
        let mut page_id = self.root_page;
        loop {
            let page = self.provider.read_page(page_id)?;
            match page.page_type()? {
                PageType::BTreeLeaf => return Ok(depth),
                PageType::BTreeBranch => {
                    page_id = leftmost_child(&BranchNodeRef::from_page(&page)?);
                    depth += 1;
                },
                other => return Err(unexpected_page(page_id, other)),
            }
        }
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root_page == 0 {
            return Ok(None);
        }
        let page = self.provider.read_page(self.find_leaf(key)?)?;
        let leaf = LeafNodeRef::from_page(&page)?;
        Ok(match leaf.search(key) {
            SearchResult::Found(idx) => Some(leaf.value(idx).to_vec()),
            SearchResult::NotFound(_) => None,
        })
    }

    fn find_leaf(&self, key: &[u8]) -> Result<PageId> {
        let mut current = self.root_page;
        loop {
            let page = self.provider.read_page(current)?;
            match page.page_type()? {
                PageType::BTreeLeaf => return Ok(current),
                PageType::BTreeBranch => {
                    current = BranchNodeRef::from_page(&page)?.child_for_key(key);
                },
                other => return Err(unexpected_page(current, other)),
            }
        }
    }

    fn find_first_leaf(&self) -> Result<PageId> {
        let mut current = self.root_page;
        loop {
            let page = self.provider.read_page(current)?;
            match page.page_type()? {
                PageType::BTreeLeaf => return Ok(current),
                PageType::BTreeBranch => {
                    current = leftmost_child(&BranchNodeRef::from_page(&page)?);
                },
                other => return Err(unexpected_page(current, other)),
            }
        }
    }

    fn new_leaf_page(&mut self) -> Page {
        let mut page = self.provider.allocate_page(PageType::BTreeLeaf);
        LeafNode::init(&mut page);
        page
    }

    fn new_branch_page(&mut self, rightmost_child: PageId) -> Page {
        let mut page = self.provider.allocate_page(PageType::BTreeBranch);
        BranchNode::init(&mut page, rightmost_child);
        page
    }

    /// Inserts or replaces `key`, returning the previous value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageFull`] if the entry exceeds half a page, or an
    /// error from the provider.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.len() + value.len() > max_leaf_entry(self.provider.page_size()) {
            return Err(Error::PageFull);
        }

        if self.root_page == 0 {
            let mut page = self.new_leaf_page();
            LeafNode::from_page(&mut page)?.insert(0, key, value)?;
            self.root_page = page.id;
            self.provider.write_page(page);
            return Ok(None);
        }

        let (promoted, old_value) = self.insert_recursive(self.root_page, key, value)?;
        if let Some((separator, right)) = promoted {
            let mut root = self.new_branch_page(right);
            BranchNode::from_page(&mut root)?.insert(0, &separator, self.root_page)?;
            self.root_page = root.id;
            self.provider.write_page(root);
        }
        Ok(old_value)
    }

    fn insert_recursive(
        &mut self,
        page_id: PageId,
        key: &[u8],
        value: &[u8],
    ) -> Result<InsertOutcome> {
        let mut page = self.provider.read_page(page_id)?;
        match page.page_type()? {
            PageType::BTreeLeaf => {
                let mut leaf = LeafNode::from_page(&mut page)?;
                let old_value = match leaf.search(key) {
                    SearchResult::Found(idx) => {
                        let old = leaf.value(idx).to_vec();
                        if leaf.update(idx, value) {
                            self.provider.write_page(page);
                            return Ok((None, Some(old)));
                        }
                        leaf.delete(idx)?;
                        Some(old)
                    },
                    SearchResult::NotFound(_) => None,
                };

                if leaf.can_insert(key, value) {
                    let idx = match leaf.search(key) {
                        SearchResult::Found(idx) | SearchResult::NotFound(idx) => idx,
                    };
                    leaf.insert(idx, key, value)?;
                    self.provider.write_page(page);
                    return Ok((None, old_value));
                }

                self.split_count += 1;
                let mut right = self.new_leaf_page();
                let split = split_leaf_for_key(&mut page, &mut right, key, value)?;
                self.provider.write_page(page);
                self.provider.write_page(right);
                Ok((Some((split.separator_key, split.new_page_id)), old_value))
            },
            PageType::BTreeBranch => {
                let child = BranchNodeRef::from_page(&page)?.child_for_key(key);
                let (promoted, old_value) = self.insert_recursive(child, key, value)?;
                let Some((separator, right_child)) = promoted else {
                    return Ok((None, old_value));
                };

                if BranchNode::from_page(&mut page)?.can_insert(&separator) {
                    insert_separator(&mut page, &separator, child, right_child)?;
                    self.provider.write_page(page);
                    return Ok((None, old_value));
                }

                self.split_count += 1;
                let mut right = self.new_branch_page(0);
                let split =
                    split_branch_for_key(&mut page, &mut right, &separator, child, right_child)?;
                self.provider.write_page(page);
                self.provider.write_page(right);
                Ok((Some((split.separator_key, split.new_page_id)), old_value))
            },
            other => Err(unexpected_page(page_id, other)),
        }
    }

    /// Deletes `key`, returning its former value.
    ///
    /// Leaves may become underfull or empty; run [`compact`](Self::compact)
    /// to merge them. An emptied root leaf is freed.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root_page == 0 {
            return Ok(None);
        }
        let leaf_id = self.find_leaf(key)?;
        let mut page = self.provider.read_page(leaf_id)?;
        let mut leaf = LeafNode::from_page(&mut page)?;
        let SearchResult::Found(idx) = leaf.search(key) else {
            return Ok(None);
        };
        let old_value = leaf.value(idx).to_vec();
        leaf.delete(idx)?;
        let now_empty = leaf.cell_count() == 0;

        if now_empty && leaf_id == self.root_page {
            self.provider.free_page(leaf_id);
            self.root_page = 0;
        } else {
            self.provider.write_page(page);
        }
        Ok(Some(old_value))
    }

    /// Creates an iterator over all entries in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial descent fails.
    pub fn iter(&self) -> Result<BTreeIterator<'_, P>> {
        BTreeIterator::new(self, Range::all())
    }

    /// Creates an iterator over the entries inside `range`.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial descent fails.
    pub fn range(&self, range: Range) -> Result<BTreeIterator<'_, P>> {
        BTreeIterator::new(self, range)
    }

    /// Returns the smallest entry.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn first(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.iter()?.next_entry()
    }

    /// Merges underfull leaves with their right sibling.
    ///
    /// Walks the leaf chain left to right. A leaf whose fill factor is below
    /// `min_fill_factor` absorbs its right neighbour when both share a parent
    /// and their live entries fit one page; the merged leaf is then checked
    /// against its new neighbour. A branch root left without separators is
    /// replaced by its only child.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn compact(&mut self, min_fill_factor: f64) -> Result<CompactionStats> {
        let mut stats = CompactionStats::default();
        if self.root_page == 0 {
            return Ok(stats);
        }
        if self.provider.read_page(self.root_page)?.page_type()? == PageType::BTreeLeaf {
            return Ok(stats);
        }

        let mut current_id = self.find_first_leaf()?;
        loop {
            let current = self.provider.read_page(current_id)?;
            let next_id = LeafNodeRef::from_page(&current)?.next_leaf();
            if next_id == 0 {
                break;
            }
            let next = self.provider.read_page(next_id)?;
            if leaf_fill_factor(&current)? >= min_fill_factor
                || !can_merge_leaves(&current, &next)?
            {
                current_id = next_id;
                continue;
            }

            let Some((parent_id, sep_idx)) = self.shared_parent(current_id, next_id)? else {
                current_id = next_id;
                continue;
            };

            let mut current = current;
            let mut next = next;
            merge_leaves(&mut current, &mut next)?;
            self.provider.write_page(current);
            self.provider.free_page(next_id);
            stats.pages_merged += 1;
            stats.pages_freed += 1;

            let mut parent = self.provider.read_page(parent_id)?;
            let remaining = {
                let mut branch = BranchNode::from_page(&mut parent)?;
                branch.delete(sep_idx)?;
                if sep_idx < branch.cell_count() {
                    branch.set_child(sep_idx, current_id);
                } else {
                    branch.set_rightmost_child(current_id);
                }
                branch.cell_count()
            };
            if remaining == 0 && parent_id == self.root_page {
                self.provider.free_page(parent_id);
                self.root_page = current_id;
                stats.pages_freed += 1;
            } else {
                self.provider.write_page(parent);
            }
        }
        Ok(stats)
    }

    /// Finds the branch holding both `left` and `right` as adjacent children,
    /// returning it with the index of the separator between them.
    fn shared_parent(&self, left: PageId, right: PageId) -> Result<Option<(PageId, usize)>> {
        let mut stack = vec![self.root_page];
        while let Some(page_id) = stack.pop() {
            let page = self.provider.read_page(page_id)?;
            if page.page_type()? != PageType::BTreeBranch {
                continue;
            }
            let branch = BranchNodeRef::from_page(&page)?;
            let count = branch.cell_count();
            let children: Vec<PageId> =
                (0..count).map(|i| branch.child(i)).chain([branch.rightmost_child()]).collect();
            if let Some(idx) = children.iter().position(|&c| c == left) {
                return Ok((children.get(idx + 1) == Some(&right)).then_some((page_id, idx)));
            }
            // Descend only into the subtree whose key span can contain `left`.
            let leaf_page = self.provider.read_page(left)?;
            let leaf = LeafNodeRef::from_page(&leaf_page)?;
            if leaf.cell_count() > 0 {
                stack.push(branch.child_for_key(leaf.key(0)));
            } else {
                stack.extend(children);
            }
        }
        Ok(None)
    }

    /// Counts every entry by walking the leaf chain.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn count_entries(&self) -> Result<u64> {
        if self.root_page == 0 {
            return Ok(0);
        }
        let mut total = 0u64;
        let mut leaf_id = self.find_first_leaf()?;
        while leaf_id != 0 {
            let page = self.provider.read_page(leaf_id)?;
            let leaf = LeafNodeRef::from_page(&page)?;
            total += leaf.cell_count() as u64;
            leaf_id = leaf.next_leaf();
        }
        Ok(total)
    }

    /// Collects the id of every page reachable from the root.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn reachable_pages(&self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        if self.root_page == 0 {
            return Ok(pages);
        }
        let mut stack = vec![self.root_page];
        while let Some(page_id) = stack.pop() {
            pages.push(page_id);
            let page = self.provider.read_page(page_id)?;
            if page.page_type()? == PageType::BTreeBranch {
                let branch = BranchNodeRef::from_page(&page)?;
                stack.extend((0..branch.cell_count()).map(|i| branch.child(i)));
                stack.push(branch.rightmost_child());
            }
        }
        Ok(pages)
    }
}

fn leftmost_child(branch: &BranchNodeRef<'_>) -> PageId {
    if branch.cell_count() > 0 { branch.child(0) } else { branch.rightmost_child() }
}

fn unexpected_page(page_id: PageId, found: PageType) -> Error {
    Error::corrupted(format!("page {page_id} has type {found:?} inside the tree"))
}

/// Iterator over B+ tree entries in key order.
///
/// Created by [`BTree::iter`] and [`BTree::range`]. Leaves are loaded on
/// demand by following `next_leaf` links; empty leaves are skipped.
pub struct BTreeIterator<'a, P: PageProvider> {
    tree: &'a BTree<P>,
    range: Range,
    position: CursorPosition,
    leaf: Option<Page>,
}

impl<'a, P: PageProvider> BTreeIterator<'a, P> {
    fn new(tree: &'a BTree<P>, range: Range) -> Result<Self> {
        let mut iter = Self { tree, range, position: CursorPosition::default(), leaf: None };
        iter.seek_to_start()?;
        Ok(iter)
    }

    fn seek_to_start(&mut self) -> Result<()> {
        if self.tree.root_page == 0 {
            self.position.invalidate();
            return Ok(());
        }

        let start = self.range.start_key().map(<[u8]>::to_vec);
        let leaf_id = match &start {
            Some(key) => self.tree.find_leaf(key)?,
            None => self.tree.find_first_leaf()?,
        };
        let page = self.tree.provider.read_page(leaf_id)?;
        let positioned = match &start {
            Some(key) => cursor::seek_in_leaf(&mut self.position, &page, key)?,
            None => cursor::first_in_leaf(&mut self.position, &page)?,
        };
        self.leaf = Some(page);
        if !positioned {
            self.next_leaf()?;
        }

        if let cursor::Bound::Excluded(bound) = &self.range.start {
            let bound = bound.clone();
            if self.peek()?.is_some_and(|(key, _)| key == bound) {
                self.advance()?;
            }
        }
        Ok(())
    }

    fn peek(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match &self.leaf {
            Some(page) => cursor::current(&self.position, page),
            None => Ok(None),
        }
    }

    /// Moves to the first entry of the next non-empty leaf.
    fn next_leaf(&mut self) -> Result<()> {
        loop {
            let Some(page) = &self.leaf else {
                self.position.invalidate();
                return Ok(());
            };
            let next_id = LeafNodeRef::from_page(page)?.next_leaf();
            if next_id == 0 {
                self.position.invalidate();
                self.leaf = None;
                return Ok(());
            }
            let page = self.tree.provider.read_page(next_id)?;
            let positioned = cursor::first_in_leaf(&mut self.position, &page)?;
            self.leaf = Some(page);
            if positioned {
                return Ok(());
            }
        }
    }

    fn advance(&mut self) -> Result<()> {
        let Some(page) = &self.leaf else {
            return Ok(());
        };
        let count = LeafNodeRef::from_page(page)?.cell_count();
        if self.position.valid && self.position.leaf_index + 1 < count {
            self.position.leaf_index += 1;
            return Ok(());
        }
        self.next_leaf()
    }

    /// Returns the next entry, or `None` past the end of the range.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails while moving between leaves.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some((key, value)) = self.peek()? else {
            return Ok(None);
        };
        if !self.range.before_end(&key) {
            self.position.invalidate();
            self.leaf = None;
            return Ok(None);
        }
        self.advance()?;
        Ok(Some((key, value)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::page::INDEX_PAGE_SIZE;

    /// Simple in-memory page provider for testing.
    struct TestPageProvider {
        pages: HashMap<PageId, Page>,
        next_page: PageId,
        freed: Vec<PageId>,
    }

    impl TestPageProvider {
        fn new() -> Self {
            Self { pages: HashMap::new(), next_page: 1, freed: Vec::new() }
        }
    }

    impl PageProvider for TestPageProvider {
        fn read_page(&self, page_id: PageId) -> Result<Page> {
            self.pages
                .get(&page_id)
                .cloned()
                .ok_or_else(|| Error::corrupted(format!("missing page {page_id}")))
        }

        fn write_page(&mut self, page: Page) {
            self.pages.insert(page.id, page);
        }

        fn allocate_page(&mut self, page_type: PageType) -> Page {
            let page_id = self.next_page;
            self.next_page += 1;
            Page::new(page_id, INDEX_PAGE_SIZE, page_type, 1)
        }

        fn free_page(&mut self, page_id: PageId) {
            self.pages.remove(&page_id);
            self.freed.push(page_id);
        }

        fn page_size(&self) -> usize {
            INDEX_PAGE_SIZE
        }
    }

    fn make_tree() -> BTree<TestPageProvider> {
        BTree::new(0, TestPageProvider::new())
    }

    fn collect_keys(tree: &BTree<TestPageProvider>, range: Range) -> Vec<Vec<u8>> {
        let mut iter = tree.range(range).unwrap();
        let mut keys = Vec::new();
        while let Some((k, _)) = iter.next_entry().unwrap() {
            keys.push(k);
        }
        keys
    }

    fn count_leaves(tree: &BTree<TestPageProvider>) -> usize {
        let mut leaf_id = tree.find_first_leaf().unwrap();
        let mut count = 0;
        while leaf_id != 0 {
            count += 1;
            let page = tree.provider().read_page(leaf_id).unwrap();
            leaf_id = LeafNodeRef::from_page(&page).unwrap().next_leaf();
        }
        count
    }

    #[test]
    fn test_empty_tree() {
        let tree = make_tree();
        assert!(tree.is_empty());
        assert_eq!(tree.depth().unwrap(), 0);
        assert_eq!(tree.get(b"key").unwrap(), None);
        assert_eq!(tree.first().unwrap(), None);
    }

    #[test]
    fn test_insert_get_update_delete() {
        let mut tree = make_tree();

        assert_eq!(tree.insert(b"key", b"value1").unwrap(), None);
        assert_eq!(tree.insert(b"key", b"value2").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(tree.insert(b"key", b"longer value").unwrap(), Some(b"value2".to_vec()));
        assert_eq!(tree.get(b"key").unwrap(), Some(b"longer value".to_vec()));

        assert_eq!(tree.delete(b"key").unwrap(), Some(b"longer value".to_vec()));
        assert_eq!(tree.get(b"key").unwrap(), None);
        assert_eq!(tree.delete(b"nonexistent").unwrap(), None);
        // Emptied root leaf is released.
        assert!(tree.is_empty());
    }

    #[test]
    fn test_many_inserts_split_and_grow() {
        let mut tree = make_tree();
        for i in 0..5000u32 {
            let key = format!("key{i:05}");
            tree.insert(key.as_bytes(), format!("value{i}").as_bytes()).unwrap();
        }
        assert!(tree.split_count() > 0);
        assert!(tree.depth().unwrap() >= 2);
        for i in 0..5000u32 {
            let key = format!("key{i:05}");
            assert_eq!(tree.get(key.as_bytes()).unwrap(), Some(format!("value{i}").into_bytes()));
        }
        assert_eq!(tree.count_entries().unwrap(), 5000);
    }

    #[test]
    fn test_large_keys_force_deep_tree() {
        let mut tree = make_tree();
        for i in 0..300u32 {
            let mut key = vec![b'k'; 2000];
            key.extend_from_slice(&i.to_be_bytes());
            tree.insert(&key, b"").unwrap();
        }
        assert!(tree.depth().unwrap() >= 3);
        assert_eq!(collect_keys(&tree, Range::all()).len(), 300);
    }

    #[test]
    fn test_range_iteration_cross_leaf() {
        let mut tree = make_tree();
        for i in 0u64..2000 {
            tree.insert(&i.to_be_bytes(), format!("value{i}").as_bytes()).unwrap();
        }

        let all = collect_keys(&tree, Range::all());
        assert_eq!(all.len(), 2000);
        for (idx, key) in all.iter().enumerate() {
            assert_eq!(key.as_slice(), (idx as u64).to_be_bytes());
        }

        let range = Range::new(&500u64.to_be_bytes(), &1500u64.to_be_bytes());
        let partial = collect_keys(&tree, range);
        assert_eq!(partial.len(), 1000);
        assert_eq!(partial[0], 500u64.to_be_bytes());

        let excluded = Range {
            start: cursor::Bound::Excluded(500u64.to_be_bytes().to_vec()),
            end: cursor::Bound::Included(600u64.to_be_bytes().to_vec()),
        };
        let keys = collect_keys(&tree, excluded);
        assert_eq!(keys.len(), 100);
        assert_eq!(keys[0], 501u64.to_be_bytes());
    }

    #[test]
    fn test_prefix_range_spans_leaves() {
        let mut tree = make_tree();
        for group in [b"a", b"b", b"c"] {
            for i in 0..800u32 {
                let mut key = group.to_vec();
                key.extend_from_slice(format!("{i:04}").as_bytes());
                tree.insert(&key, b"v").unwrap();
            }
        }
        let keys = collect_keys(&tree, Range::prefix(b"b"));
        assert_eq!(keys.len(), 800);
        assert!(keys.iter().all(|k| k[0] == b'b'));
    }

    #[test]
    fn test_oversized_entry_returns_page_full() {
        let mut tree = make_tree();
        let big = vec![0u8; INDEX_PAGE_SIZE];
        assert!(matches!(tree.insert(b"k", &big), Err(Error::PageFull)));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_iteration_skips_empty_leaves() {
        let mut tree = make_tree();
        for i in 0..3000u32 {
            tree.insert(format!("k{i:05}").as_bytes(), b"v").unwrap();
        }
        for i in 500..2500u32 {
            tree.delete(format!("k{i:05}").as_bytes()).unwrap();
        }
        let keys = collect_keys(&tree, Range::from(b"k00400"));
        assert_eq!(keys.len(), 100 + 500);
        assert_eq!(keys[100], b"k02500".to_vec());
    }

    #[test]
    fn test_compact_single_leaf_is_noop() {
        let mut tree = make_tree();
        tree.insert(b"a", b"1").unwrap();
        tree.insert(b"b", b"2").unwrap();
        assert_eq!(tree.compact(0.4).unwrap(), CompactionStats::default());
        assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_compact_after_bulk_delete() {
        let mut tree = make_tree();
        for i in 0..5000 {
            let (key, value) = (format!("key-{i:05}"), format!("val-{i:05}"));
            tree.insert(key.as_bytes(), value.as_bytes()).unwrap();
        }
        let leaves_before = count_leaves(&tree);
        for i in 0..4800 {
            tree.delete(format!("key-{i:05}").as_bytes()).unwrap();
        }

        let stats = tree.compact(0.4).unwrap();
        assert!(stats.pages_merged > 0);
        assert!(count_leaves(&tree) < leaves_before);
        assert_eq!(tree.provider().freed.len() as u64, stats.pages_freed);

        for i in 4800..5000 {
            let key = format!("key-{i:05}");
            assert_eq!(tree.get(key.as_bytes()).unwrap(), Some(format!("val-{i:05}").into_bytes()));
        }
        for i in 0..4800 {
            assert_eq!(tree.get(format!("key-{i:05}").as_bytes()).unwrap(), None);
        }
        assert_eq!(collect_keys(&tree, Range::all()).len(), 200);
    }

    #[test]
    fn test_compact_is_idempotent_and_tree_stays_usable() {
        let mut tree = make_tree();
        for i in 0..3000 {
            tree.insert(format!("key-{i:05}").as_bytes(), b"value").unwrap();
        }
        for i in (0..3000).filter(|i| i % 4 != 0) {
            tree.delete(format!("key-{i:05}").as_bytes()).unwrap();
        }

        tree.compact(0.4).unwrap();
        let second = tree.compact(0.4).unwrap();
        assert_eq!(second.pages_merged, 0);

        for i in 0..3000 {
            tree.insert(format!("new-{i:05}").as_bytes(), b"v").unwrap();
        }
        assert_eq!(tree.count_entries().unwrap(), 750 + 3000);
        let keys = collect_keys(&tree, Range::all());
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_reachable_pages_excludes_freed() {
        let mut tree = make_tree();
        for i in 0..2000u32 {
            tree.insert(format!("{i:06}").as_bytes(), &[1u8; 64]).unwrap();
        }
        for i in 0..1900u32 {
            tree.delete(format!("{i:06}").as_bytes()).unwrap();
        }
        tree.compact(0.5).unwrap();
        let reachable = tree.reachable_pages().unwrap();
        for freed in &tree.provider().freed {
            assert!(!reachable.contains(freed));
        }
        assert_eq!(reachable.len(), tree.provider().pages.len());
    }

    mod proptest_btree {
        use std::collections::{BTreeMap, HashSet};

        use proptest::prelude::*;

        use super::*;

        fn arb_kv_pairs(max_count: usize) -> impl Strategy<Value = BTreeMap<Vec<u8>, Vec<u8>>> {
            proptest::collection::btree_map(
                proptest::collection::vec(any::<u8>(), 1..64),
                proptest::collection::vec(any::<u8>(), 0..128),
                1..max_count,
            )
        }

        proptest! {
            #[test]
            fn prop_inserted_keys_retrievable_and_sorted(pairs in arb_kv_pairs(400)) {
                let mut tree = make_tree();
                for (key, value) in &pairs {
                    tree.insert(key, value).unwrap();
                }
                for (key, value) in &pairs {
                    let stored = tree.get(key).unwrap();
                    prop_assert_eq!(stored.as_ref(), Some(value));
                }
                let keys = collect_keys(&tree, Range::all());
                let expected: Vec<Vec<u8>> = pairs.keys().cloned().collect();
                prop_assert_eq!(keys, expected);
            }

            #[test]
            fn prop_delete_then_compact_matches_model(
                pairs in arb_kv_pairs(400),
                delete_indices in proptest::collection::vec(any::<prop::sample::Index>(), 1..200),
            ) {
                let mut tree = make_tree();
                for (key, value) in &pairs {
                    tree.insert(key, value).unwrap();
                }
                let keys: Vec<&Vec<u8>> = pairs.keys().collect();
                let mut deleted = HashSet::new();
                for idx in &delete_indices {
                    let key = keys[idx.index(keys.len())];
                    tree.delete(key).unwrap();
                    deleted.insert(key.clone());
                }
                tree.compact(0.5).unwrap();

                let expected: Vec<Vec<u8>> =
                    pairs.keys().filter(|k| !deleted.contains(*k)).cloned().collect();
                prop_assert_eq!(collect_keys(&tree, Range::all()), expected);
                for (key, value) in &pairs {
                    let got = tree.get(key).unwrap();
                    if deleted.contains(key) {
                        prop_assert_eq!(got, None);
                    } else {
                        prop_assert_eq!(got.as_ref(), Some(value));
                    }
                }
            }

            #[test]
            fn prop_prefix_range_matches_filter(
                pairs in arb_kv_pairs(300),
                prefix in proptest::collection::vec(any::<u8>(), 0..2),
            ) {
                let mut tree = make_tree();
                for (key, value) in &pairs {
                    tree.insert(key, value).unwrap();
                }
                let expected: Vec<Vec<u8>> =
                    pairs.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
                prop_assert_eq!(collect_keys(&tree, Range::prefix(&prefix)), expected);
            }
        }
    }
}
