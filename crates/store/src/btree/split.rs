//! Node splitting, merging, and fill factor analysis for the B+ tree.
//!
//! ## Splitting
//!
//! A split gathers every live entry of the full node plus the entry being
//! inserted, then picks the split point that balances bytes between the two
//! halves while keeping both within page capacity. Entry counts are a poor
//! guide here: index keys vary from a few bytes to a couple of kilobytes.
//!
//! - Leaf split: the first key of the right half is copied up as the
//!   separator; the new page is linked into the leaf chain after the original.
//! - Branch split: the middle separator moves up and its left child becomes
//!   the rightmost child of the left half.
//!
//! ## Merging
//!
//! `merge_leaves` rebuilds the left page from the live entries of both
//! siblings, dropping dead cell space left by deletions.

use super::node::{
    BranchNode, BranchNodeRef, LeafNode, LeafNodeRef, branch_cell_size, leaf_cell_size, leaf_fill,
    node_capacity,
};
use crate::{
    error::{Error, PageId, Result},
    page::Page,
};

/// Result of splitting a node.
#[derive(Debug)]
pub struct SplitResult {
    /// The page ID of the new (right) node.
    pub new_page_id: PageId,
    /// The separator key to insert into the parent.
    pub separator_key: Vec<u8>,
}

/// Picks the index of the first right-hand entry so that both halves fit and
/// their byte sizes are as close as possible.
fn balanced_split_point(sizes: &[usize], capacity: usize, promote_middle: bool) -> Option<usize> {
    let total: usize = sizes.iter().sum();
    let mut left = 0usize;
    let mut best: Option<(usize, usize)> = None;
    for split in 1..sizes.len() {
        left += sizes[split - 1];
        let right = if promote_middle { total - left - sizes[split] } else { total - left };
        if left > capacity || right > capacity {
            continue;
        }
        let skew = left.abs_diff(right);
        if best.is_none_or(|(_, s)| skew < s) {
            best = Some((split, skew));
        }
    }
    best.map(|(split, _)| split)
}

/// Splits a full leaf while inserting `key`/`value`.
///
/// `original` keeps the lower half and `new_page` (freshly allocated) takes
/// the upper half. If `key` is already present its value is replaced.
///
/// # Errors
///
/// Returns [`Error::PageFull`] if no split point lets both halves fit, which
/// only happens for entries close to the page size.
pub fn split_leaf_for_key(
    original: &mut Page,
    new_page: &mut Page,
    key: &[u8],
    value: &[u8],
) -> Result<SplitResult> {
    let (mut entries, next_leaf) = {
        let leaf = LeafNodeRef::from_page(original)?;
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..leaf.cell_count())
            .map(|i| {
                let (k, v) = leaf.get(i);
                (k.to_vec(), v.to_vec())
            })
            .collect();
        (entries, leaf.next_leaf())
    };

    match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
        Ok(idx) => entries[idx].1 = value.to_vec(),
        Err(idx) => entries.insert(idx, (key.to_vec(), value.to_vec())),
    }

    let sizes: Vec<usize> = entries.iter().map(|(k, v)| leaf_cell_size(k, v)).collect();
    let split = balanced_split_point(&sizes, node_capacity(original.size()), false)
        .ok_or(Error::PageFull)?;

    LeafNode::init(original);
    LeafNode::init(new_page);
    {
        let mut left = LeafNode::from_page(original)?;
        for (i, (k, v)) in entries[..split].iter().enumerate() {
            left.insert(i, k, v)?;
        }
        left.set_next_leaf(new_page.id);
    }
    {
        let mut right = LeafNode::from_page(new_page)?;
        for (i, (k, v)) in entries[split..].iter().enumerate() {
            right.insert(i, k, v)?;
        }
        right.set_next_leaf(next_leaf);
    }

    Ok(SplitResult { new_page_id: new_page.id, separator_key: entries[split].0.clone() })
}

/// Inserts separator `key` into a branch during a child split.
///
/// `left_child` is the child that split (it keeps keys below `key`) and
/// `right_child` the page created by the split.
///
/// # Errors
///
/// Returns [`Error::PageFull`] if the separator does not fit.
pub fn insert_separator(
    page: &mut Page,
    key: &[u8],
    left_child: PageId,
    right_child: PageId,
) -> Result<()> {
    let mut branch = BranchNode::from_page(page)?;
    let idx = branch.insertion_index(key);
    let count = branch.cell_count();
    branch.insert(idx, key, left_child)?;
    if idx == count {
        branch.set_rightmost_child(right_child);
    } else {
        branch.set_child(idx + 1, right_child);
    }
    Ok(())
}

/// Splits a full branch while inserting separator `key`.
///
/// # Errors
///
/// Returns [`Error::PageFull`] if no split point lets both halves fit.
pub fn split_branch_for_key(
    original: &mut Page,
    new_page: &mut Page,
    key: &[u8],
    left_child: PageId,
    right_child: PageId,
) -> Result<SplitResult> {
    let (mut entries, mut rightmost) = {
        let branch = BranchNodeRef::from_page(original)?;
        let entries: Vec<(Vec<u8>, PageId)> =
            (0..branch.cell_count()).map(|i| (branch.key(i).to_vec(), branch.child(i))).collect();
        (entries, branch.rightmost_child())
    };

    let idx = match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
        Ok(idx) | Err(idx) => idx,
    };
    entries.insert(idx, (key.to_vec(), left_child));
    if idx + 1 < entries.len() {
        entries[idx + 1].1 = right_child;
    } else {
        rightmost = right_child;
    }

    let sizes: Vec<usize> = entries.iter().map(|(k, _)| branch_cell_size(k)).collect();
    let mid = balanced_split_point(&sizes, node_capacity(original.size()), true)
        .ok_or(Error::PageFull)?;

    BranchNode::init(original, entries[mid].1);
    BranchNode::init(new_page, rightmost);
    {
        let mut left = BranchNode::from_page(original)?;
        for (i, (k, child)) in entries[..mid].iter().enumerate() {
            left.insert(i, k, *child)?;
        }
    }
    {
        let mut right = BranchNode::from_page(new_page)?;
        for (i, (k, child)) in entries[mid + 1..].iter().enumerate() {
            right.insert(i, k, *child)?;
        }
    }

    Ok(SplitResult { new_page_id: new_page.id, separator_key: entries[mid].0.clone() })
}

/// Moves every entry of `right` into `left` and unlinks `right` from the
/// leaf chain. The caller frees `right`.
///
/// # Errors
///
/// Returns an error if either page is not a leaf, or [`Error::PageFull`] if
/// the entries do not fit (check [`can_merge_leaves`] first).
pub fn merge_leaves(left: &mut Page, right: &mut Page) -> Result<()> {
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for page in [&*left, &*right] {
        let leaf = LeafNodeRef::from_page(page)?;
        entries.extend((0..leaf.cell_count()).map(|i| {
            let (k, v) = leaf.get(i);
            (k.to_vec(), v.to_vec())
        }));
    }
    let next = LeafNodeRef::from_page(right)?.next_leaf();

    LeafNode::init(left);
    let mut node = LeafNode::from_page(left)?;
    for (i, (k, v)) in entries.iter().enumerate() {
        node.insert(i, k, v)?;
    }
    node.set_next_leaf(next);

    LeafNode::init(right);
    Ok(())
}

/// Calculates the fill factor of a leaf node (0.0 to 1.0) from live cells.
///
/// # Errors
///
/// Returns an error if the page is not a leaf.
pub fn leaf_fill_factor(page: &Page) -> Result<f64> {
    LeafNodeRef::from_page(page)?;
    Ok(leaf_fill(page))
}

/// Checks whether the live entries of two leaves fit into one page.
///
/// # Errors
///
/// Returns an error if either page is not a leaf.
pub fn can_merge_leaves(left: &Page, right: &Page) -> Result<bool> {
    let mut total = 0usize;
    for page in [left, right] {
        let leaf = LeafNodeRef::from_page(page)?;
        total += (0..leaf.cell_count())
            .map(|i| {
                let (k, v) = leaf.get(i);
                leaf_cell_size(k, v)
            })
            .sum::<usize>();
    }
    Ok(total <= node_capacity(left.size()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{error::PageType, page::INDEX_PAGE_SIZE};

    fn leaf(id: PageId) -> Page {
        let mut page = Page::new(id, INDEX_PAGE_SIZE, PageType::BTreeLeaf, 1);
        LeafNode::init(&mut page);
        page
    }

    fn fill_leaf(page: &mut Page, count: u8, value_len: usize) {
        let mut node = LeafNode::from_page(page).unwrap();
        for i in 0..count {
            node.insert(i as usize, &[i * 2], &vec![i; value_len]).unwrap();
        }
    }

    #[test]
    fn test_leaf_split_balances_and_links() {
        let mut original = leaf(1);
        let mut new_page = leaf(2);
        fill_leaf(&mut original, 8, 900);
        LeafNode::from_page(&mut original).unwrap().set_next_leaf(77);

        let result = split_leaf_for_key(&mut original, &mut new_page, &[5], &[1; 900]).unwrap();

        let left = LeafNodeRef::from_page(&original).unwrap();
        let right = LeafNodeRef::from_page(&new_page).unwrap();
        assert_eq!(left.cell_count() + right.cell_count(), 9);
        assert!(left.cell_count().abs_diff(right.cell_count()) <= 1);
        assert_eq!(result.separator_key, right.key(0));
        assert!(left.key(left.cell_count() - 1) < right.key(0));
        assert_eq!(left.next_leaf(), 2);
        assert_eq!(right.next_leaf(), 77);
    }

    #[test]
    fn test_leaf_split_places_large_entry() {
        let mut original = leaf(1);
        let mut new_page = leaf(2);
        fill_leaf(&mut original, 3, 2600);
        let big = vec![9u8; 7000];

        let result = split_leaf_for_key(&mut original, &mut new_page, &[1], &big);
        // 3 * 2600 + 7000 bytes cannot be divided into two pages around key 1.
        assert!(matches!(result, Err(Error::PageFull)));
    }

    #[test]
    fn test_branch_split_promotes_middle() {
        let mut original = Page::new(1, INDEX_PAGE_SIZE, PageType::BTreeBranch, 1);
        BranchNode::init(&mut original, 1000);
        {
            let mut node = BranchNode::from_page(&mut original).unwrap();
            for i in 0..6u8 {
                node.insert(i as usize, &[i * 10; 1200], 100 + u64::from(i)).unwrap();
            }
        }
        let mut new_page = Page::new(2, INDEX_PAGE_SIZE, PageType::BTreeBranch, 1);
        // The rightmost child split; the new page takes keys from the separator up.
        let sep = [55u8; 1200];
        let result = split_branch_for_key(&mut original, &mut new_page, &sep, 1000, 200).unwrap();

        let left = BranchNodeRef::from_page(&original).unwrap();
        let right = BranchNodeRef::from_page(&new_page).unwrap();
        assert_eq!(left.cell_count() + right.cell_count(), 6);
        assert!(left.key(left.cell_count() - 1) < result.separator_key.as_slice());
        assert!(result.separator_key.as_slice() < right.key(0));
        assert_eq!(right.rightmost_child(), 200);

        let children: Vec<PageId> = (0..left.cell_count())
            .map(|i| left.child(i))
            .chain([left.rightmost_child()])
            .chain((0..right.cell_count()).map(|i| right.child(i)))
            .chain([right.rightmost_child()])
            .collect();
        assert_eq!(children, vec![100, 101, 102, 103, 104, 105, 1000, 200]);
    }

    #[test]
    fn test_insert_separator_rewires_children() {
        let mut page = Page::new(1, INDEX_PAGE_SIZE, PageType::BTreeBranch, 1);
        BranchNode::init(&mut page, 9);
        insert_separator(&mut page, b"m", 9, 10).unwrap();
        insert_separator(&mut page, b"d", 9, 11).unwrap();

        let node = BranchNodeRef::from_page(&page).unwrap();
        assert_eq!((node.child(0), node.child(1), node.rightmost_child()), (9, 11, 10));
    }

    #[test]
    fn test_merge_and_fill_factor() {
        let mut left = leaf(1);
        let mut right = leaf(2);
        fill_leaf(&mut left, 2, 500);
        {
            let mut node = LeafNode::from_page(&mut right).unwrap();
            node.insert(0, b"zz", b"tail").unwrap();
            node.set_next_leaf(3);
        }
        assert!(leaf_fill_factor(&left).unwrap() < 0.2);
        assert!(can_merge_leaves(&left, &right).unwrap());

        merge_leaves(&mut left, &mut right).unwrap();
        let merged = LeafNodeRef::from_page(&left).unwrap();
        assert_eq!(merged.cell_count(), 3);
        assert_eq!(merged.key(2), b"zz");
        assert_eq!(merged.next_leaf(), 3);
    }

    #[test]
    fn test_cannot_merge_full_leaves() {
        let mut left = leaf(1);
        let mut right = leaf(2);
        fill_leaf(&mut left, 5, 1000);
        fill_leaf(&mut right, 5, 1000);
        assert!(!can_merge_leaves(&left, &right).unwrap());
    }
}
