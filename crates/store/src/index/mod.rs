//! Secondary indexes.
//!
//! One index covers one column. Its entries live in a B+ tree stored in a
//! separate index file; every entry key is `derived ++ primary_key` with an
//! empty value, so the postings of a derived key are the contiguous range
//! sharing it as a prefix. See [`keys`] for the derivations.

pub mod file;
pub mod keys;

use std::{
    collections::BTreeSet,
    ffi::OsString,
    fmt::Write as _,
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use self::file::{INDEX_HEADER_SIZE, INDEX_MAGIC, IndexFile, IndexFileSnapshot, IndexHeader};
use crate::{
    backend::{Journal, Savepoint, StorageBackend},
    btree::{BTree, CompactionStats, PageProvider, Range},
    cache::CacheStats,
    error::{PageId, Result},
};

/// How an index derives its keys from column values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// The whole value, compared byte-wise.
    Lexical,
    /// The value parsed as a decimal number.
    Decimal,
    /// Every whitespace- or comma-separated token.
    Token,
    /// Every 2-character shingle, for substring search.
    QGram,
}

impl IndexKind {
    pub(crate) fn id(self) -> u8 {
        match self {
            Self::Lexical => 0,
            Self::Decimal => 1,
            Self::Token => 2,
            Self::QGram => 3,
        }
    }

    pub(crate) fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Lexical),
            1 => Some(Self::Decimal),
            2 => Some(Self::Token),
            3 => Some(Self::QGram),
            _ => None,
        }
    }

    /// File name suffix of an index of this kind.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Lexical => "lex",
            Self::Decimal => "dec",
            Self::Token => "tok",
            Self::QGram => "qgr",
        }
    }
}

/// The combined index maintenance entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCommand {
    /// Build an index of this kind, replacing any index on the column.
    Define(IndexKind),
    /// Build an index of this kind unless the column already has one.
    DefineKeep(IndexKind),
    /// Compact the column's index.
    Optimize,
    /// Drop the column's index.
    Remove,
}

/// Index statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    /// Number of tree entries.
    pub entries: u64,
    /// Records whose indexed value was cut to the indexed length.
    pub truncated: u64,
    /// Pages allocated in the file.
    pub pages: u64,
    /// Pages waiting for reuse.
    pub free_pages: usize,
    /// Leaf page cache.
    pub leaf_cache: CacheStats,
    /// Branch page cache.
    pub nonleaf_cache: CacheStats,
}

/// State needed to undo index changes back to a point in a unit of work.
pub struct IndexCheckpoint {
    savepoint: Savepoint,
    file: IndexFileSnapshot,
}

/// Path of the index file for `column` next to the main file at `base`.
///
/// Bytes of the column name outside `[A-Za-z0-9]` are written as `%xx`.
pub fn index_path(base: &Path, column: &str, kind: IndexKind) -> PathBuf {
    let mut escaped = String::with_capacity(column.len());
    for byte in column.bytes() {
        if byte.is_ascii_alphanumeric() {
            escaped.push(char::from(byte));
        } else {
            let _ = write!(escaped, "%{byte:02x}");
        }
    }
    let mut name = OsString::from(base.as_os_str());
    name.push(format!(".idx.{escaped}.{}", kind.suffix()));
    PathBuf::from(name)
}

/// Path of the journal belonging to `file`.
pub fn journal_path(file: &Path) -> PathBuf {
    let mut name = OsString::from(file.as_os_str());
    name.push(".wal");
    PathBuf::from(name)
}

/// A secondary index on one column.
pub struct Index<B: StorageBackend> {
    column: String,
    kind: IndexKind,
    path: Option<PathBuf>,
    tree: RwLock<BTree<IndexFile<B>>>,
}

impl<B: StorageBackend> Index<B> {
    /// Creates an empty index.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be initialized.
    pub fn create(
        column: &str,
        kind: IndexKind,
        journal: Journal<B>,
        leaf_cache: usize,
        nonleaf_cache: usize,
    ) -> Result<Self> {
        let file = IndexFile::create(journal, kind, leaf_cache, nonleaf_cache)?;
        let tree = RwLock::new(BTree::new(0, file));
        Ok(Self { column: column.to_string(), kind, path: None, tree })
    }

    /// Opens an existing index.
    ///
    /// After an unclean shutdown the persisted free list cannot be trusted;
    /// it is rebuilt from the pages the tree does not reach.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Metadata`](crate::Error::Metadata) if the file is not
    /// an index of `kind`, or a page error if the rebuild walk fails.
    pub fn open(
        column: &str,
        kind: IndexKind,
        journal: Journal<B>,
        leaf_cache: usize,
        nonleaf_cache: usize,
        clean: bool,
    ) -> Result<Self> {
        let file = IndexFile::open(journal, leaf_cache, nonleaf_cache, clean)?;
        if file.header().kind != kind {
            return Err(crate::Error::metadata(format!(
                "index file for column {column:?} holds a {:?} index, catalog says {kind:?}",
                file.header().kind
            )));
        }
        let mut tree = BTree::new(file.header().root, file);
        if !clean {
            let total = tree.provider().header().total_pages;
            let reachable: BTreeSet<PageId> = tree.reachable_pages()?.into_iter().collect();
            let free: Vec<PageId> = (1..total).filter(|id| !reachable.contains(id)).collect();
            debug!(column, free = free.len(), "Rebuilt index free list");
            tree.provider_mut().set_free_pages(free);
        }
        Ok(Self { column: column.to_string(), kind, path: None, tree: RwLock::new(tree) })
    }

    /// Records the file path, used by [`Index::path`].
    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// The indexed column.
    pub fn column(&self) -> &str {
        &self.column
    }

    /// The index kind.
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// The index file path, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of tree entries.
    pub fn entry_count(&self) -> u64 {
        self.tree.read().provider().header().entry_count
    }

    /// True when no indexed value was ever truncated, so index order equals
    /// value order.
    pub fn is_exact(&self) -> bool {
        self.tree.read().provider().header().truncated == 0
    }

    /// Replaces the entries derived from `old` with those derived from `new`.
    ///
    /// `None` means the record (or its column) is absent on that side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageFull`](crate::Error::PageFull) if an entry is too
    /// large for a page, or a page error.
    pub fn update(&self, primary_key: &[u8], old: Option<&[u8]>, new: Option<&[u8]>) -> Result<()> {
        let (old_keys, old_truncated) = match old {
            Some(value) => keys::derived_keys(self.kind, value),
            None => (BTreeSet::new(), false),
        };
        let (new_keys, new_truncated) = match new {
            Some(value) => keys::derived_keys(self.kind, value),
            None => (BTreeSet::new(), false),
        };

        let mut tree = self.tree.write();
        let mut removed = 0u64;
        let mut added = 0u64;
        for derived in old_keys.difference(&new_keys) {
            if tree.delete(&keys::entry_key(derived, primary_key))?.is_some() {
                removed += 1;
            }
        }
        for derived in new_keys.difference(&old_keys) {
            if tree.insert(&keys::entry_key(derived, primary_key), &[])?.is_none() {
                added += 1;
            }
        }

        let header = tree.provider_mut().header_mut();
        header.entry_count = (header.entry_count + added).saturating_sub(removed);
        if old.is_some() && old_truncated {
            header.truncated = header.truncated.saturating_sub(1);
        }
        if new.is_some() && new_truncated {
            header.truncated += 1;
        }
        Ok(())
    }

    /// Primary keys of the entries inside `range`, deduplicated.
    ///
    /// # Errors
    ///
    /// Returns a page error, or [`Error::Corrupted`](crate::Error::Corrupted)
    /// for a malformed entry.
    pub fn primary_keys(&self, range: Range) -> Result<BTreeSet<Vec<u8>>> {
        let tree = self.tree.read();
        let mut iter = tree.range(range)?;
        let mut out = BTreeSet::new();
        while let Some((entry, _)) = iter.next_entry()? {
            let (_, primary_key) = keys::split_entry(self.kind, &entry)?;
            out.insert(primary_key.to_vec());
        }
        Ok(out)
    }

    /// Primary keys in index order, ascending by `(derived key, primary key)`.
    ///
    /// # Errors
    ///
    /// Returns a page error.
    pub fn ordered_keys(&self) -> Result<Vec<Vec<u8>>> {
        let tree = self.tree.read();
        let mut iter = tree.iter()?;
        let mut out = Vec::new();
        while let Some((entry, _)) = iter.next_entry()? {
            out.push(keys::split_entry(self.kind, &entry)?.1.to_vec());
        }
        Ok(out)
    }

    /// Merges underfull leaves and frees emptied pages.
    ///
    /// # Errors
    ///
    /// Returns a page error.
    pub fn compact(&self) -> Result<CompactionStats> {
        let mut tree = self.tree.write();
        let stats = tree.compact(0.5)?;
        let root = tree.root_page();
        tree.provider_mut().flush(root)?;
        info!(column = %self.column, merged = stats.pages_merged, freed = stats.pages_freed,
            "Compacted index");
        Ok(stats)
    }

    /// Drops every entry, returning the pages to the free list.
    ///
    /// # Errors
    ///
    /// Returns a page error.
    pub fn clear(&self) -> Result<()> {
        let mut tree = self.tree.write();
        for page_id in tree.reachable_pages()? {
            tree.provider_mut().free_page(page_id);
        }
        tree.set_root_page(0);
        let header = tree.provider_mut().header_mut();
        header.entry_count = 0;
        header.truncated = 0;
        tree.provider_mut().flush(0)
    }

    /// Writes modified pages and the header through the journal.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if a write fails.
    pub fn flush(&self) -> Result<()> {
        let mut tree = self.tree.write();
        let root = tree.root_page();
        tree.provider_mut().flush(root)
    }

    /// Persists the free list and forces the file to stable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if a write or the sync fails.
    pub fn sync(&self) -> Result<()> {
        let mut tree = self.tree.write();
        let root = tree.root_page();
        tree.provider_mut().persist_free_list(root)?;
        tree.provider().journal().data().sync()
    }

    /// Opens a unit of work on the index journal, returning the checkpoint
    /// that [`Index::rollback`] undoes to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Threading`](crate::Error::Threading) if a unit is
    /// already open.
    pub fn begin(&self, sequence: u64) -> Result<IndexCheckpoint> {
        let mut tree = self.tree.write();
        let root = tree.root_page();
        tree.provider_mut().flush(root)?;
        tree.provider_mut().set_sequence(sequence);
        let journal = tree.provider().journal();
        journal.begin(sequence)?;
        let savepoint = journal.savepoint()?;
        Ok(IndexCheckpoint { savepoint, file: tree.provider().snapshot() })
    }

    /// Flushes pending pages and marks a point to roll back to.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the flush fails.
    pub fn checkpoint(&self) -> Result<IndexCheckpoint> {
        let mut tree = self.tree.write();
        let root = tree.root_page();
        tree.provider_mut().flush(root)?;
        let savepoint = tree.provider().journal().savepoint()?;
        Ok(IndexCheckpoint { savepoint, file: tree.provider().snapshot() })
    }

    /// Undoes every change since `checkpoint`, keeping the unit open.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the journal cannot be replayed.
    pub fn rollback_to(&self, checkpoint: IndexCheckpoint) -> Result<()> {
        let mut tree = self.tree.write();
        tree.provider().journal().rollback_to(checkpoint.savepoint)?;
        self.reload(&mut tree, checkpoint.file)
    }

    /// Undoes the whole unit and closes it. `checkpoint` must be the one
    /// returned by [`Index::begin`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the journal cannot be replayed.
    pub fn rollback(&self, checkpoint: IndexCheckpoint) -> Result<()> {
        let mut tree = self.tree.write();
        tree.provider().journal().rollback()?;
        self.reload(&mut tree, checkpoint.file)
    }

    fn reload(&self, tree: &mut BTree<IndexFile<B>>, snapshot: IndexFileSnapshot) -> Result<()> {
        tree.provider_mut().reload(snapshot)?;
        let root = tree.provider().header().root;
        tree.set_root_page(root);
        Ok(())
    }

    /// Forces the index file to stable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    pub fn sync_data(&self) -> Result<()> {
        self.tree.read().provider().journal().data().sync()
    }

    /// Closes the unit, making its writes permanent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the log cannot be truncated.
    pub fn complete(&self, sync: bool) -> Result<()> {
        self.tree.read().provider().journal().complete(sync)
    }

    /// Statistics for this index.
    pub fn stats(&self) -> IndexStats {
        let tree = self.tree.read();
        let file = tree.provider();
        let (leaf_cache, nonleaf_cache) = file.cache_stats();
        IndexStats {
            entries: file.header().entry_count,
            truncated: file.header().truncated,
            pages: file.header().total_pages.saturating_sub(1),
            free_pages: file.free_page_count(),
            leaf_cache,
            nonleaf_cache,
        }
    }

    /// Consumes the index, returning its journal.
    pub fn into_journal(self) -> Journal<B> {
        self.tree.into_inner().into_provider().into_journal()
    }
}
