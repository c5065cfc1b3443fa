//! The table handle.
//!
//! A [`Table`] owns one main file (the record store), one file per secondary
//! index and a journal next to each. Every mutation runs as a unit of work:
//! on its own when no transaction is open, or inside the transaction
//! otherwise, where a failure rolls back to the savepoint taken when the
//! mutation started.
//!
//! Commit order for a unit: index pages and headers are flushed, data files
//! are synced when the handle was opened with [`OpenMode::SYNC`], the main
//! journal is truncated (the commit point) and finally the index journals.
//! In that mode every journal also forces its log to disk before the data
//! write it protects.
//! At writer open a non-empty main journal rolls every file back, while an
//! empty one means any leftover index journal belongs to a committed unit.
//!
//! # Locking
//!
//! - The writer gate admits one mutating thread at a time and stays with a
//!   thread for the length of its transaction.
//! - `inner` is shared by reads and ordinary mutations and taken exclusively
//!   by structural operations (`optimize`, `vanish`, `copy`, index definition).
//! - The gate is always taken before `inner`.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, RwLock};
use snafu::ResultExt;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{FileBackend, FileLock, Journal, LockKind, Savepoint, StorageBackend},
    cache::{CacheStats, ClockCache},
    columns::{Columns, NUMERIC_COLUMN, compress, decode_columns, decompress, encode_columns},
    config::{Compression, OpenMode, OptimizeOptions, TableConfig},
    error::{Error, ErrorCode, IoOp, IoSnafu, Result},
    hash::{CatalogEntry, ChainPosition, HEADER_SIZE, HashStore, Header, StoreSnapshot},
    index::{
        Index, IndexCheckpoint, IndexCommand, IndexKind, IndexStats, index_path, journal_path,
        keys::MAX_INDEXED_PRIMARY_KEY,
    },
    query::{
        Query, QueryPlan, SetOperation,
        exec::{self, IndexLookup, RecordSource},
    },
    txn::{TxnState, WriterGate},
};

/// Smallest bucket count chosen by `optimize` when none is given.
const MIN_OPTIMIZED_BUCKETS: u64 = 1021;

/// How [`Table::put_with_mode`] treats an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Replace the whole column set.
    Overwrite,
    /// Fail with [`Error::RecordExists`] if the key is present.
    Keep,
    /// Append each value to the existing value of the same column.
    Concat,
}

/// Table statistics.
#[derive(Debug, Clone)]
pub struct TableStats {
    /// Live records.
    pub records: u64,
    /// Logical size of the main file.
    pub file_size: u64,
    /// Blocks waiting in the free-block pool.
    pub free_blocks: usize,
    /// Decoded record cache.
    pub record_cache: CacheStats,
    /// Per indexed column.
    pub indexes: Vec<(String, IndexStats)>,
}

struct Inner {
    store: HashStore<FileBackend>,
    indexes: Vec<Index<FileBackend>>,
}

impl Inner {
    fn index(&self, column: &str) -> Option<&Index<FileBackend>> {
        self.indexes.iter().find(|index| index.column() == column)
    }

    fn catalog(&self) -> Vec<CatalogEntry> {
        self.indexes
            .iter()
            .map(|index| CatalogEntry { column: index.column().to_string(), kind: index.kind() })
            .collect()
    }
}

/// Undo state for a unit of work or a savepoint inside one.
struct Checkpoint {
    main: Savepoint,
    store: StoreSnapshot,
    indexes: Vec<IndexCheckpoint>,
}

/// An open table.
pub struct Table {
    path: PathBuf,
    mode: OpenMode,
    config: TableConfig,
    inner: RwLock<Inner>,
    gate: WriterGate,
    /// Undo state of the open transaction.
    txn: Mutex<Option<Checkpoint>>,
    records: ClockCache<Vec<u8>, Columns>,
    iter_pos: Mutex<ChainPosition>,
    last_error: Mutex<ErrorCode>,
    sequence: AtomicU64,
    lock: Mutex<Option<FileLock>>,
    closed: bool,
}

impl Table {
    /// Opens a table with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`Table::open_with_config`].
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        Self::open_with_config(path, mode, TableConfig::default())
    }

    /// Opens a table.
    ///
    /// Tuning fields of `config` apply only when the file is created; cache
    /// fields apply on every open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] for a bad mode or configuration,
    /// `Error::Io` if a file cannot be opened or locked, and
    /// [`Error::Metadata`] if a file is not a table or a reader finds an
    /// interrupted transaction.
    pub fn open_with_config(
        path: impl AsRef<Path>,
        mode: OpenMode,
        config: TableConfig,
    ) -> Result<Self> {
        mode.validate()?;
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let writer = mode.is_writer();
        let create = writer
            && (mode.contains(OpenMode::TRUNCATE)
                || (mode.contains(OpenMode::CREATE) && !path.exists()));

        let data = if create {
            FileBackend::open_or_create(&path, config.mapped_memory)?
        } else {
            FileBackend::open(&path, writer, config.mapped_memory)?
        };
        let lock = if mode.contains(OpenMode::NO_LOCK) {
            None
        } else {
            let kind = if writer { LockKind::Exclusive } else { LockKind::Shared };
            let blocking = !mode.contains(OpenMode::LOCK_NONBLOCKING);
            Some(FileLock::acquire(&path, kind, blocking)?)
        };
        let sync = mode.contains(OpenMode::SYNC);
        let journal = Journal::new(data, open_log(&journal_path(&path), writer)?).with_sync(sync);

        let (store, pending, unclean) = if create {
            journal.discard()?;
            (HashStore::create(journal, &config)?, false, false)
        } else if writer {
            let pending = journal.has_pending()?;
            if pending {
                warn!(path = %path.display(), "Rolling back interrupted transaction");
                journal.recover()?;
            }
            let (store, unclean) = HashStore::open(journal, true, config.defrag_unit)?;
            (store, pending, unclean)
        } else {
            if journal.has_pending()? {
                return Err(Error::metadata(
                    "table has an interrupted transaction; open it as a writer to recover",
                ));
            }
            let (store, unclean) = HashStore::open(journal, false, config.defrag_unit)?;
            (store, false, unclean)
        };

        let mut indexes = Vec::new();
        for entry in store.catalog() {
            let file = index_path(&path, &entry.column, entry.kind);
            let data = FileBackend::open(&file, writer, 0)?;
            let journal =
                Journal::new(data, open_log(&journal_path(&file), writer)?).with_sync(sync);
            if writer {
                if pending {
                    journal.recover()?;
                } else {
                    journal.discard()?;
                }
            }
            let index = Index::open(
                &entry.column,
                entry.kind,
                journal,
                config.leaf_cache,
                config.nonleaf_cache,
                !unclean,
            )?;
            indexes.push(index.with_path(file));
        }

        if writer {
            if unclean {
                warn!(path = %path.display(), "Table was not closed cleanly; repaired free space");
            }
            store.mark_open()?;
        }
        info!(
            path = %path.display(),
            writer,
            created = create,
            records = store.record_count(),
            indexes = indexes.len(),
            "Opened table"
        );

        Ok(Self {
            path,
            mode,
            records: ClockCache::new(config.record_cache),
            config,
            inner: RwLock::new(Inner { store, indexes }),
            gate: WriterGate::new(),
            txn: Mutex::new(None),
            iter_pos: Mutex::new(ChainPosition::default()),
            last_error: Mutex::new(ErrorCode::Success),
            sequence: AtomicU64::new(1),
            lock: Mutex::new(lock),
            closed: false,
        })
    }

    /// Closes the table, aborting an open transaction and persisting the
    /// free space maps.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the final writes fail; the handle is released
    /// regardless.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut result = Ok(());
        let inner = self.inner.get_mut();
        if let Some(checkpoint) = self.txn.get_mut().take() {
            warn!(path = %self.path.display(), "Aborting transaction left open at close");
            result = abort_unit(inner, checkpoint);
            self.records.clear();
        }
        if self.mode.is_writer() {
            for index in &inner.indexes {
                result = result.and(index.sync());
            }
            result = result.and(inner.store.close());
        }
        *self.lock.get_mut() = None;
        info!(path = %self.path.display(), "Closed table");
        result
    }

    /// Path of the main file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Code of the last operation's outcome on this handle.
    pub fn last_error(&self) -> ErrorCode {
        *self.last_error.lock()
    }

    /// Number of records.
    pub fn record_count(&self) -> u64 {
        self.inner.read().store.record_count()
    }

    /// Logical size of the main file in bytes.
    pub fn file_size(&self) -> u64 {
        self.inner.read().store.file_size()
    }

    /// Stores `columns` under `key`, replacing any existing record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] for an empty column name, or for a
    /// key over 1024 bytes when the table has indexes.
    pub fn put(&self, key: &[u8], columns: &Columns) -> Result<()> {
        self.put_with_mode(key, columns, PutMode::Overwrite)
    }

    /// Stores `columns` unless `key` is present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordExists`] if the key is present.
    pub fn put_keep(&self, key: &[u8], columns: &Columns) -> Result<()> {
        self.put_with_mode(key, columns, PutMode::Keep)
    }

    /// Appends each value to the existing value of its column.
    ///
    /// # Errors
    ///
    /// See [`Table::put`].
    pub fn put_cat(&self, key: &[u8], columns: &Columns) -> Result<()> {
        self.put_with_mode(key, columns, PutMode::Concat)
    }

    /// Stores a record according to `mode`.
    ///
    /// # Errors
    ///
    /// See [`Table::put`] and [`Table::put_keep`].
    pub fn put_with_mode(&self, key: &[u8], columns: &Columns, mode: PutMode) -> Result<()> {
        let result = self.write(|inner| {
            if columns.keys().any(String::is_empty) {
                return Err(Error::invalid("column names must not be empty"));
            }
            check_key(inner, key)?;
            let old = if mode == PutMode::Overwrite && inner.indexes.is_empty() {
                None
            } else {
                self.load(inner, key)?
            };
            let new = match mode {
                PutMode::Overwrite => columns.clone(),
                PutMode::Keep => {
                    if old.is_some() {
                        return Err(Error::RecordExists);
                    }
                    columns.clone()
                },
                PutMode::Concat => {
                    let mut merged = old.clone().unwrap_or_default();
                    for (name, value) in columns {
                        merged.entry(name.clone()).or_default().extend_from_slice(value);
                    }
                    merged
                },
            };
            self.store_record(inner, key, old.as_ref(), &new)
        });
        self.track(result)
    }

    /// Reads a record. A missing key records [`ErrorCode::NoRecord`].
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error.
    pub fn get(&self, key: &[u8]) -> Result<Option<Columns>> {
        let result = self.load(&self.inner.read(), key);
        self.track_lookup(result)
    }

    /// Removes a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] if the key is absent.
    pub fn out(&self, key: &[u8]) -> Result<()> {
        let result = self.write(|inner| self.remove_record(inner, key));
        self.track(result)
    }

    /// Size of the encoded column set of `key`, without decoding it.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn value_size(&self, key: &[u8]) -> Result<Option<usize>> {
        let result = self.inner.read().store.value_size(key);
        self.track_lookup(result)
    }

    /// Adds `delta` to the integer held in the `_num` column and returns the
    /// total. A missing record or column counts as 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] if the stored text is not an
    /// integer or the sum overflows.
    pub fn add_int(&self, key: &[u8], delta: i64) -> Result<i64> {
        let result = self.add_numeric(key, |current| {
            let base = match current {
                Some(text) => text
                    .parse::<i64>()
                    .map_err(|_| Error::invalid(format!("{NUMERIC_COLUMN} is not an integer")))?,
                None => 0,
            };
            let total = base
                .checked_add(delta)
                .ok_or_else(|| Error::invalid(format!("{NUMERIC_COLUMN} overflows")))?;
            Ok((total, total.to_string()))
        });
        self.track(result)
    }

    /// Adds `delta` to the real number held in the `_num` column and returns
    /// the total.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] if the stored text is not a number.
    pub fn add_double(&self, key: &[u8], delta: f64) -> Result<f64> {
        let result = self.add_numeric(key, |current| {
            let base = match current {
                Some(text) => text
                    .parse::<f64>()
                    .map_err(|_| Error::invalid(format!("{NUMERIC_COLUMN} is not a number")))?,
                None => 0.0,
            };
            let total = base + delta;
            Ok((total, total.to_string()))
        });
        self.track(result)
    }

    fn add_numeric<T>(
        &self,
        key: &[u8],
        add: impl FnOnce(Option<&str>) -> Result<(T, String)>,
    ) -> Result<T> {
        self.write(|inner| {
            check_key(inner, key)?;
            let old = self.load(inner, key)?;
            let current = match old.as_ref().and_then(|columns| columns.get(NUMERIC_COLUMN)) {
                Some(bytes) => Some(
                    std::str::from_utf8(bytes)
                        .map(str::trim)
                        .map_err(|_| Error::invalid(format!("{NUMERIC_COLUMN} is not text")))?,
                ),
                None => None,
            };
            let (total, text) = add(current)?;
            let mut new = old.clone().unwrap_or_default();
            new.insert(NUMERIC_COLUMN.to_string(), text.into_bytes());
            self.store_record(inner, key, old.as_ref(), &new)?;
            Ok(total)
        })
    }

    /// Advances the persisted counter and returns its new value, starting
    /// at 1.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the header cannot be written.
    pub fn generate_unique_id(&self) -> Result<u64> {
        let result = self.write(|inner| inner.store.next_unique_id());
        self.track(result)
    }

    /// Restarts the handle's key iteration.
    pub fn iter_init(&self) {
        *self.iter_pos.lock() = ChainPosition::default();
        *self.last_error.lock() = ErrorCode::Success;
    }

    /// Next primary key of the handle's iteration, in bucket order.
    ///
    /// Concurrent writes may make a pass skip or repeat keys; every key
    /// returned existed when it was read.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn iter_next(&self) -> Result<Option<Vec<u8>>> {
        let result = {
            let inner = self.inner.read();
            let mut pos = self.iter_pos.lock();
            inner.store.next_record(&mut pos, false).map(|entry| entry.map(|(key, _)| key))
        };
        self.track_lookup(result)
    }

    /// An independent key iterator with the same semantics as
    /// [`Table::iter_next`].
    pub fn cursor(&self) -> KeyCursor<'_> {
        KeyCursor { table: self, pos: ChainPosition::default(), done: false }
    }

    /// Primary keys starting with `prefix` in ascending order, at most `max`
    /// of them.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn forward_match_keys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        let result = keys_with_prefix(&self.inner.read(), prefix).map(|keys| {
            keys.into_iter().take(max.unwrap_or(usize::MAX)).collect::<Vec<_>>()
        });
        self.track(result)
    }

    /// Persists the free space maps and forces every file to stable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if a write or sync fails.
    pub fn sync(&self) -> Result<()> {
        let result = self.ensure_writer().and_then(|()| {
            let _gate = self.gate.acquire();
            sync_all(&self.inner.read())
        });
        self.track(result)
    }

    /// Rebuilds the main file with new tuning parameters and compacts every
    /// index. The rebuilt file replaces the old one by rename.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Threading`] inside a transaction, or a storage error.
    pub fn optimize(&self, options: &OptimizeOptions) -> Result<()> {
        let result = self.structural("optimize", |inner| self.rebuild(inner, options));
        self.track(result)
    }

    fn rebuild(&self, inner: &mut Inner, options: &OptimizeOptions) -> Result<()> {
        let layout = *inner.store.layout();
        let records = inner.store.record_count();
        let config = TableConfig {
            bucket_count: options
                .bucket_count
                .unwrap_or_else(|| (records * 2 + 1).max(MIN_OPTIMIZED_BUCKETS)),
            alignment_power: options.alignment_power.unwrap_or(layout.alignment_power),
            free_pool_power: options.free_pool_power.unwrap_or(layout.free_pool_power),
            compression: options.compression.unwrap_or(layout.compression),
            large: options.large.unwrap_or(layout.large),
            ..self.config.clone()
        };
        config.validate()?;

        let temp = with_suffix(&self.path, ".tmp");
        let temp_log = journal_path(&temp);
        let target = HashStore::create(
            Journal::new(FileBackend::create(&temp, 0)?, FileBackend::create(&temp_log, 0)?)
                .with_sync(self.sync_on_commit()),
            &config,
        )?;
        let copied = copy_records(&inner.store, &target, layout.compression, config.compression)
            .and_then(|()| target.set_catalog(inner.store.catalog()))
            .and_then(|()| target.set_unique_id(inner.store.unique_id()))
            .and_then(|()| target.close());
        drop(target);
        remove_leftover(&temp_log);
        if let Err(e) = copied {
            remove_leftover(&temp);
            return Err(e);
        }

        // The rebuilt file is locked before it takes the table's name, so the
        // path is never unlocked.
        let mut held = self.lock.lock();
        let replacement = match held.as_ref() {
            Some(_) => match FileLock::acquire(&temp, LockKind::Exclusive, false) {
                Ok(lock) => Some(lock),
                Err(e) => {
                    remove_leftover(&temp);
                    return Err(e);
                },
            },
            None => None,
        };
        if let Err(e) = fs::rename(&temp, &self.path).context(IoSnafu { op: IoOp::Rename }) {
            drop(replacement);
            remove_leftover(&temp);
            return Err(e);
        }
        if replacement.is_some() {
            *held = replacement;
        }
        drop(held);
        let journal = Journal::new(
            FileBackend::open(&self.path, true, self.config.mapped_memory)?,
            open_log(&journal_path(&self.path), true)?,
        )
        .with_sync(self.sync_on_commit());
        let (store, _) = HashStore::open(journal, true, self.config.defrag_unit)?;
        store.mark_open()?;
        inner.store = store;
        self.records.clear();

        self.unit(inner, |inner| {
            for index in &inner.indexes {
                index.compact()?;
            }
            Ok(())
        })?;
        info!(
            path = %self.path.display(),
            records,
            buckets = config.bucket_count,
            compression = ?config.compression,
            "Optimized table"
        );
        Ok(())
    }

    /// Removes every record and index entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Threading`] inside a transaction, or a storage error.
    pub fn vanish(&self) -> Result<()> {
        let result = self.structural("vanish", |inner| {
            self.unit(inner, |inner| {
                inner.store.vanish()?;
                for index in &inner.indexes {
                    index.clear()?;
                }
                Ok(())
            })?;
            self.records.clear();
            Ok(())
        });
        self.track(result)
    }

    /// Copies the table and its index files to `dest`, producing a cleanly
    /// closed table there.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Threading`] inside a transaction, or `Error::Io` if a
    /// copy fails.
    pub fn copy(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        let result = self.gate.ensure_idle("copy").and_then(|()| {
            let _gate = self.mode.is_writer().then(|| self.gate.acquire());
            let inner = self.inner.write();
            if self.mode.is_writer() {
                sync_all(&inner)?;
            }
            fs::copy(&self.path, dest).context(IoSnafu { op: IoOp::Write })?;
            mark_closed(dest)?;
            for index in &inner.indexes {
                if let Some(source) = index.path() {
                    let target = index_path(dest, index.column(), index.kind());
                    fs::copy(source, target).context(IoSnafu { op: IoOp::Write })?;
                }
            }
            info!(from = %self.path.display(), to = %dest.display(), "Copied table");
            Ok(())
        });
        self.track(result)
    }

    /// Builds an index of `kind` on `column` over every existing record.
    ///
    /// With `keep_existing` an existing index on the column is left alone
    /// and the call fails with [`Error::RecordExists`]; otherwise it is
    /// dropped and rebuilt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] for the empty column name or a
    /// primary key too long to index, and [`Error::Threading`] inside a
    /// transaction.
    pub fn define_index(&self, column: &str, kind: IndexKind, keep_existing: bool) -> Result<()> {
        let result = self.structural("index definition", |inner| {
            if column.is_empty() {
                return Err(Error::invalid("the primary key cannot be indexed"));
            }
            if let Some(pos) = inner.indexes.iter().position(|index| index.column() == column) {
                if keep_existing {
                    return Err(Error::RecordExists);
                }
                let old = inner.indexes.remove(pos);
                inner.store.set_catalog(inner.catalog())?;
                remove_index_files(old)?;
            }
            let index = self.build_index(inner, column, kind)?;
            let entries = index.entry_count();
            inner.indexes.push(index);
            inner.store.set_catalog(inner.catalog())?;
            inner.store.journal().data().sync()?;
            info!(column, kind = ?kind, entries, "Built index");
            Ok(())
        });
        self.track(result)
    }

    fn build_index(
        &self,
        inner: &Inner,
        column: &str,
        kind: IndexKind,
    ) -> Result<Index<FileBackend>> {
        let file = index_path(&self.path, column, kind);
        let journal = Journal::new(
            FileBackend::create(&file, 0)?,
            FileBackend::create(journal_path(&file), 0)?,
        )
        .with_sync(self.sync_on_commit());
        let index =
            Index::create(column, kind, journal, self.config.leaf_cache, self.config.nonleaf_cache)?
                .with_path(file);
        let codec = inner.store.layout().compression;
        let built = inner
            .store
            .scan(|key, stored| {
                if key.len() > MAX_INDEXED_PRIMARY_KEY {
                    return Err(Error::invalid(format!(
                        "primary key of {} bytes is too long to index",
                        key.len()
                    )));
                }
                if let Some(value) = decode(codec, &stored)?.get(column) {
                    index.update(&key, None, Some(value))?;
                }
                Ok(true)
            })
            .and_then(|()| index.sync());
        match built {
            Ok(()) => Ok(index),
            Err(e) => {
                if let Err(cleanup) = remove_index_files(index) {
                    warn!(column, error = %cleanup, "Failed to remove partially built index");
                }
                Err(e)
            },
        }
    }

    /// Drops the index on `column`, if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Threading`] inside a transaction, or `Error::Io` if
    /// the files cannot be removed.
    pub fn drop_index(&self, column: &str) -> Result<()> {
        let result = self.structural("index removal", |inner| {
            let Some(pos) = inner.indexes.iter().position(|index| index.column() == column) else {
                return Ok(());
            };
            let index = inner.indexes.remove(pos);
            inner.store.set_catalog(inner.catalog())?;
            inner.store.journal().data().sync()?;
            remove_index_files(index)?;
            info!(column, "Dropped index");
            Ok(())
        });
        self.track(result)
    }

    /// Compacts the index on `column`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] if the column has no index and
    /// [`Error::Threading`] inside a transaction.
    pub fn optimize_index(&self, column: &str) -> Result<()> {
        let result = self.structural("index optimization", |inner| {
            self.unit(inner, |inner| {
                inner.index(column).ok_or(Error::RecordNotFound)?.compact().map(|_| ())
            })
        });
        self.track(result)
    }

    /// Runs an index maintenance command on `column`.
    ///
    /// # Errors
    ///
    /// See [`Table::define_index`], [`Table::optimize_index`] and
    /// [`Table::drop_index`].
    pub fn set_index(&self, column: &str, command: IndexCommand) -> Result<()> {
        match command {
            IndexCommand::Define(kind) => self.define_index(column, kind, false),
            IndexCommand::DefineKeep(kind) => self.define_index(column, kind, true),
            IndexCommand::Optimize => self.optimize_index(column),
            IndexCommand::Remove => self.drop_index(column),
        }
    }

    /// Opens a transaction owned by the calling thread. Mutations from other
    /// threads wait until it ends.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Threading`] if a transaction is already open on this
    /// handle, whichever thread opened it.
    pub fn begin(&self) -> Result<()> {
        let result = self.ensure_writer().and_then(|()| {
            self.gate.begin()?;
            match begin_unit(&self.inner.read(), self.next_sequence()) {
                Ok(checkpoint) => {
                    *self.txn.lock() = Some(checkpoint);
                    Ok(())
                },
                Err(e) => {
                    self.gate.finish();
                    Err(e)
                },
            }
        });
        self.track(result)
    }

    /// Makes the open transaction durable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Threading`] without an open transaction. If the
    /// commit itself fails the transaction is rolled back.
    pub fn commit(&self) -> Result<()> {
        let result = self.gate.transition(TxnState::Committing).and_then(|()| {
            let inner = self.inner.read();
            let checkpoint = self.txn.lock().take();
            let mut result = commit_unit(&inner, self.sync_on_commit());
            if result.is_err() {
                if let Some(checkpoint) = checkpoint {
                    result = result.and(abort_unit(&inner, checkpoint));
                }
                self.records.clear();
            }
            self.gate.finish();
            result
        });
        self.track(result)
    }

    /// Undoes the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Threading`] without an open transaction.
    pub fn abort(&self) -> Result<()> {
        let result = self.gate.transition(TxnState::Aborting).and_then(|()| {
            let inner = self.inner.read();
            let result = match self.txn.lock().take() {
                Some(checkpoint) => abort_unit(&inner, checkpoint),
                None => Ok(()),
            };
            self.records.clear();
            self.gate.finish();
            result
        });
        self.track(result)
    }

    /// Runs `f` inside a transaction, committing if it succeeds and aborting
    /// if it fails.
    ///
    /// # Errors
    ///
    /// Returns the error from `f` or from the commit.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.begin()?;
        match f(self) {
            Ok(value) => self.commit().map(|()| value),
            Err(e) => {
                if let Err(abort) = self.abort() {
                    warn!(error = %abort, "Failed to abort transaction");
                }
                *self.last_error.lock() = e.code();
                Err(e)
            },
        }
    }

    /// Primary keys of the records matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] for a bad regular expression, or
    /// a storage error.
    pub fn search(&self, query: &Query) -> Result<Vec<Vec<u8>>> {
        self.search_with_plan(query).map(|(keys, _)| keys)
    }

    /// Like [`Table::search`], also returning how the query was executed.
    ///
    /// # Errors
    ///
    /// See [`Table::search`].
    pub fn search_with_plan(&self, query: &Query) -> Result<(Vec<Vec<u8>>, QueryPlan)> {
        let result = {
            let inner = self.inner.read();
            exec::search(&Source { table: self, inner: &inner }, query)
        };
        self.track(result)
    }

    /// Removes every record matching `query` as one unit and returns how
    /// many were removed.
    ///
    /// # Errors
    ///
    /// See [`Table::search`]; nothing is removed on failure.
    pub fn search_out(&self, query: &Query) -> Result<usize> {
        let result = self.write(|inner| {
            let (keys, _) = exec::search(&Source { table: self, inner }, query)?;
            for key in &keys {
                self.remove_record(inner, key)?;
            }
            Ok(keys.len())
        });
        self.track(result)
    }

    /// Combines the results of several queries.
    ///
    /// # Errors
    ///
    /// See [`Table::search`].
    pub fn meta_search(&self, queries: &[Query], operation: SetOperation) -> Result<Vec<Vec<u8>>> {
        let result = {
            let inner = self.inner.read();
            exec::meta_search(&Source { table: self, inner: &inner }, queries, operation)
        };
        self.track(result)
    }

    /// Counters for the table, its caches and indexes.
    pub fn stats(&self) -> TableStats {
        let inner = self.inner.read();
        TableStats {
            records: inner.store.record_count(),
            file_size: inner.store.file_size(),
            free_blocks: inner.store.free_block_count(),
            record_cache: self.records.stats(),
            indexes: inner
                .indexes
                .iter()
                .map(|index| (index.column().to_string(), index.stats()))
                .collect(),
        }
    }

    fn ensure_writer(&self) -> Result<()> {
        if self.mode.is_writer() {
            Ok(())
        } else {
            Err(Error::invalid("table handle is open for reading"))
        }
    }

    fn sync_on_commit(&self) -> bool {
        self.mode.contains(OpenMode::SYNC)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        *self.last_error.lock() = match &result {
            Ok(_) => ErrorCode::Success,
            Err(e) => e.code(),
        };
        result
    }

    fn track_lookup<T>(&self, result: Result<Option<T>>) -> Result<Option<T>> {
        *self.last_error.lock() = match &result {
            Ok(Some(_)) => ErrorCode::Success,
            Ok(None) => ErrorCode::NoRecord,
            Err(e) => e.code(),
        };
        result
    }

    /// Runs an ordinary mutation.
    fn write<T>(&self, f: impl FnOnce(&Inner) -> Result<T>) -> Result<T> {
        self.ensure_writer()?;
        let _gate = self.gate.acquire();
        let inner = self.inner.read();
        self.unit(&inner, f)
    }

    /// Runs an operation that needs the table to itself.
    fn structural<T>(&self, operation: &str, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        self.ensure_writer()?;
        self.gate.ensure_idle(operation)?;
        let _gate = self.gate.acquire();
        let mut inner = self.inner.write();
        f(&mut inner)
    }

    /// Runs `f` as a unit of work, or under a savepoint when the calling
    /// thread has a transaction open.
    fn unit<T>(&self, inner: &Inner, f: impl FnOnce(&Inner) -> Result<T>) -> Result<T> {
        if self.gate.in_transaction() {
            let checkpoint = checkpoint(inner)?;
            return match f(inner) {
                Ok(value) => Ok(value),
                Err(e) => {
                    if let Err(undo) = rollback_to(inner, checkpoint) {
                        error!(error = %undo, "Failed to roll back to savepoint");
                    }
                    self.records.clear();
                    Err(e)
                },
            };
        }

        let checkpoint = begin_unit(inner, self.next_sequence())?;
        let result = f(inner).and_then(|value| {
            commit_unit(inner, self.sync_on_commit())?;
            Ok(value)
        });
        if result.is_err() {
            if let Err(undo) = abort_unit(inner, checkpoint) {
                error!(error = %undo, "Failed to roll back unit of work");
            }
            self.records.clear();
        }
        result
    }

    fn load(&self, inner: &Inner, key: &[u8]) -> Result<Option<Columns>> {
        let cached = self.records.is_enabled().then(|| key.to_vec());
        if let Some(columns) = cached.as_ref().and_then(|key| self.records.get(key)) {
            return Ok(Some(columns));
        }
        let Some(stored) = inner.store.get(key)? else {
            return Ok(None);
        };
        let columns = decode(inner.store.layout().compression, &stored)?;
        if let Some(key) = cached {
            self.records.insert(key, columns.clone());
        }
        Ok(Some(columns))
    }

    fn store_record(
        &self,
        inner: &Inner,
        key: &[u8],
        old: Option<&Columns>,
        new: &Columns,
    ) -> Result<()> {
        let stored = compress(inner.store.layout().compression, &encode_columns(new))?;
        inner.store.put(key, &stored, false)?;
        update_indexes(inner, key, old, Some(new))?;
        if self.records.is_enabled() {
            self.records.insert(key.to_vec(), new.clone());
        }
        Ok(())
    }

    fn remove_record(&self, inner: &Inner, key: &[u8]) -> Result<()> {
        let old = if inner.indexes.is_empty() { None } else { self.load(inner, key)? };
        if !inner.store.remove(key)? {
            return Err(Error::RecordNotFound);
        }
        update_indexes(inner, key, old.as_ref(), None)?;
        self.records.remove(&key.to_vec());
        Ok(())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(path = %self.path.display(), error = %e, "Failed to close table");
        }
    }
}

/// An independent iterator over primary keys, in bucket order.
pub struct KeyCursor<'a> {
    table: &'a Table,
    pos: ChainPosition,
    done: bool,
}

impl Iterator for KeyCursor<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let inner = self.table.inner.read();
        match inner.store.next_record(&mut self.pos, false) {
            Ok(Some((key, _))) => Some(Ok(key)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}

struct Source<'a> {
    table: &'a Table,
    inner: &'a Inner,
}

impl RecordSource for Source<'_> {
    fn fetch(&self, primary_key: &[u8]) -> Result<Option<Columns>> {
        self.table.load(self.inner, primary_key)
    }

    fn for_each(&self, f: &mut dyn FnMut(Vec<u8>, Columns) -> Result<bool>) -> Result<()> {
        let codec = self.inner.store.layout().compression;
        self.inner.store.scan(|key, stored| f(key, decode(codec, &stored)?))
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<BTreeSet<Vec<u8>>> {
        keys_with_prefix(self.inner, prefix)
    }

    fn index(&self, column: &str) -> Option<&dyn IndexLookup> {
        self.inner.index(column).map(|index| index as &dyn IndexLookup)
    }
}

fn decode(codec: Compression, stored: &[u8]) -> Result<Columns> {
    decode_columns(&decompress(codec, stored)?)
}

fn check_key(inner: &Inner, key: &[u8]) -> Result<()> {
    if !inner.indexes.is_empty() && key.len() > MAX_INDEXED_PRIMARY_KEY {
        return Err(Error::invalid(format!(
            "primary key of {} bytes is too long for a table with indexes",
            key.len()
        )));
    }
    Ok(())
}

fn update_indexes(
    inner: &Inner,
    key: &[u8],
    old: Option<&Columns>,
    new: Option<&Columns>,
) -> Result<()> {
    for index in &inner.indexes {
        let before = old.and_then(|columns| columns.get(index.column())).map(Vec::as_slice);
        let after = new.and_then(|columns| columns.get(index.column())).map(Vec::as_slice);
        if before != after {
            index.update(key, before, after)?;
        }
    }
    Ok(())
}

fn keys_with_prefix(inner: &Inner, prefix: &[u8]) -> Result<BTreeSet<Vec<u8>>> {
    let mut keys = BTreeSet::new();
    let mut pos = ChainPosition::default();
    while let Some((key, _)) = inner.store.next_record(&mut pos, false)? {
        if key.starts_with(prefix) {
            keys.insert(key);
        }
    }
    Ok(keys)
}

fn begin_unit(inner: &Inner, sequence: u64) -> Result<Checkpoint> {
    let journal = inner.store.journal();
    journal.begin(sequence)?;
    let main = journal.savepoint()?;
    let store = inner.store.snapshot();
    let mut indexes = Vec::with_capacity(inner.indexes.len());
    for index in &inner.indexes {
        match index.begin(sequence) {
            Ok(checkpoint) => indexes.push(checkpoint),
            Err(e) => {
                let begun = Checkpoint { main, store, indexes };
                if let Err(undo) = abort_unit(inner, begun) {
                    error!(error = %undo, "Failed to undo a partially opened unit");
                }
                return Err(e);
            },
        }
    }
    debug!(sequence, "Began unit of work");
    Ok(Checkpoint { main, store, indexes })
}

fn checkpoint(inner: &Inner) -> Result<Checkpoint> {
    let main = inner.store.journal().savepoint()?;
    let indexes = inner.indexes.iter().map(Index::checkpoint).collect::<Result<Vec<_>>>()?;
    Ok(Checkpoint { main, store: inner.store.snapshot(), indexes })
}

fn commit_unit(inner: &Inner, sync: bool) -> Result<()> {
    for index in &inner.indexes {
        index.flush()?;
    }
    if sync {
        inner.store.journal().data().sync()?;
        for index in &inner.indexes {
            index.sync_data()?;
        }
    }
    inner.store.journal().complete(sync)?;
    for index in &inner.indexes {
        index.complete(sync)?;
    }
    Ok(())
}

/// Rolls every file back to `checkpoint` and closes the unit. Keeps going
/// after a failure and reports the first one.
fn abort_unit(inner: &Inner, checkpoint: Checkpoint) -> Result<()> {
    let mut result = inner.store.journal().rollback().map(|_| ());
    inner.store.restore(checkpoint.store);
    for (index, saved) in inner.indexes.iter().zip(checkpoint.indexes) {
        result = result.and(index.rollback(saved));
    }
    debug!("Aborted unit of work");
    result
}

fn rollback_to(inner: &Inner, checkpoint: Checkpoint) -> Result<()> {
    let mut result = inner.store.journal().rollback_to(checkpoint.main).map(|_| ());
    inner.store.restore(checkpoint.store);
    for (index, saved) in inner.indexes.iter().zip(checkpoint.indexes) {
        result = result.and(index.rollback_to(saved));
    }
    result
}

fn sync_all(inner: &Inner) -> Result<()> {
    for index in &inner.indexes {
        index.sync()?;
    }
    inner.store.sync()
}

fn copy_records(
    source: &HashStore<FileBackend>,
    target: &HashStore<FileBackend>,
    from: Compression,
    to: Compression,
) -> Result<()> {
    source.scan(|key, stored| {
        let value = if from == to { stored } else { compress(to, &decompress(from, &stored)?)? };
        target.put(&key, &value, false)?;
        Ok(true)
    })
}

/// Clears the "open for writing" flag of a copied main file.
fn mark_closed(path: &Path) -> Result<()> {
    let backend = FileBackend::open(path, true, 0)?;
    let mut header = Header::from_bytes(&backend.read_vec(0, HEADER_SIZE)?)?;
    header.opened = false;
    backend.write_at(0, &header.to_bytes()?)?;
    backend.sync()
}

fn remove_index_files(index: Index<FileBackend>) -> Result<()> {
    let Some(path) = index.path().map(Path::to_path_buf) else {
        return Ok(());
    };
    drop(index.into_journal());
    fs::remove_file(&path).context(IoSnafu { op: IoOp::Unlink })?;
    match fs::remove_file(journal_path(&path)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(Error::Io { op: IoOp::Unlink, source: e })
        },
        _ => Ok(()),
    }
}

/// Opens a journal log. Writers create it; readers fall back to creating it
/// only when it does not exist yet.
/// Removes a temporary file, logging rather than failing.
fn remove_leftover(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

fn open_log(path: &Path, writer: bool) -> Result<FileBackend> {
    if writer {
        return FileBackend::open_or_create(path, 0);
    }
    match FileBackend::open(path, false, 0) {
        Err(Error::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            FileBackend::open_or_create(path, 0)
        },
        other => other,
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
