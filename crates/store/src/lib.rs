//! tabula-store: an embedded, file-backed table engine.
//!
//! A table maps byte-string primary keys to records made of named columns.
//! Records live in a hash-bucketed store in one file; any column can carry a
//! secondary index kept in its own B+ tree file. Queries combine conditions
//! on columns, use indexes where they can and verify every candidate against
//! the stored record.
//!
//! - **Single writer per handle**: mutations are serialized; readers share
//! - **Journaled units of work**: every mutation and every transaction can be
//!   rolled back, including after a crash
//! - **Checksummed index pages**: XXH3-64 on every page
//! - **Whole-record compression**: deflate, bzip2 or lz4
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Table API                    │
//! │  (put, get, out, search, begin/commit, ...)  │
//! └──────────┬─────────────────────┬────────────┘
//!            │                     │
//! ┌──────────▼─────────┐ ┌─────────▼────────────┐
//! │    Query Engine     │ │     Writer Gate      │
//! │ (plan, scan, order) │ │ (transaction state)  │
//! └──────────┬─────────┘ └──────────────────────┘
//!            │
//! ┌──────────▼─────────┐ ┌──────────────────────┐
//! │    Hash Store       │ │  Secondary Indexes   │
//! │ (buckets, chains,   │ │  (B+ tree per column │
//! │  free-block pool)   │ │   with page caches)  │
//! └──────────┬─────────┘ └─────────┬────────────┘
//!            │                     │
//! ┌──────────▼─────────────────────▼────────────┐
//! │         Journal + Storage Backend            │
//! │      (FileBackend / InMemoryBackend)         │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tabula_store::{Columns, Condition, IndexKind, OpenMode, Op, Query, Table};
//!
//! let table = Table::open("people.tbl", OpenMode::WRITER | OpenMode::CREATE)?;
//! table.define_index("age", IndexKind::Decimal, false)?;
//!
//! let mut record = Columns::new();
//! record.insert("name".to_string(), b"mikio".to_vec());
//! record.insert("age".to_string(), b"30".to_vec());
//! table.put(b"1", &record)?;
//!
//! let query = Query::new().filter(Condition::new("age", Op::NumGe, "20"));
//! let keys = table.search(&query)?;
//! assert_eq!(keys, vec![b"1".to_vec()]);
//! table.close()?;
//! # Ok::<(), tabula_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// B+ tree operations use complex return types for split propagation
#![allow(clippy::type_complexity)]

pub mod backend;
pub mod btree;
pub mod cache;
pub mod columns;
pub mod config;
mod encoding;
pub mod error;
pub mod hash;
pub mod index;
pub mod page;
pub mod query;
pub mod table;
pub mod txn;

// Re-export commonly used types
pub use backend::{FileBackend, InMemoryBackend, Journal, StorageBackend};
pub use cache::CacheStats;
pub use columns::{Columns, NUMERIC_COLUMN};
pub use config::{Compression, ConfigError, OpenMode, OptimizeOptions, TableConfig};
pub use error::{Error, ErrorCode, Result};
pub use index::{IndexCommand, IndexKind, IndexStats};
pub use query::{Condition, Direction, Domain, Op, Order, Query, QueryPlan, SetOperation};
pub use table::{KeyCursor, PutMode, Table, TableStats};
pub use txn::TxnState;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
