//! Damaged files are reported as metadata errors instead of being read as data.

// Test code is allowed to use unwrap for simplicity
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::fs;

use tabula_store::{
    Columns, ErrorCode, IndexKind, Op, OpenMode, Query, Table, TableConfig,
    index::{INDEX_HEADER_SIZE, index_path},
};
use tabula_test_utils::{TestDir, corrupt_byte, truncate_file};

fn build(dir: &TestDir, name: &str, indexed: bool) {
    let config = TableConfig::builder().bucket_count(31).build().unwrap();
    let path = dir.table_path(name);
    let table =
        Table::open_with_config(&path, OpenMode::WRITER | OpenMode::CREATE, config).unwrap();
    for i in 0..20 {
        let mut record = Columns::new();
        record.insert("name".to_string(), format!("name{i:02}").into_bytes());
        table.put(format!("k{i:02}").as_bytes(), &record).unwrap();
    }
    if indexed {
        table.define_index("name", IndexKind::Lexical, false).unwrap();
    }
    table.close().unwrap();
}

#[test]
fn test_corrupt_header_is_rejected() {
    let dir = TestDir::new();
    build(&dir, "header", false);
    let path = dir.table_path("header");
    corrupt_byte(&path, 20);

    for mode in [OpenMode::READER, OpenMode::WRITER] {
        let err = Table::open(&path, mode).err().unwrap();
        assert_eq!(err.code(), ErrorCode::Metadata, "{mode:?}: {err}");
    }
}

#[test]
fn test_truncated_main_file_is_rejected() {
    let dir = TestDir::new();
    build(&dir, "torn", false);
    let path = dir.table_path("torn");
    let len = fs::metadata(&path).unwrap().len();

    // Short tail: the header promises more bytes than the file holds.
    truncate_file(&path, len - 10);
    let err = Table::open(&path, OpenMode::READER).err().unwrap();
    assert_eq!(err.code(), ErrorCode::Metadata);

    // Not even a full header left.
    truncate_file(&path, 100);
    let err = Table::open(&path, OpenMode::WRITER).err().unwrap();
    assert_eq!(err.code(), ErrorCode::Metadata);
}

#[test]
fn test_intact_file_still_opens() {
    let dir = TestDir::new();
    build(&dir, "intact", true);
    let table = Table::open(dir.table_path("intact"), OpenMode::READER).unwrap();
    assert_eq!(table.record_count(), 20);
    let query = Query::new().condition("name", Op::StrEq, "name07");
    assert_eq!(table.search(&query).unwrap(), vec![b"k07".to_vec()]);
}

#[test]
fn test_corrupt_index_page_fails_checksum() {
    let dir = TestDir::new();
    build(&dir, "indexed", true);
    let path = dir.table_path("indexed");
    let index = index_path(&path, "name", IndexKind::Lexical);
    assert!(index.exists());

    // Twenty short keys fit in the root leaf, which is page 1.
    corrupt_byte(&index, INDEX_HEADER_SIZE + 100);

    let query = Query::new().condition("name", Op::StrEq, "name07");
    let err = Table::open(&path, OpenMode::READER).and_then(|table| table.search(&query));
    assert_eq!(err.err().unwrap().code(), ErrorCode::Metadata);
}
