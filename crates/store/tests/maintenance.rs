//! Whole-table maintenance, codecs, configuration and file locking.

// Test code is allowed to use unwrap for simplicity
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use tabula_store::{
    Columns, Compression, Error, ErrorCode, IndexCommand, IndexKind, Op, OpenMode,
    OptimizeOptions, Query, Table, TableConfig,
};
use tabula_test_utils::{TestDir, sorted_keys};

fn cols(pairs: &[(&str, &str)]) -> Columns {
    pairs.iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect()
}

fn create_with(dir: &TestDir, name: &str, config: TableConfig) -> Table {
    Table::open_with_config(dir.table_path(name), OpenMode::WRITER | OpenMode::CREATE, config)
        .unwrap()
}

fn create(dir: &TestDir, name: &str) -> Table {
    create_with(dir, name, TableConfig::builder().bucket_count(61).build().unwrap())
}

fn fill(table: &Table, count: usize) {
    for i in 0..count {
        let text = format!("record number {i} with some repeated text repeated text");
        let level = (i % 10).to_string();
        let record = cols(&[("text", text.as_str()), ("level", level.as_str())]);
        table.put(format!("k{i:05}").as_bytes(), &record).unwrap();
    }
}

fn check_filled(table: &Table, count: usize) {
    assert_eq!(table.record_count(), count as u64);
    for i in (0..count).step_by(17) {
        let record = table.get(format!("k{i:05}").as_bytes()).unwrap().unwrap();
        assert_eq!(record.get("level").unwrap(), (i % 10).to_string().as_bytes());
    }
}

#[test]
fn test_end_to_end_token_query() {
    let dir = TestDir::new();
    let table = create(&dir, "people");
    table.put(b"1", &cols(&[("name", "mikio"), ("lang", "ja,en,c")])).unwrap();
    table.put(b"2", &cols(&[("name", "joker"), ("lang", "en,es")])).unwrap();
    table.put(b"3", &cols(&[("name", "falcon"), ("lang", "ja")])).unwrap();
    table.set_index("lang", IndexCommand::Define(IndexKind::Token)).unwrap();

    let query = Query::new().condition("lang", Op::StrAnyToken, "en");
    let found = sorted_keys(table.search(&query).unwrap());
    assert_eq!(found, vec![b"1".to_vec(), b"2".to_vec()]);
    for key in &found {
        let lang = table.get(key).unwrap().unwrap().remove("lang").unwrap();
        assert!(String::from_utf8(lang).unwrap().split(',').any(|t| t == "en"));
    }
}

#[test]
fn test_column_map_is_ordered_by_name() {
    let dir = TestDir::new();
    let table = create(&dir, "order");
    let mut record = Columns::new();
    for name in ["zeta", "alpha", "mid", "_num"] {
        record.insert(name.to_string(), name.as_bytes().to_vec());
    }
    table.put(b"k", &record).unwrap();
    let names: Vec<String> = table.get(b"k").unwrap().unwrap().into_keys().collect();
    assert_eq!(names, ["_num", "alpha", "mid", "zeta"]);
}

#[test]
fn test_put_cat_spec_example() {
    let dir = TestDir::new();
    let table = create(&dir, "cat");
    table.put_cat(b"k", &cols(&[("a", "1")])).unwrap();
    table.put_cat(b"k", &cols(&[("a", "2")])).unwrap();
    assert_eq!(table.get(b"k").unwrap(), Some(cols(&[("a", "12")])));
}

#[test]
fn test_every_codec_round_trips() {
    for codec in [Compression::None, Compression::Deflate, Compression::Bzip2, Compression::Lz4] {
        let dir = TestDir::new();
        let config = TableConfig::builder().bucket_count(61).compression(codec).build().unwrap();
        {
            let table = create_with(&dir, "codec", config.clone());
            fill(&table, 200);
            table.close().unwrap();
        }
        let table =
            Table::open_with_config(dir.table_path("codec"), OpenMode::READER, config).unwrap();
        check_filled(&table, 200);
    }
}

#[test]
fn test_large_mode() {
    let dir = TestDir::new();
    let config = TableConfig::builder().bucket_count(61).large(true).build().unwrap();
    {
        let table = create_with(&dir, "large", config);
        fill(&table, 300);
        table.close().unwrap();
    }
    let table = Table::open(dir.table_path("large"), OpenMode::READER).unwrap();
    check_filled(&table, 300);
}

#[test]
fn test_overwrite_churn_reuses_space() {
    let dir = TestDir::new();
    let table = create(&dir, "churn");
    fill(&table, 100);
    let settled = {
        fill(&table, 100);
        table.file_size()
    };
    for _ in 0..20 {
        fill(&table, 100);
    }
    assert!(table.file_size() <= settled * 2, "{} vs {settled}", table.file_size());
    check_filled(&table, 100);
}

#[test]
fn test_optimize_preserves_records_and_indexes() {
    let dir = TestDir::new();
    let table = create(&dir, "opt");
    table.define_index("level", IndexKind::Decimal, false).unwrap();
    fill(&table, 400);
    for i in (0..400).step_by(2) {
        table.out(format!("k{i:05}").as_bytes()).unwrap();
    }
    let unique = table.generate_unique_id().unwrap();

    let options = OptimizeOptions::builder().compression(Compression::Deflate).build();
    table.optimize(&options).unwrap();

    let level = Query::new().condition("level", Op::NumEq, "3");
    assert_eq!(table.search(&level).unwrap().len(), 40);
    assert_eq!(table.record_count(), 200);
    table.put(b"extra", &cols(&[("level", "3")])).unwrap();
    assert_eq!(table.search(&level).unwrap().len(), 41);
    assert_eq!(table.generate_unique_id().unwrap(), unique + 1);
    table.close().unwrap();

    let reopened = Table::open(dir.table_path("opt"), OpenMode::WRITER).unwrap();
    assert_eq!(reopened.record_count(), 201);
    assert_eq!(reopened.search(&level).unwrap().len(), 41);
    assert!(!dir.file_names().iter().any(|name| name.ends_with(".tmp")));
}

#[test]
fn test_optimize_index_and_missing_index() {
    let dir = TestDir::new();
    let table = create(&dir, "optidx");
    table.define_index("text", IndexKind::QGram, false).unwrap();
    fill(&table, 150);
    for i in 0..140 {
        table.out(format!("k{i:05}").as_bytes()).unwrap();
    }
    table.optimize_index("text").unwrap();
    let query = Query::new().condition("text", Op::StrIncludes, "number 14");
    assert_eq!(table.search(&query).unwrap().len(), 10);

    let err = table.set_index("nothing", IndexCommand::Optimize).unwrap_err();
    assert!(matches!(err, Error::RecordNotFound));
    assert_eq!(table.last_error(), ErrorCode::NoRecord);
}

#[test]
fn test_index_definition_lifecycle() {
    let dir = TestDir::new();
    let table = create(&dir, "life");
    fill(&table, 50);

    table.define_index("level", IndexKind::Lexical, false).unwrap();
    assert!(dir.file_names().iter().any(|name| name.contains(".idx.level.lex")));
    let err = table.set_index("level", IndexCommand::DefineKeep(IndexKind::Decimal)).unwrap_err();
    assert!(matches!(err, Error::RecordExists));

    // Redefining replaces the old index and its file.
    table.define_index("level", IndexKind::Decimal, false).unwrap();
    let names = dir.file_names();
    assert!(names.iter().any(|name| name.contains(".idx.level.dec")));
    assert!(!names.iter().any(|name| name.contains(".idx.level.lex")));
    let stats = table.stats();
    assert_eq!(stats.indexes.len(), 1);
    assert_eq!(stats.indexes[0].1.entries, 50);

    assert!(matches!(
        table.define_index("", IndexKind::Lexical, false),
        Err(Error::InvalidOperation { .. })
    ));

    table.set_index("level", IndexCommand::Remove).unwrap();
    table.drop_index("level").unwrap();
    assert!(!dir.file_names().iter().any(|name| name.contains(".idx.")));
    let query = Query::new().condition("level", Op::NumEq, "4");
    let (found, plan) = table.search_with_plan(&query).unwrap();
    assert_eq!(found.len(), 5);
    assert!(plan.full_scan);
}

#[test]
fn test_index_survives_reopen() {
    let dir = TestDir::new();
    {
        let table = create(&dir, "persist");
        table.define_index("level", IndexKind::Decimal, false).unwrap();
        fill(&table, 120);
        table.close().unwrap();
    }
    let table = Table::open(dir.table_path("persist"), OpenMode::READER).unwrap();
    let query = Query::new().condition("level", Op::NumLt, "2");
    let (found, plan) = table.search_with_plan(&query).unwrap();
    assert_eq!(found.len(), 24);
    assert!(!plan.full_scan);
}

#[test]
fn test_long_primary_key_with_index_is_rejected() {
    let dir = TestDir::new();
    let table = create(&dir, "longkey");
    let long_key = vec![b'x'; 1025];
    table.put(&long_key, &cols(&[("a", "1")])).unwrap();
    assert!(matches!(
        table.define_index("a", IndexKind::Lexical, false),
        Err(Error::InvalidOperation { .. })
    ));
    assert!(!dir.file_names().iter().any(|name| name.contains(".idx.")));

    table.out(&long_key).unwrap();
    table.define_index("a", IndexKind::Lexical, false).unwrap();
    assert!(matches!(
        table.put(&long_key, &cols(&[("a", "1")])),
        Err(Error::InvalidOperation { .. })
    ));
    table.put(&vec![b'x'; 1024], &cols(&[("a", "1")])).unwrap();
}

#[test]
fn test_vanish_clears_records_and_indexes() {
    let dir = TestDir::new();
    let table = create(&dir, "vanish");
    table.define_index("level", IndexKind::Decimal, false).unwrap();
    fill(&table, 100);
    table.vanish().unwrap();

    assert_eq!(table.record_count(), 0);
    assert_eq!(table.get(b"k00001").unwrap(), None);
    let any = Query::new().condition("level", Op::NumGe, "0");
    assert!(table.search(&any).unwrap().is_empty());
    assert_eq!(table.stats().indexes[0].1.entries, 0);

    fill(&table, 10);
    assert_eq!(table.search(&any).unwrap().len(), 10);
}

#[test]
fn test_copy_produces_openable_table() {
    let dir = TestDir::new();
    let table = create(&dir, "source");
    table.define_index("level", IndexKind::Decimal, false).unwrap();
    fill(&table, 80);

    let dest = dir.table_path("backup");
    table.copy(&dest).unwrap();
    table.put(b"after", &cols(&[("level", "1")])).unwrap();

    let copy = Table::open(&dest, OpenMode::READER).unwrap();
    check_filled(&copy, 80);
    let query = Query::new().condition("level", Op::NumEq, "1");
    assert_eq!(copy.search(&query).unwrap().len(), 8);
    assert_eq!(copy.get(b"after").unwrap(), None);
}

#[test]
fn test_lock_conflicts() {
    let dir = TestDir::new();
    let path = dir.table_path("locked");
    let writer = create(&dir, "locked");

    let err = Table::open(&path, OpenMode::READER | OpenMode::LOCK_NONBLOCKING).err().unwrap();
    assert_eq!(err.code(), ErrorCode::Lock);
    let err = Table::open(&path, OpenMode::WRITER | OpenMode::LOCK_NONBLOCKING).err().unwrap();
    assert_eq!(err.code(), ErrorCode::Lock);

    let unlocked = Table::open(&path, OpenMode::READER | OpenMode::NO_LOCK).unwrap();
    drop(unlocked);
    writer.close().unwrap();

    let first = Table::open(&path, OpenMode::READER | OpenMode::LOCK_NONBLOCKING).unwrap();
    let second = Table::open(&path, OpenMode::READER | OpenMode::LOCK_NONBLOCKING).unwrap();
    let err = Table::open(&path, OpenMode::WRITER | OpenMode::LOCK_NONBLOCKING).err().unwrap();
    assert_eq!(err.code(), ErrorCode::Lock);
    drop((first, second));
    Table::open(&path, OpenMode::WRITER | OpenMode::LOCK_NONBLOCKING).unwrap();
}

#[test]
fn test_optimize_keeps_table_locked() {
    let dir = TestDir::new();
    let path = dir.table_path("relocked");
    let table = create(&dir, "relocked");
    fill(&table, 60);
    table.optimize(&OptimizeOptions::default()).unwrap();

    for mode in [OpenMode::WRITER, OpenMode::READER] {
        let err = Table::open(&path, mode | OpenMode::LOCK_NONBLOCKING).err().unwrap();
        assert_eq!(err.code(), ErrorCode::Lock);
    }
    assert!(dir.file_names().iter().all(|name| !name.contains(".tmp")));

    table.put(b"after", &cols(&[("level", "1")])).unwrap();
    table.close().unwrap();
    let reopened = Table::open(&path, OpenMode::WRITER | OpenMode::LOCK_NONBLOCKING).unwrap();
    assert_eq!(reopened.record_count(), 61);
    assert!(reopened.get(b"after").unwrap().is_some());
    assert_eq!(reopened.get(b"k00042").unwrap().unwrap().get("level").unwrap(), b"2");
}

#[test]
fn test_drop_without_close_is_clean() {
    let dir = TestDir::new();
    {
        let table = create(&dir, "dropped");
        fill(&table, 30);
    }
    let table = Table::open(dir.table_path("dropped"), OpenMode::WRITER).unwrap();
    check_filled(&table, 30);
    assert_eq!(table.path(), dir.table_path("dropped"));
}

#[test]
fn test_config_validation_and_serde() {
    assert!(TableConfig::builder().bucket_count(0).build().is_err());
    assert!(TableConfig::builder().alignment_power(17).build().is_err());

    let dir = TestDir::new();
    let bad = TableConfig { leaf_cache: 0, ..TableConfig::default() };
    let mode = OpenMode::WRITER | OpenMode::CREATE;
    let err = Table::open_with_config(dir.table_path("bad"), mode, bad).err().unwrap();
    assert_eq!(err.code(), ErrorCode::Invalid);

    let config: TableConfig =
        serde_json::from_str(r#"{ "bucket_count": 509, "compression": "lz4" }"#).unwrap();
    assert_eq!(config.bucket_count, 509);
    assert_eq!(config.compression, Compression::Lz4);
    assert_eq!(config.leaf_cache, TableConfig::default().leaf_cache);
    config.validate().unwrap();
}

#[test]
fn test_table_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Table>();
}
