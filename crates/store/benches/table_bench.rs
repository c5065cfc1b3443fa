//! Table engine benchmarks.
//!
//! These benchmarks measure the costs callers see most: point lookups and
//! puts on the hash store, transactional batch writes with an index to
//! maintain, and queries answered from an index versus a full scan.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, time::Duration};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tabula_store::{
    Columns, Compression, Direction, Domain, IndexKind, Op, OpenMode, Query, Table, TableConfig,
};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn record(i: usize) -> Columns {
    let mut columns = Columns::new();
    columns.insert("name".to_string(), format!("user-{i}").into_bytes());
    columns.insert("age".to_string(), (i % 90).to_string().into_bytes());
    columns.insert("tags".to_string(), format!("t{} t{}", i % 7, i % 13).into_bytes());
    columns
}

fn create(dir: &TempDir, config: TableConfig) -> Table {
    let path = dir.path().join("bench.tbl");
    Table::open_with_config(path, OpenMode::WRITER | OpenMode::CREATE, config).expect("open table")
}

/// Populate a table with `count` records in transactions of `batch_size`.
fn populate(table: &Table, count: usize, batch_size: usize) {
    for batch_start in (0..count).step_by(batch_size) {
        let batch_end = (batch_start + batch_size).min(count);
        table
            .with_transaction(|t| {
                for i in batch_start..batch_end {
                    t.put(format!("key-{i:08}").as_bytes(), &record(i))?;
                }
                Ok(())
            })
            .expect("populate");
    }
}

// =============================================================================
// Point Operations
// =============================================================================

/// Benchmark lookups of present keys at various table sizes.
fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("point_lookup");
    group.measurement_time(Duration::from_secs(5));

    for size in [1_000usize, 10_000] {
        let dir = TempDir::new().expect("temp dir");
        let table = create(&dir, TableConfig::default());
        populate(&table, size, 500);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 7919) % size;
                black_box(table.get(format!("key-{i:08}").as_bytes()).expect("get"))
            });
        });
    }
    group.finish();
}

/// Benchmark single puts as their own unit of work, per codec.
fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");

    for codec in [Compression::None, Compression::Deflate, Compression::Lz4] {
        let dir = TempDir::new().expect("temp dir");
        let config = TableConfig::builder()
            .bucket_count(65_521)
            .compression(codec)
            .build()
            .expect("config");
        let table = create(&dir, config);

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::from_parameter(format!("{codec:?}")), |b| {
            let mut i = 0usize;
            b.iter(|| {
                i += 1;
                table.put(format!("key-{i:08}").as_bytes(), &record(i)).expect("put");
            });
        });
    }
    group.finish();
}

// =============================================================================
// Batch Writes
// =============================================================================

/// Benchmark transactional batches with and without a token index.
fn bench_batch_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_insert");
    group.sample_size(10);

    for indexed in [false, true] {
        let label = if indexed { "token_index" } else { "no_index" };
        group.throughput(Throughput::Elements(1_000));
        group.bench_function(label, |b| {
            b.iter_with_setup(
                || {
                    let dir = TempDir::new().expect("temp dir");
                    let table = create(&dir, TableConfig::default());
                    if indexed {
                        table.define_index("tags", IndexKind::Token, false).expect("index");
                    }
                    (dir, table)
                },
                |(_dir, table)| populate(&table, 1_000, 1_000),
            );
        });
    }
    group.finish();
}

// =============================================================================
// Queries
// =============================================================================

/// Benchmark an indexed numeric range query against the same query on a
/// table without indexes.
fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");
    let query = Query::new()
        .condition("age", Op::NumBetween, "30 39")
        .order("age", Direction::Ascending, Domain::Numeric)
        .limit(50, 0);

    for indexed in [false, true] {
        let dir = TempDir::new().expect("temp dir");
        let table = create(&dir, TableConfig::default());
        if indexed {
            table.define_index("age", IndexKind::Decimal, false).expect("index");
        }
        populate(&table, 10_000, 1_000);

        let label = if indexed { "decimal_index" } else { "full_scan" };
        group.bench_function(label, |b| {
            b.iter(|| black_box(table.search(&query).expect("search")));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_point_lookup, bench_put, bench_batch_insert, bench_query);
criterion_main!(benches);
