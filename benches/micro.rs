//! Micro-benchmarks for ArborLog core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- put       # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use arborlog::{
    CheckpointConfig, Database, DatabaseConfig, DatabaseEntry, Durability, Environment,
    EnvironmentConfig, LockMode, MutableConfig, TransactionConfig,
};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Default value payload for benchmarks (128 bytes).
const VALUE_128B: &[u8; 128] = &[0xAB; 128];

/// Larger value payload (1 KiB).
const VALUE_1K: &[u8; 1024] = &[0xCD; 1024];

/// Format a zero-padded key.
fn make_key(i: u64) -> DatabaseEntry {
    DatabaseEntry::new(format!("key-{i:012}"))
}

/// Environment with every daemon stopped, so measurements only include
/// the work of the benchmarked call.
fn bench_config() -> EnvironmentConfig {
    EnvironmentConfig {
        mutable: MutableConfig {
            run_cleaner: false,
            run_checkpointer: false,
            run_compressor: false,
            run_evictor: false,
            ..MutableConfig::default()
        },
        ..EnvironmentConfig::default()
    }
}

fn open(dir: &std::path::Path) -> (Environment, Database) {
    let env = Environment::open(dir, bench_config()).expect("open");
    let db = env
        .open_database(
            None,
            "bench",
            DatabaseConfig {
                allow_create: true,
                transactional: true,
                ..DatabaseConfig::default()
            },
        )
        .expect("open database");
    (env, db)
}

/// Write `count` sequential keys in batches of one transaction each and
/// close, so the records live in checkpointed log files.
fn prepopulate(dir: &std::path::Path, count: u64, value: &[u8]) {
    let (env, db) = open(dir);
    let value = DatabaseEntry::new(value);
    for batch in (0..count).collect::<Vec<_>>().chunks(500) {
        let txn = env
            .begin_transaction(None, TransactionConfig::default())
            .unwrap();
        for &i in batch {
            db.put(Some(&txn), &make_key(i), &value).unwrap();
        }
        txn.commit().unwrap();
    }
    db.close().unwrap();
    env.close().unwrap();
}

fn no_sync() -> TransactionConfig {
    TransactionConfig {
        durability: Durability::NoSync,
        ..TransactionConfig::default()
    }
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

/// Benchmark group for write (`put`) operations.
///
/// # Sub-benchmarks
///
/// ## `auto_commit/128B` and `auto_commit/1K`
///
/// **Scenario:** Inserts a single record outside any explicit transaction, so every put
/// commits with the default `Sync` durability.
///
/// **What it measures:** The full write path: record lock, tree descent and slot insert,
/// log append of the record and its commit entry, then fsync.
///
/// **Expected behaviour:** Dominated by the fsync. 1 KiB values should be only marginally
/// slower than 128 B.
///
/// ## `no_sync_txn`
///
/// **Scenario:** The same put inside a transaction committed with `NoSync` durability.
///
/// **What it measures:** The write path without the fsync: locking, tree insert and log
/// buffering.
fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");

    for &(label, value) in &[("128B", VALUE_128B.as_slice()), ("1K", VALUE_1K.as_slice())] {
        group.bench_function(BenchmarkId::new("auto_commit", label), |b| {
            let dir = TempDir::new().unwrap();
            let (env, db) = open(dir.path());
            let value = DatabaseEntry::new(value);
            let mut seq = 0u64;

            b.iter(|| {
                db.put(None, black_box(&make_key(seq)), black_box(&value))
                    .unwrap();
                seq += 1;
            });

            db.close().unwrap();
            env.close().unwrap();
        });
    }

    group.bench_function("no_sync_txn", |b| {
        let dir = TempDir::new().unwrap();
        let (env, db) = open(dir.path());
        let value = DatabaseEntry::new(VALUE_128B);
        let mut seq = 0u64;

        b.iter(|| {
            let txn = env.begin_transaction(None, no_sync()).unwrap();
            db.put(Some(&txn), black_box(&make_key(seq)), black_box(&value))
                .unwrap();
            txn.commit().unwrap();
            seq += 1;
        });

        db.close().unwrap();
        env.close().unwrap();
    });

    group.finish();
}

// ================================================================================================
// Read benchmarks
// ================================================================================================

/// Benchmark group for read (`get`) operations.
///
/// # Sub-benchmarks
///
/// ## `cached_hit` and `miss`
///
/// **Scenario:** Random reads over 10,000 keys written by the same handle, so every node
/// and record is resident; misses query keys above that range.
///
/// **What it measures:** Tree descent with shared latches plus a short-lived read lock.
///
/// ## `cold_hit`
///
/// **Scenario:** Random reads after a reopen. Nodes are fetched from the log on first
/// touch and stay cached afterwards.
///
/// **What it measures:** The fetch path (log read, checksum, decode) amortised over the
/// warm-up of the cache.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let n = 10_000u64;

    {
        let dir = TempDir::new().unwrap();
        prepopulate(dir.path(), n, VALUE_128B);
        let (env, db) = open(dir.path());
        for i in 0..n {
            db.get(None, make_key(i).data(), LockMode::Default).unwrap();
        }

        group.bench_function("cached_hit", |b| {
            let mut rng = StdRng::seed_from_u64(7);
            b.iter(|| {
                let key = make_key(rng.random_range(0..n));
                black_box(db.get(None, black_box(key.data()), LockMode::Default).unwrap());
            });
        });

        group.bench_function("miss", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let key = make_key(n + i);
                black_box(db.get(None, black_box(key.data()), LockMode::Default).unwrap());
                i += 1;
            });
        });

        db.close().unwrap();
        env.close().unwrap();
    }

    group.bench_function("cold_hit", |b| {
        let dir = TempDir::new().unwrap();
        prepopulate(dir.path(), n, VALUE_128B);
        let mut rng = StdRng::seed_from_u64(11);
        b.iter_batched(
            || open(dir.path()),
            |(env, db)| {
                for _ in 0..100 {
                    let key = make_key(rng.random_range(0..n));
                    black_box(db.get(None, key.data(), LockMode::Default).unwrap());
                }
                (env, db)
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

// ================================================================================================
// Delete benchmarks
// ================================================================================================

/// Benchmark group for delete operations.
///
/// # Sub-benchmarks
///
/// ## `point`
///
/// **Scenario:** Deletes one existing key per iteration inside a `NoSync` transaction.
///
/// **What it measures:** Locking the record, logging a deleted record and marking the slot
/// deleted. Structurally close to `put/no_sync_txn`.
fn bench_delete(c: &mut Criterion) {
    let mut group = c.benchmark_group("delete");

    group.bench_function("point", |b| {
        let dir = TempDir::new().unwrap();
        prepopulate(dir.path(), 50_000, VALUE_128B);
        let (env, db) = open(dir.path());
        let mut seq = 0u64;

        b.iter(|| {
            let txn = env.begin_transaction(None, no_sync()).unwrap();
            black_box(db.delete(Some(&txn), make_key(seq % 50_000).data()).unwrap());
            txn.commit().unwrap();
            seq += 1;
        });

        db.close().unwrap();
        env.close().unwrap();
    });

    group.finish();
}

// ================================================================================================
// Cursor benchmarks
// ================================================================================================

/// Benchmark group for cursor scans.
///
/// # Sub-benchmarks
///
/// ## `full/{1000,10000}`
///
/// **Scenario:** A cursor walks every record of the database from the first to the last.
///
/// **What it measures:** Sibling traversal across bottom nodes, with one read lock taken
/// and released per record.
///
/// ## `range_100`
///
/// **Scenario:** `search_key_range` at a random key, then 99 `next` calls.
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");

    for &count in &[1_000u64, 10_000] {
        let dir = TempDir::new().unwrap();
        prepopulate(dir.path(), count, VALUE_128B);
        let (env, db) = open(dir.path());

        group.throughput(Throughput::Elements(count));
        group.bench_function(BenchmarkId::new("full", count), |b| {
            b.iter(|| {
                let mut cursor = db.open_cursor(None, Default::default()).unwrap();
                let mut seen = 0u64;
                while let Some(kv) = cursor.next(LockMode::Default).unwrap() {
                    black_box(kv);
                    seen += 1;
                }
                assert_eq!(seen, count);
            });
        });

        if count == 10_000 {
            group.throughput(Throughput::Elements(100));
            group.bench_function("range_100", |b| {
                let mut rng = StdRng::seed_from_u64(3);
                b.iter(|| {
                    let mut cursor = db.open_cursor(None, Default::default()).unwrap();
                    let start = make_key(rng.random_range(0..count - 100));
                    black_box(
                        cursor
                            .search_key_range(start.data(), LockMode::Default)
                            .unwrap(),
                    );
                    for _ in 0..99 {
                        black_box(cursor.next(LockMode::Default).unwrap());
                    }
                });
            });
        }

        db.close().unwrap();
        env.close().unwrap();
    }

    group.finish();
}

// ================================================================================================
// Maintenance benchmarks
// ================================================================================================

/// Benchmark group for background work run on demand.
///
/// # Sub-benchmarks
///
/// ## `checkpoint/1000_dirty`
///
/// **Scenario:** 1,000 records are written, then a forced checkpoint flushes every dirty
/// node bottom-up.
///
/// **What it measures:** Node serialization and logging plus the summary and mapping
/// records written at each checkpoint.
///
/// ## `clean_log`
///
/// **Scenario:** 20 keys overwritten 200 times with small log files, followed by a checkpoint
/// and one cleaner run.
///
/// **What it measures:** Reading whole files, checking each entry's liveness against the
/// tree, and migrating the few live records.
fn bench_maintenance(c: &mut Criterion) {
    let mut group = c.benchmark_group("maintenance");
    group.sample_size(10);

    group.bench_function(BenchmarkId::new("checkpoint", "1000_dirty"), |b| {
        let dir = TempDir::new().unwrap();
        let (env, db) = open(dir.path());
        let value = DatabaseEntry::new(VALUE_128B);
        let mut round = 0u64;
        b.iter_batched(
            || {
                let txn = env.begin_transaction(None, no_sync()).unwrap();
                for i in 0..1_000 {
                    db.put(Some(&txn), &make_key(round * 1_000 + i), &value)
                        .unwrap();
                }
                txn.commit().unwrap();
                round += 1;
            },
            |()| env.checkpoint(CheckpointConfig { force: true }).unwrap(),
            BatchSize::PerIteration,
        );
        db.close().unwrap();
        env.close().unwrap();
    });

    group.bench_function("clean_log", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let env = Environment::open(
                    dir.path(),
                    EnvironmentConfig {
                        log_file_max: 16 * 1024,
                        ..bench_config()
                    },
                )
                .unwrap();
                let db = env
                    .open_database(
                        None,
                        "bench",
                        DatabaseConfig {
                            allow_create: true,
                            transactional: true,
                            ..DatabaseConfig::default()
                        },
                    )
                    .unwrap();
                let value = DatabaseEntry::new(VALUE_128B);
                for _ in 0..200 {
                    let txn = env.begin_transaction(None, no_sync()).unwrap();
                    for key in 0..20 {
                        db.put(Some(&txn), &make_key(key), &value).unwrap();
                    }
                    txn.commit().unwrap();
                }
                env.checkpoint(CheckpointConfig { force: true }).unwrap();
                (dir, env, db)
            },
            |(dir, env, db)| {
                black_box(env.clean_log().unwrap());
                (dir, env, db)
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

// ================================================================================================
// Recovery benchmarks
// ================================================================================================

/// Benchmark group for environment open.
///
/// # Sub-benchmarks
///
/// ## `open_existing/{1000,10000}`
///
/// **Scenario:** Opens an environment that was closed cleanly after writing N records.
///
/// **What it measures:** Finding the last checkpoint by scanning backwards, loading the
/// mapping tree and utilization summaries. No redo work is needed after a clean close.
fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");
    group.sample_size(10);

    for &count in &[1_000u64, 10_000] {
        group.bench_function(BenchmarkId::new("open_existing", count), |b| {
            let dir = TempDir::new().unwrap();
            prepopulate(dir.path(), count, VALUE_128B);

            b.iter(|| {
                let env = Environment::open(dir.path(), bench_config()).unwrap();
                black_box(&env);
                env.close().unwrap();
            });
        });
    }

    group.finish();
}

// ================================================================================================
// Group registration
// ================================================================================================

criterion_group!(
    benches,
    bench_put,
    bench_get,
    bench_delete,
    bench_scan,
    bench_maintenance,
    bench_recovery,
);

criterion_main!(benches);
