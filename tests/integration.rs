//! Integration tests for the public `Environment` API.
//!
//! These tests exercise the full storage stack (log → tree → locks →
//! checkpoint → cleaner) through the public `arborlog` surface only. No
//! internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, reopen, read-only environments
//! - **Records**: put, get, delete, no-overwrite, partial data
//! - **Duplicates**: ordering, duplicate cursor moves, no-dup-data
//! - **Transactions**: commit, abort, isolation, deadlocks, misuse
//! - **Databases**: remove, rename, truncate, open-handle conflicts
//! - **Comparators**: custom order, validation, mismatches
//! - **Maintenance**: checkpoints, log cleaning, file deletion, I/O sleeps,
//!   read-only readers, backups, utilization checks
//! - **Log scan**: forward and backward visits of data records

use std::cmp::Ordering as CmpOrdering;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use arborlog::{
    CheckpointConfig, Comparator, ComparatorRegistry, Database, DatabaseConfig, DatabaseEntry,
    Environment, EnvironmentConfig, Error, IoSleepHook, LockMode, LogScanConfig, MutableConfig,
    OperationStatus, Partial, ReverseByteComparator, StatsConfig, TransactionConfig,
    latches_held,
};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Daemons off, so every log write in a test is one the test asked for.
fn quiet_config() -> EnvironmentConfig {
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

fn open_env(path: &Path) -> Environment {
    Environment::open(path, quiet_config()).expect("open environment")
}

fn db_config(sorted_duplicates: bool) -> DatabaseConfig {
    DatabaseConfig {
        allow_create: true,
        transactional: true,
        sorted_duplicates,
        ..DatabaseConfig::default()
    }
}

fn entry(bytes: &str) -> DatabaseEntry {
    DatabaseEntry::new(bytes)
}

fn get(db: &Database, key: &str) -> Option<Vec<u8>> {
    db.get(None, key.as_bytes(), LockMode::Default).unwrap()
}

fn all_records(db: &Database) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = db.open_cursor(None, Default::default()).unwrap();
    let mut out = Vec::new();
    while let Some(kv) = cursor.next(LockMode::Default).unwrap() {
        out.push(kv);
    }
    cursor.close();
    out
}

fn log_files(path: &Path) -> usize {
    std::fs::read_dir(path)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".jdb"))
        .count()
}

/// Small log files, so overwrites leave whole files for the cleaner.
fn small_files_config() -> EnvironmentConfig {
    EnvironmentConfig {
        log_file_max: 4096,
        ..quiet_config()
    }
}

fn round_value(round: u32) -> String {
    format!("{round:0>200}")
}

/// Overwrites twenty keys once per round, then checkpoints.
fn overwrite_rounds(env: &Environment, db: &Database, rounds: u32) {
    for round in 0..rounds {
        for key in 0..20u32 {
            db.put(None, &entry(&format!("key{key:02}")), &entry(&round_value(round)))
                .unwrap();
        }
    }
    env.checkpoint(CheckpointConfig { force: true }).unwrap();
}

fn checkpoints_run(env: &Environment) -> u64 {
    env.stats(StatsConfig::default()).unwrap().checkpoints.checkpoints
}

fn files_deleted(env: &Environment) -> u64 {
    env.stats(StatsConfig::default()).unwrap().cleaner.files_deleted
}

/// Treats every value by its first byte only.
struct FirstByteComparator;

impl Comparator for FirstByteComparator {
    fn name(&self) -> &str {
        "first-byte"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering {
        a.first().cmp(&b.first())
    }
}

// ================================================================================================
// Lifecycle
// ================================================================================================

/// # Scenario
/// Data written through one environment handle is visible after a clean
/// close and reopen.
///
/// # Actions
/// 1. Open, create `"people"`, put two records, close.
/// 2. Reopen and read both records.
///
/// # Expected behavior
/// Both records are returned with their values.
#[test]
fn data_survives_close_and_reopen() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "people", db_config(false)).unwrap();
    db.put(None, &entry("ada"), &entry("lovelace")).unwrap();
    db.put(None, &entry("alan"), &entry("turing")).unwrap();
    db.close().unwrap();
    env.close().unwrap();

    let env = open_env(dir.path());
    let db = env.open_database(None, "people", db_config(false)).unwrap();
    assert_eq!(get(&db, "ada"), Some(b"lovelace".to_vec()));
    assert_eq!(get(&db, "alan"), Some(b"turing".to_vec()));
    assert_eq!(env.database_names().unwrap(), vec!["people".to_string()]);
}

#[test]
fn close_is_idempotent_and_final() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    env.close().unwrap();
    env.close().unwrap();
    assert!(!env.is_valid());
    assert!(matches!(
        env.open_database(None, "x", db_config(false)),
        Err(Error::Closed)
    ));
}

#[test]
fn missing_home_without_allow_create_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = EnvironmentConfig {
        allow_create: false,
        ..quiet_config()
    };
    let result = Environment::open(dir.path().join("absent"), config);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

/// # Scenario
/// A read-only environment reads existing data and rejects every write.
///
/// # Expected behavior
/// Reads succeed; `put`, `checkpoint` and database creation fail with
/// `ReadOnly`.
#[test]
fn read_only_environment_rejects_writes() {
    let dir = TempDir::new().unwrap();
    {
        let env = open_env(dir.path());
        let db = env.open_database(None, "kv", db_config(false)).unwrap();
        db.put(None, &entry("k"), &entry("v")).unwrap();
    }

    let env = Environment::open(
        dir.path(),
        EnvironmentConfig {
            read_only: true,
            ..quiet_config()
        },
    )
    .unwrap();
    let db = env
        .open_database(None, "kv", DatabaseConfig::default())
        .unwrap();
    assert_eq!(get(&db, "k"), Some(b"v".to_vec()));
    assert!(matches!(
        db.put(None, &entry("k"), &entry("w")),
        Err(Error::ReadOnly)
    ));
    assert!(matches!(
        env.checkpoint(CheckpointConfig { force: true }),
        Err(Error::ReadOnly)
    ));
    assert!(matches!(
        env.open_database(None, "new", db_config(false)),
        Err(Error::ReadOnly)
    ));
}

/// # Scenario
/// A clean close ends the log with a complete checkpoint, so reopening
/// has nothing to recover.
///
/// # Actions
/// 1. Write and close.
/// 2. Reopen and close twice, checking the checkpoint count each time.
///
/// # Expected behavior
/// Every `close` succeeds, no reopen runs a recovery checkpoint, and the
/// data is intact.
#[test]
fn clean_close_needs_no_recovery_checkpoint() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    db.put(None, &entry("k"), &entry("v")).unwrap();
    db.close().unwrap();
    assert!(env.close().is_ok());

    for _ in 0..2 {
        let env = open_env(dir.path());
        assert_eq!(checkpoints_run(&env), 0);
        let db = env.open_database(None, "kv", db_config(false)).unwrap();
        assert_eq!(get(&db, "k"), Some(b"v".to_vec()));
        db.close().unwrap();
        env.close().unwrap();
    }
}

// ================================================================================================
// Records
// ================================================================================================

#[test]
fn put_get_delete() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();

    assert_eq!(get(&db, "k"), None);
    assert_eq!(db.put(None, &entry("k"), &entry("v1")).unwrap(), OperationStatus::Success);
    assert_eq!(db.put(None, &entry("k"), &entry("v2")).unwrap(), OperationStatus::Success);
    assert_eq!(get(&db, "k"), Some(b"v2".to_vec()));
    assert_eq!(db.count().unwrap(), 1);

    assert_eq!(db.delete(None, b"k").unwrap(), OperationStatus::Success);
    assert_eq!(db.delete(None, b"k").unwrap(), OperationStatus::NotFound);
    assert_eq!(get(&db, "k"), None);
    assert_eq!(db.count().unwrap(), 0);
}

#[test]
fn put_no_overwrite_keeps_existing_record() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();

    db.put(None, &entry("k"), &entry("first")).unwrap();
    assert_eq!(
        db.put_no_overwrite(None, &entry("k"), &entry("second")).unwrap(),
        OperationStatus::KeyExist
    );
    assert_eq!(get(&db, "k"), Some(b"first".to_vec()));
}

#[test]
fn partial_data_replaces_a_range() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();

    db.put(None, &entry("k"), &entry("abcd")).unwrap();
    db.put(None, &entry("k"), &DatabaseEntry::with_partial("XY", 1, 2))
        .unwrap();
    assert_eq!(get(&db, "k"), Some(b"aXYd".to_vec()));
}

/// # Scenario
/// Partial reads return only the requested range of the stored data.
///
/// # Expected behavior
/// `get_partial` and a cursor with a read range return the clipped range,
/// keys untouched; clearing the range restores whole records.
#[test]
fn partial_reads_return_a_range() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    db.put(None, &entry("a"), &entry("abcdef")).unwrap();
    db.put(None, &entry("b"), &entry("xy")).unwrap();

    let range = Partial { offset: 1, length: 3 };
    assert_eq!(
        db.get_partial(None, b"a", range, LockMode::Default).unwrap(),
        Some(b"bcd".to_vec())
    );
    assert_eq!(
        db.get_partial(None, b"b", range, LockMode::Default).unwrap(),
        Some(b"y".to_vec())
    );
    let past_end = Partial { offset: 10, length: 2 };
    assert_eq!(
        db.get_partial(None, b"a", past_end, LockMode::Default).unwrap(),
        Some(Vec::new())
    );
    assert_eq!(db.get_partial(None, b"zz", range, LockMode::Default).unwrap(), None);

    let mut cursor = db.open_cursor(None, Default::default()).unwrap();
    cursor.set_read_partial(Some(range));
    assert_eq!(
        cursor.first(LockMode::Default).unwrap(),
        Some((b"a".to_vec(), b"bcd".to_vec()))
    );
    let mut copy = cursor.dup(true).unwrap();
    assert_eq!(
        copy.next(LockMode::Default).unwrap(),
        Some((b"b".to_vec(), b"y".to_vec()))
    );
    copy.close();
    cursor.set_read_partial(None);
    assert_eq!(
        cursor.current(LockMode::Default).unwrap(),
        (OperationStatus::Success, Some((b"a".to_vec(), b"abcdef".to_vec())))
    );
    cursor.close();
}

#[test]
fn partial_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();

    let key = DatabaseEntry::with_partial("k", 0, 1);
    assert!(matches!(
        db.put(None, &key, &entry("v")),
        Err(Error::InvalidArgument(_))
    ));
    let mut cursor = db.open_cursor(None, Default::default()).unwrap();
    assert!(matches!(
        cursor.put(&key, &entry("v")),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn cursor_walks_keys_in_order_both_ways() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(
        dir.path(),
        EnvironmentConfig {
            node_max_entries: 4,
            ..quiet_config()
        },
    )
    .unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    for i in (0..100u32).rev() {
        db.put(None, &DatabaseEntry::new(i.to_be_bytes()), &entry("v"))
            .unwrap();
    }

    let keys: Vec<Vec<u8>> = all_records(&db).into_iter().map(|(k, _)| k).collect();
    let expected: Vec<Vec<u8>> = (0..100u32).map(|i| i.to_be_bytes().to_vec()).collect();
    assert_eq!(keys, expected);

    let mut cursor = db.open_cursor(None, Default::default()).unwrap();
    let mut backwards = Vec::new();
    while let Some((key, _)) = cursor.prev(LockMode::Default).unwrap() {
        backwards.push(key);
    }
    backwards.reverse();
    assert_eq!(backwards, expected);

    let found = cursor
        .search_key_range(&50u32.to_be_bytes(), LockMode::Default)
        .unwrap();
    assert_eq!(found.map(|(k, _)| k), Some(50u32.to_be_bytes().to_vec()));
    assert_eq!(latches_held(), 0);
}

#[test]
fn cursor_delete_and_put_current() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    for key in ["a", "b", "c"] {
        db.put(None, &entry(key), &entry("old")).unwrap();
    }

    let mut cursor = db.open_cursor(None, Default::default()).unwrap();
    cursor.search_key(b"b", LockMode::Rmw).unwrap().unwrap();
    assert_eq!(cursor.put_current(&entry("new")).unwrap(), OperationStatus::Success);
    assert_eq!(
        cursor.current(LockMode::Default).unwrap(),
        (OperationStatus::Success, Some((b"b".to_vec(), b"new".to_vec())))
    );
    cursor.next(LockMode::Default).unwrap().unwrap();
    assert_eq!(cursor.delete().unwrap(), OperationStatus::Success);
    assert_eq!(cursor.delete().unwrap(), OperationStatus::KeyEmpty);
    assert_eq!(
        cursor.current(LockMode::Default).unwrap(),
        (OperationStatus::KeyEmpty, None)
    );
    cursor.close();

    assert_eq!(
        all_records(&db),
        vec![
            (b"a".to_vec(), b"old".to_vec()),
            (b"b".to_vec(), b"new".to_vec()),
        ]
    );
}

/// # Scenario
/// Records whose data is empty are stored, returned and replayed like any
/// other.
#[test]
fn zero_length_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
    db.put(Some(&txn), &entry("empty"), &entry("")).unwrap();
    txn.commit().unwrap();
    db.put(None, &entry("other"), &entry("x")).unwrap();
    db.put(None, &entry("other"), &entry("")).unwrap();
    assert_eq!(get(&db, "empty"), Some(Vec::new()));
    db.close().unwrap();
    env.close().unwrap();

    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    assert_eq!(
        all_records(&db),
        vec![
            (b"empty".to_vec(), Vec::new()),
            (b"other".to_vec(), Vec::new()),
        ]
    );
    assert_eq!(
        db.get_partial(None, b"empty", Partial { offset: 0, length: 4 }, LockMode::Default)
            .unwrap(),
        Some(Vec::new())
    );
}

// ================================================================================================
// Duplicates
// ================================================================================================

/// # Scenario
/// A database with sorted duplicates keeps several data items per key in
/// duplicate order, and the duplicate cursor moves stay within a key.
///
/// # Expected behavior
/// A full scan returns every pair ordered by key then data; `count`,
/// `next_dup` and `next_no_dup` agree with the stored duplicates.
#[test]
fn sorted_duplicates() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "dups", db_config(true)).unwrap();

    for data in ["c", "a", "b"] {
        db.put(None, &entry("k"), &entry(data)).unwrap();
    }
    db.put(None, &entry("m"), &entry("z")).unwrap();
    assert_eq!(
        db.put_no_dup_data(None, &entry("k"), &entry("a")).unwrap(),
        OperationStatus::KeyExist
    );
    assert_eq!(db.count().unwrap(), 4);
    assert_eq!(get(&db, "k"), Some(b"a".to_vec()));

    let mut cursor = db.open_cursor(None, Default::default()).unwrap();
    assert_eq!(
        cursor.search_key(b"k", LockMode::Default).unwrap(),
        Some((b"k".to_vec(), b"a".to_vec()))
    );
    assert_eq!(cursor.count().unwrap(), 3);
    assert_eq!(
        cursor.next_dup(LockMode::Default).unwrap(),
        Some((b"k".to_vec(), b"b".to_vec()))
    );
    assert_eq!(
        cursor.next_no_dup(LockMode::Default).unwrap(),
        Some((b"m".to_vec(), b"z".to_vec()))
    );
    assert_eq!(cursor.next_dup(LockMode::Default).unwrap(), None);
    assert_eq!(
        cursor.search_both_range(b"k", b"bb", LockMode::Default).unwrap(),
        Some((b"k".to_vec(), b"c".to_vec()))
    );
    cursor.close();

    assert_eq!(db.delete(None, b"k").unwrap(), OperationStatus::Success);
    assert_eq!(all_records(&db), vec![(b"m".to_vec(), b"z".to_vec())]);
}

#[test]
fn no_dup_data_needs_sorted_duplicates() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    assert!(matches!(
        db.put_no_dup_data(None, &entry("k"), &entry("v")),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn reopening_with_other_duplicate_setting_fails() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    env.open_database(None, "kv", db_config(false)).unwrap();
    assert!(matches!(
        env.open_database(None, "kv", db_config(true)),
        Err(Error::InvalidArgument(_))
    ));
}

/// # Scenario
/// A duplicate database holds `K` keys with `D` records each; `M` keys are
/// deleted whole.
///
/// # Expected behavior
/// `(K - M) * D` records remain, before and after compression.
#[test]
fn deleting_keys_removes_all_their_duplicates() {
    const KEYS: u32 = 8;
    const DUPS: u32 = 5;
    const DELETED: u32 = 3;

    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "dups", db_config(true)).unwrap();
    for key in 0..KEYS {
        for dup in 0..DUPS {
            db.put(None, &entry(&format!("k{key}")), &entry(&format!("d{dup}")))
                .unwrap();
        }
    }
    assert_eq!(db.count().unwrap(), u64::from(KEYS * DUPS));

    for key in 0..DELETED {
        assert_eq!(
            db.delete(None, format!("k{key}").as_bytes()).unwrap(),
            OperationStatus::Success
        );
    }
    let expected = u64::from((KEYS - DELETED) * DUPS);
    assert_eq!(db.count().unwrap(), expected);
    env.compress().unwrap();
    assert_eq!(db.count().unwrap(), expected);
    assert_eq!(all_records(&db).len() as u64, expected);
    assert_eq!(get(&db, "k0"), None);
}

// ================================================================================================
// Transactions
// ================================================================================================

#[test]
fn abort_undoes_every_write() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    db.put(None, &entry("a"), &entry("1")).unwrap();

    let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
    db.put(Some(&txn), &entry("a"), &entry("2")).unwrap();
    db.put(Some(&txn), &entry("b"), &entry("2")).unwrap();
    assert_eq!(
        db.get(Some(&txn), b"a", LockMode::Default).unwrap(),
        Some(b"2".to_vec())
    );
    txn.abort().unwrap();

    assert_eq!(get(&db, "a"), Some(b"1".to_vec()));
    assert_eq!(get(&db, "b"), None);
    assert_eq!(db.count().unwrap(), 1);
}

#[test]
fn transaction_misuse_is_rejected() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();

    let parent = env.begin_transaction(None, TransactionConfig::default()).unwrap();
    assert!(matches!(
        env.begin_transaction(Some(&parent), TransactionConfig::default()),
        Err(Error::InvalidArgument(_))
    ));

    let mut cursor = db.open_cursor(Some(&parent), Default::default()).unwrap();
    assert!(matches!(parent.commit(), Err(Error::InvalidArgument(_))));
    cursor.close();
    parent.commit().unwrap();
    assert!(matches!(parent.commit(), Err(Error::InvalidArgument(_))));
    assert!(matches!(parent.abort(), Err(Error::InvalidArgument(_))));
}

/// # Scenario
/// An uncommitted write blocks locking readers until the lock timeout,
/// while a read-uncommitted read sees it at once.
#[test]
fn uncommitted_write_is_isolated() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(
        dir.path(),
        EnvironmentConfig {
            lock_timeout: Duration::from_millis(100),
            ..quiet_config()
        },
    )
    .unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    db.put(None, &entry("k"), &entry("old")).unwrap();

    let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
    db.put(Some(&txn), &entry("k"), &entry("new")).unwrap();

    assert!(matches!(
        db.get(None, b"k", LockMode::Default),
        Err(Error::LockTimeout(_))
    ));
    assert_eq!(
        db.get(None, b"k", LockMode::ReadUncommitted).unwrap(),
        Some(b"new".to_vec())
    );
    txn.commit().unwrap();
    assert_eq!(get(&db, "k"), Some(b"new".to_vec()));
}

/// # Scenario
/// Two transactions lock one key each, then each asks for the other's key.
///
/// # Expected behavior
/// Exactly one of them is chosen as the deadlock victim; after it aborts,
/// the other completes and commits.
#[test]
fn deadlock_picks_one_victim() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(
        dir.path(),
        EnvironmentConfig {
            lock_timeout: Duration::from_secs(5),
            ..quiet_config()
        },
    )
    .unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    let (holding, held) = crossbeam::channel::bounded::<()>(1);

    let (main_result, other_result) = thread::scope(|s| {
        let env = &env;
        let db = &db;
        let other = s.spawn(move || {
            let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
            db.put(Some(&txn), &entry("b"), &entry("2")).unwrap();
            holding.send(()).unwrap();
            let result = db.put(Some(&txn), &entry("a"), &entry("2"));
            match &result {
                Ok(_) => txn.commit().unwrap(),
                Err(_) => txn.abort().unwrap(),
            }
            result
        });

        let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
        db.put(Some(&txn), &entry("a"), &entry("1")).unwrap();
        held.recv().unwrap();
        thread::sleep(Duration::from_millis(100));
        let result = db.put(Some(&txn), &entry("b"), &entry("1"));
        match &result {
            Ok(_) => txn.commit().unwrap(),
            Err(_) => txn.abort().unwrap(),
        }
        (result, other.join().unwrap())
    });

    let victims = [&main_result, &other_result]
        .iter()
        .filter(|r| matches!(r, Err(Error::Deadlock(_))))
        .count();
    assert_eq!(victims, 1, "{main_result:?} / {other_result:?}");
    assert!(main_result.is_ok() || other_result.is_ok());
}

/// # Scenario
/// A cursor sits on `"C"` while another transaction has inserted `"D"`
/// between it and `"F"` without finishing.
///
/// # Actions
/// 1. The cursor's `next` waits on the uncommitted `"D"`.
/// 2. The inserting transaction commits, or aborts.
///
/// # Expected behavior
/// After a commit `next` returns `"D"`; after an abort it skips the phantom
/// and returns `"F"`.
#[test]
fn insert_ahead_of_a_cursor_is_seen_only_when_committed() {
    for commit in [true, false] {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(
            dir.path(),
            EnvironmentConfig {
                lock_timeout: Duration::from_secs(5),
                ..quiet_config()
            },
        )
        .unwrap();
        let db = env.open_database(None, "kv", db_config(false)).unwrap();
        db.put(None, &entry("C"), &entry("c")).unwrap();
        db.put(None, &entry("F"), &entry("f")).unwrap();

        let writer = env.begin_transaction(None, TransactionConfig::default()).unwrap();
        db.put(Some(&writer), &entry("D"), &entry("d")).unwrap();
        let (positioned, ready) = crossbeam::channel::bounded::<()>(1);

        let next = thread::scope(|s| {
            let env = &env;
            let db = &db;
            let reader = s.spawn(move || {
                let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
                let mut cursor = db.open_cursor(Some(&txn), Default::default()).unwrap();
                assert!(cursor.search_key(b"C", LockMode::Default).unwrap().is_some());
                positioned.send(()).unwrap();
                let next = cursor.next(LockMode::Default).unwrap();
                cursor.close();
                txn.commit().unwrap();
                next
            });
            ready.recv().unwrap();
            thread::sleep(Duration::from_millis(100));
            if commit {
                writer.commit().unwrap();
            } else {
                writer.abort().unwrap();
            }
            reader.join().unwrap()
        });

        let expected: &[u8] = if commit { b"D" } else { b"F" };
        assert_eq!(next.map(|(key, _)| key).as_deref(), Some(expected), "commit = {commit}");
    }
}

/// # Scenario
/// A transaction walks five records with a cursor, once under the default
/// isolation and once with read-committed.
///
/// # Expected behavior
/// The default keeps all five read locks until the end; read-committed
/// never holds more than one at a time.
#[test]
fn read_committed_holds_at_most_one_read_lock() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    for key in ["a", "b", "c", "d", "e"] {
        db.put(None, &entry(key), &entry("v")).unwrap();
    }
    let read_locks = || env.lock_stats(StatsConfig::default()).unwrap().read_locks;
    let baseline = read_locks();

    let most_held = |config: TransactionConfig| {
        let txn = env.begin_transaction(None, config).unwrap();
        let mut cursor = db.open_cursor(Some(&txn), Default::default()).unwrap();
        let mut most = 0;
        while cursor.next(LockMode::Default).unwrap().is_some() {
            most = most.max(read_locks().saturating_sub(baseline));
        }
        cursor.close();
        txn.commit().unwrap();
        most
    };

    assert_eq!(most_held(TransactionConfig::default()), 5);
    let read_committed = TransactionConfig {
        read_committed: true,
        ..TransactionConfig::default()
    };
    assert!(most_held(read_committed) <= 1);
    assert_eq!(read_locks(), baseline);
}

// ================================================================================================
// Databases
// ================================================================================================

#[test]
fn rename_truncate_and_remove() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "old", db_config(false)).unwrap();
    for i in 0..10 {
        db.put(None, &entry(&format!("k{i}")), &entry("v")).unwrap();
    }

    assert!(matches!(
        env.rename_database(None, "old", "new"),
        Err(Error::HandleOpen(_))
    ));
    db.close().unwrap();

    env.rename_database(None, "old", "new").unwrap();
    assert_eq!(env.database_names().unwrap(), vec!["new".to_string()]);
    assert!(matches!(
        env.open_database(None, "old", DatabaseConfig::default()),
        Err(Error::DatabaseNotFound(_))
    ));

    assert_eq!(env.truncate_database(None, "new", true).unwrap(), 10);
    let db = env.open_database(None, "new", db_config(false)).unwrap();
    assert_eq!(db.count().unwrap(), 0);
    assert!(matches!(
        env.remove_database(None, "new"),
        Err(Error::HandleOpen(_))
    ));
    db.close().unwrap();

    env.remove_database(None, "new").unwrap();
    assert!(env.database_names().unwrap().is_empty());
    assert!(matches!(
        env.remove_database(None, "new"),
        Err(Error::DatabaseNotFound(_))
    ));
}

#[test]
fn aborted_creation_leaves_no_database() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
    let db = env.open_database(Some(&txn), "temp", db_config(false)).unwrap();
    db.put(Some(&txn), &entry("k"), &entry("v")).unwrap();
    db.close().unwrap();
    txn.abort().unwrap();

    assert!(env.database_names().unwrap().is_empty());
}

#[test]
fn exclusive_create_fails_on_existing_database() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    env.open_database(None, "kv", db_config(false)).unwrap();
    let config = DatabaseConfig {
        exclusive_create: true,
        ..db_config(false)
    };
    assert!(matches!(
        env.open_database(None, "kv", config),
        Err(Error::DatabaseExists(_))
    ));
}

/// # Scenario
/// Truncation inside a transaction is undone by an abort and kept by a
/// commit.
#[test]
fn truncate_follows_its_transaction() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    for i in 0..10 {
        db.put(None, &entry(&format!("k{i}")), &entry("v")).unwrap();
    }
    db.close().unwrap();

    let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
    assert_eq!(env.truncate_database(Some(&txn), "kv", true).unwrap(), 10);
    txn.abort().unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    assert_eq!(db.count().unwrap(), 10);
    assert_eq!(get(&db, "k3"), Some(b"v".to_vec()));
    db.close().unwrap();

    let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
    assert_eq!(env.truncate_database(Some(&txn), "kv", true).unwrap(), 10);
    txn.commit().unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    assert_eq!(db.count().unwrap(), 0);
    db.close().unwrap();
    env.close().unwrap();

    let env = open_env(dir.path());
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    assert_eq!(db.count().unwrap(), 0);
}

#[test]
fn database_stats_describe_the_tree() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(
        dir.path(),
        EnvironmentConfig {
            dup_node_max_entries: 8,
            ..quiet_config()
        },
    )
    .unwrap();
    let narrow = |sorted_duplicates| DatabaseConfig {
        node_max_entries: Some(8),
        ..db_config(sorted_duplicates)
    };

    let plain = env.open_database(None, "plain", narrow(false)).unwrap();
    for i in 0..300 {
        plain.put(None, &entry(&format!("k{i:03}")), &entry("v")).unwrap();
    }
    let stats = plain.stats().unwrap();
    assert_eq!(stats.records, 300);
    assert_eq!(stats.dup_trees, 0);
    assert!(stats.bottom_nodes >= 300 / 8);
    assert!(stats.internal_nodes >= 1);
    assert!(stats.main_height >= 3, "{stats:?}");

    for i in 0..10 {
        plain.delete(None, format!("k{i:03}").as_bytes()).unwrap();
    }
    assert_eq!(plain.stats().unwrap().records, 290);

    let dups = env.open_database(None, "dups", narrow(true)).unwrap();
    for key in 0..10 {
        for dup in 0..20 {
            dups.put(None, &entry(&format!("k{key}")), &entry(&format!("d{dup:02}")))
                .unwrap();
        }
    }
    let stats = dups.stats().unwrap();
    assert_eq!(stats.records, 200);
    assert_eq!(stats.dup_trees, 10);
    assert!(stats.dup_bottom_nodes >= 10 * 3);
    assert!(stats.dup_height >= 2, "{stats:?}");
}

// ================================================================================================
// Comparators
// ================================================================================================

#[test]
fn reverse_comparator_orders_keys_descending() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let config = DatabaseConfig {
        btree_comparator: Some(ReverseByteComparator::NAME.to_string()),
        ..db_config(false)
    };
    let db = env.open_database(None, "rev", config.clone()).unwrap();
    for key in ["b", "a", "c"] {
        db.put(None, &entry(key), &entry("v")).unwrap();
    }
    let keys: Vec<Vec<u8>> = all_records(&db).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    db.close().unwrap();

    // The stored comparator must be named again on reopen.
    let other = DatabaseConfig {
        btree_comparator: Some("bytes".to_string()),
        ..db_config(false)
    };
    assert!(matches!(
        env.open_database(None, "rev", other),
        Err(Error::InvalidArgument(_))
    ));
    env.open_database(None, "rev", config).unwrap();
}

#[test]
fn comparators_are_validated() {
    let dir = TempDir::new().unwrap();
    let mut comparators = ComparatorRegistry::default();
    comparators.register(Arc::new(FirstByteComparator));
    let env = Environment::open(
        dir.path(),
        EnvironmentConfig {
            comparators,
            ..quiet_config()
        },
    )
    .unwrap();

    let unknown = DatabaseConfig {
        btree_comparator: Some("no-such-order".to_string()),
        ..db_config(false)
    };
    assert!(matches!(
        env.open_database(None, "a", unknown),
        Err(Error::InvalidComparator(_))
    ));

    let collapsing = DatabaseConfig {
        duplicate_comparator: Some("first-byte".to_string()),
        ..db_config(true)
    };
    assert!(matches!(
        env.open_database(None, "b", collapsing),
        Err(Error::InvalidComparator(_))
    ));

    // Without duplicates a coarse key order is allowed.
    let coarse = DatabaseConfig {
        btree_comparator: Some("first-byte".to_string()),
        ..db_config(false)
    };
    let db = env.open_database(None, "c", coarse).unwrap();
    db.put(None, &entry("apple"), &entry("1")).unwrap();
    db.put(None, &entry("avocado"), &entry("2")).unwrap();
    assert_eq!(db.count().unwrap(), 1);
    assert_eq!(get(&db, "ant"), Some(b"2".to_vec()));
}

// ================================================================================================
// Maintenance
// ================================================================================================

/// # Scenario
/// Overwriting the same keys many times leaves old log files almost
/// empty; cleaning them migrates what is still live, and the next
/// checkpoint deletes them.
///
/// # Expected behavior
/// At least one file is cleaned and deleted, fewer log files remain, and
/// every key still returns its newest value, also after a reopen.
#[test]
fn cleaned_files_are_deleted_at_the_next_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = EnvironmentConfig {
        log_file_max: 4096,
        ..quiet_config()
    };
    let env = Environment::open(dir.path(), config.clone()).unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    let value = |round: u32| format!("{round:0>200}");
    for round in 0..30u32 {
        for key in 0..20u32 {
            db.put(None, &entry(&format!("key{key:02}")), &entry(&value(round)))
                .unwrap();
        }
    }
    env.checkpoint(CheckpointConfig { force: true }).unwrap();
    let before = log_files(dir.path());

    let cleaned = env.clean_log().unwrap();
    assert!(cleaned > 0);
    env.checkpoint(CheckpointConfig { force: true }).unwrap();

    let stats = env.stats(StatsConfig::default()).unwrap();
    assert!(stats.cleaner.files_deleted > 0);
    assert!(log_files(dir.path()) < before);
    for key in 0..20u32 {
        assert_eq!(
            get(&db, &format!("key{key:02}")),
            Some(value(29).into_bytes())
        );
    }
    db.close().unwrap();
    env.close().unwrap();

    let env = Environment::open(dir.path(), config).unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    assert_eq!(db.count().unwrap(), 20);
    assert_eq!(get(&db, "key07"), Some(value(29).into_bytes()));
}

/// # Scenario
/// With a background write limit of one, every node the checkpointer
/// writes owes a sleep. The sleep hook observes how many tree latches the
/// sleeping thread holds.
///
/// # Expected behavior
/// The hook runs, and never while a latch is held.
#[test]
fn background_io_sleeps_without_latches() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let max_latches = Arc::new(AtomicUsize::new(0));
    let hook: IoSleepHook = {
        let calls = Arc::clone(&calls);
        let max_latches = Arc::clone(&max_latches);
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            max_latches.fetch_max(latches_held(), Ordering::SeqCst);
        })
    };
    let mut config = quiet_config();
    config.node_max_entries = 4;
    config.io_sleep_hook = Some(hook);
    config.mutable.background_write_limit = 1;
    config.mutable.background_sleep_interval = Duration::ZERO;

    let env = Environment::open(dir.path(), config).unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    for i in 0..100u32 {
        db.put(None, &DatabaseEntry::new(i.to_be_bytes()), &entry("v"))
            .unwrap();
    }
    env.checkpoint(CheckpointConfig { force: true }).unwrap();

    assert!(calls.load(Ordering::SeqCst) > 0);
    assert_eq!(max_latches.load(Ordering::SeqCst), 0);
    let stats = env.stats(StatsConfig::default()).unwrap();
    assert!(stats.log.background_sleeps > 0);
}

#[test]
fn mutable_config_is_validated_and_published() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let mut config = env.mutable_config();
    config.cache_size = 1;
    assert!(matches!(
        env.set_mutable_config(config),
        Err(Error::InvalidArgument(_))
    ));

    let mut config = env.mutable_config();
    config.cleaner_min_utilization = 70;
    env.set_mutable_config(config).unwrap();
    assert_eq!(env.mutable_config().cleaner_min_utilization, 70);
}

/// # Scenario
/// A read-only environment is open on the directory while the writer
/// cleans and checkpoints.
///
/// # Expected behavior
/// No file is deleted while the reader is open, and the reader can still
/// read. Once it closes, the next checkpoint deletes the cleaned files.
#[test]
fn read_only_handle_keeps_cleaned_files() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), small_files_config()).unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    overwrite_rounds(&env, &db, 30);
    let before = log_files(dir.path());

    let reader = Environment::open(
        dir.path(),
        EnvironmentConfig {
            read_only: true,
            ..quiet_config()
        },
    )
    .unwrap();
    assert!(env.clean_log().unwrap() > 0);
    env.checkpoint(CheckpointConfig { force: true }).unwrap();
    assert_eq!(files_deleted(&env), 0);
    assert!(log_files(dir.path()) >= before);

    let view = reader
        .open_database(None, "kv", DatabaseConfig::default())
        .unwrap();
    assert_eq!(get(&view, "key05"), Some(round_value(29).into_bytes()));
    view.close().unwrap();
    reader.close().unwrap();

    env.checkpoint(CheckpointConfig { force: true }).unwrap();
    assert!(files_deleted(&env) > 0);
    assert!(log_files(dir.path()) < before);
}

/// # Scenario
/// A backup is started, the log is cleaned, and the backup files are
/// copied to another directory.
///
/// # Expected behavior
/// Every file of the backup set outlives the checkpoint after cleaning.
/// After the backup ends, the next checkpoint deletes cleaned files. The
/// copy opens as an environment holding the data.
#[test]
fn backup_pins_its_files_until_it_ends() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), small_files_config()).unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    overwrite_rounds(&env, &db, 30);

    let backup = env.start_backup().unwrap();
    let paths = backup.log_paths();
    assert!(!paths.is_empty());
    assert_eq!(paths.len(), backup.log_files().len());
    assert!(backup.last_file().is_some());

    assert!(env.clean_log().unwrap() > 0);
    env.checkpoint(CheckpointConfig { force: true }).unwrap();
    assert_eq!(files_deleted(&env), 0);
    assert!(paths.iter().all(|p| p.exists()));

    let copy = TempDir::new().unwrap();
    for (path, name) in paths.iter().zip(backup.log_files()) {
        std::fs::copy(path, copy.path().join(name)).unwrap();
    }
    backup.end();

    env.checkpoint(CheckpointConfig { force: true }).unwrap();
    assert!(files_deleted(&env) > 0);
    assert!(paths.iter().any(|p| !p.exists()));

    let restored = Environment::open(copy.path(), small_files_config()).unwrap();
    let db = restored.open_database(None, "kv", db_config(false)).unwrap();
    assert_eq!(db.count().unwrap(), 20);
    assert_eq!(get(&db, "key11"), Some(round_value(29).into_bytes()));
}

/// # Scenario
/// Transactions overwrite keys, some of them abort, and keys are deleted
/// along the way. The log is then cleaned and checkpointed, and the
/// environment reopened.
///
/// # Expected behavior
/// Every key holds its last committed value both before and after the
/// reopen, and the utilization check finds nothing wrong either time.
#[test]
fn cleaning_after_aborts_and_deletes_keeps_committed_state() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), small_files_config()).unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    let mut model = std::collections::BTreeMap::new();

    for round in 0..24u32 {
        let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
        for key in 0..16u32 {
            let key = format!("key{key:02}");
            db.put(Some(&txn), &entry(&key), &entry(&round_value(round)))
                .unwrap();
            if round % 3 != 2 {
                model.insert(key.into_bytes(), round_value(round).into_bytes());
            }
        }
        if round % 3 == 2 {
            txn.abort().unwrap();
        } else {
            txn.commit().unwrap();
        }
        if round % 6 == 5 {
            for key in (round % 4..16).step_by(4) {
                let key = format!("key{key:02}");
                db.delete(None, key.as_bytes()).unwrap();
                model.remove(key.as_bytes());
            }
        }
    }
    let expected: Vec<_> = model.into_iter().collect();
    env.checkpoint(CheckpointConfig { force: true }).unwrap();
    assert!(env.clean_log_with(true, false).unwrap() > 0);
    env.checkpoint(CheckpointConfig { force: true }).unwrap();
    assert!(files_deleted(&env) > 0);

    assert_eq!(all_records(&db), expected);
    assert_eq!(env.verify_utilization().unwrap(), Vec::new());
    db.close().unwrap();
    env.close().unwrap();

    let env = Environment::open(dir.path(), small_files_config()).unwrap();
    let db = env.open_database(None, "kv", db_config(false)).unwrap();
    assert_eq!(all_records(&db), expected);
    assert_eq!(env.verify_utilization().unwrap(), Vec::new());
}

// ================================================================================================
// Log scan
// ================================================================================================

/// # Scenario
/// Records written between two points of the log are visited in log
/// order, or in reverse, with their database name and deletion flag.
#[test]
fn scan_log_visits_data_records() {
    let dir = TempDir::new().unwrap();
    let env = open_env(dir.path());
    let db = env.open_database(None, "scanned", db_config(false)).unwrap();

    let start = env.end_of_log();
    db.put(None, &entry("a"), &entry("1")).unwrap();
    db.put(None, &entry("b"), &entry("2")).unwrap();
    db.delete(None, b"a").unwrap();
    env.sync().unwrap();
    let end = env.end_of_log();

    let mut forward = Vec::new();
    env.scan_log(start, end, LogScanConfig::default(), |record| {
        assert_eq!(record.database_name, "scanned");
        forward.push((record.key, record.deleted));
        true
    })
    .unwrap();
    assert_eq!(
        forward,
        vec![
            (b"a".to_vec(), false),
            (b"b".to_vec(), false),
            (b"a".to_vec(), true),
        ]
    );

    let mut backward = Vec::new();
    env.scan_log(end, start, LogScanConfig { forwards: false }, |record| {
        backward.push(record.key);
        true
    })
    .unwrap();
    assert_eq!(backward, vec![b"a".to_vec(), b"b".to_vec(), b"a".to_vec()]);

    let mut first_only = 0;
    env.scan_log(start, end, LogScanConfig::default(), |_| {
        first_only += 1;
        false
    })
    .unwrap();
    assert_eq!(first_only, 1);

    assert!(matches!(
        env.scan_log(end, start, LogScanConfig::default(), |_| true),
        Err(Error::InvalidArgument(_))
    ));
}
