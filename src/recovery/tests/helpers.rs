use std::path::Path;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::{
    Database, DatabaseConfig, DatabaseEntry, Environment, EnvironmentConfig, LockMode, MutableConfig,
    Transaction,
};

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// An environment without daemons, so nothing is logged behind the test's
/// back.
pub fn open_env(dir: &Path) -> Environment {
    let config = EnvironmentConfig {
        log_file_max: 64 * 1024,
        mutable: MutableConfig {
            run_cleaner: false,
            run_checkpointer: false,
            run_compressor: false,
            run_evictor: false,
            ..MutableConfig::default()
        },
        ..EnvironmentConfig::default()
    };
    Environment::open(dir, config).unwrap()
}

pub fn open_db(env: &Environment, name: &str, sorted_duplicates: bool) -> Database {
    env.open_database(
        None,
        name,
        DatabaseConfig {
            allow_create: true,
            transactional: true,
            sorted_duplicates,
            ..DatabaseConfig::default()
        },
    )
    .unwrap()
}

pub fn put(db: &Database, txn: Option<&Transaction>, key: &str, data: &str) {
    db.put(txn, &DatabaseEntry::new(key), &DatabaseEntry::new(data))
        .unwrap();
}

pub fn get(db: &Database, key: &str) -> Option<String> {
    db.get(None, key.as_bytes(), LockMode::Default)
        .unwrap()
        .map(|v| String::from_utf8(v).unwrap())
}
