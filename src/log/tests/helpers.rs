use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::cleaner::UtilizationTracker;
use crate::env::Validity;
use crate::log::entry::{LnEntry, LnKind, LogEntry, TxnEndEntry};
use crate::log::{LogConfig, LogError, LogManager, Lsn};

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub fn open_log(dir: &Path, file_max: u32) -> Result<LogManager, LogError> {
    open_log_with(dir, file_max, false)
}

pub fn open_log_with(dir: &Path, file_max: u32, read_only: bool) -> Result<LogManager, LogError> {
    LogManager::open(
        dir,
        LogConfig {
            file_max,
            buffer_size: 1024,
            read_only,
        },
        Arc::new(UtilizationTracker::new()),
        Arc::new(Validity::new()),
    )
}

pub fn ln(key: &[u8], data: &[u8]) -> LogEntry {
    LogEntry::Ln(LnEntry {
        kind: LnKind::Data,
        db_id: 3,
        ln_id: 1,
        key: key.to_vec(),
        data: data.to_vec(),
        deleted: false,
        txn: None,
    })
}

pub fn commit(txn_id: u64) -> LogEntry {
    LogEntry::Commit(TxnEndEntry {
        txn_id,
        last_lsn: Lsn::NULL,
        time_ms: 0,
    })
}
