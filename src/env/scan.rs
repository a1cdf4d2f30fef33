//! Forensic scans of the log.

use std::collections::HashMap;

use tracing::debug;

use crate::config::LogScanConfig;
use crate::log::entry::{LnKind, LogEntry};
use crate::log::scanner::{BackwardScanner, ForwardScanner, ScannedEntry};
use crate::log::{LogError, Lsn};
use crate::{DatabaseId, Error};

use super::EnvironmentImpl;
use super::dbtree::is_reserved;

/// A record version found by [`Environment::scan_log`](crate::Environment::scan_log).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRecord {
    pub key: Vec<u8>,
    /// The record data; for a deleted duplicate, the duplicate it deleted.
    pub data: Vec<u8>,
    pub deleted: bool,
    pub database_name: String,
    pub lsn: Lsn,
}

/// Visits the data records of user databases between `start` and `end`.
///
/// # Errors
///
/// `InvalidArgument` when the range is empty for the scan direction or
/// reaches past the end of the log.
pub(crate) fn scan_log(
    env: &EnvironmentImpl,
    start: Lsn,
    end: Lsn,
    config: &LogScanConfig,
    visitor: &mut dyn FnMut(ScannedRecord) -> bool,
) -> Result<(), Error> {
    env.check_usable()?;
    let end_of_log = env.log.end_of_log();
    if start.is_null() || end.is_null() || start > end_of_log || end > end_of_log {
        return Err(Error::InvalidArgument(format!(
            "scan range {start}..{end} is outside the log, which ends at {end_of_log}"
        )));
    }
    if config.forwards && start >= end {
        return Err(Error::InvalidArgument(format!(
            "a forward scan needs start < end, got {start}..{end}"
        )));
    }
    if !config.forwards && start <= end {
        return Err(Error::InvalidArgument(format!(
            "a backward scan needs start > end, got {start}..{end}"
        )));
    }

    let names = env.names_by_id()?;
    let mut visited = 0u64;
    let mut visit = |entry: Result<ScannedEntry, LogError>| -> Result<bool, Error> {
        let entry = match entry {
            Ok(entry) => entry,
            // A file deleted by the cleaner during the scan holds nothing live.
            Err(LogError::FileNotFound(_)) => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        if entry.entry_type() != LnKind::Data.entry_type() {
            return Ok(true);
        }
        let LogEntry::Ln(ln) = entry.decode()? else {
            return Ok(true);
        };
        let Some(name) = database_name(&names, ln.db_id) else {
            return Ok(true);
        };
        visited += 1;
        Ok(visitor(ScannedRecord {
            key: ln.key,
            data: ln.data,
            deleted: ln.deleted,
            database_name: name.to_string(),
            lsn: entry.lsn,
        }))
    };

    if config.forwards {
        for entry in ForwardScanner::new(&env.log, start, end) {
            if !visit(entry)? {
                break;
            }
        }
    } else {
        let from = start.min(env.log.last_entry_lsn());
        for entry in BackwardScanner::new(&env.log, from, end) {
            if !visit(entry)? {
                break;
            }
        }
    }
    debug!(%start, %end, forwards = config.forwards, visited, "log scan finished");
    Ok(())
}

fn database_name(names: &HashMap<DatabaseId, String>, id: DatabaseId) -> Option<&str> {
    if is_reserved(id) {
        return None;
    }
    names.get(&id).map(String::as_str)
}
