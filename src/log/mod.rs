//! Append-only, checksummed, multi-file log.
//!
//! Every durable change in arborlog is an entry in this log: leaf records,
//! tree node images, transaction markers, checkpoint markers and file
//! utilization summaries. An entry is addressed by its [`Lsn`], a
//! `(file number, offset)` pair. Files are named `%08x.jdb` and roll over
//! once they would exceed `log_file_max` bytes; a rolled file is never
//! written again.
//!
//! ## Write path
//!
//! [`LogManager::append`] encodes the entry, frames it with an
//! [`EntryHeader`](entry::EntryHeader), copies it into the in-memory log
//! buffer and returns its LSN. The buffer is written to the OS when it fills
//! and on [`LogManager::flush`]; `flush(true)` also fsyncs. Any write
//! failure invalidates the environment, since a partially written buffer
//! cannot be reasoned about.
//!
//! ## Read path
//!
//! [`LogManager::read_entry`] serves entries still in the buffer from
//! memory, entries of the active file through a file handle, and entries of
//! rolled files through a cached memory map. Every read verifies the entry
//! checksum.
//!
//! ## Opening
//!
//! On open the last file is walked entry by entry; the first entry that is
//! short or fails its checksum marks the end of the log and the invalid tail
//! is truncated. This is the normal state after a crash.

#[cfg(test)]
mod tests;

pub(crate) mod entry;
pub(crate) mod files;
pub(crate) mod scanner;
pub(crate) mod throttle;

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::cleaner::{Obsolete, UtilizationTracker};
use crate::encoding::{Decode, Encode, EncodingError, Reader};
use crate::env::Validity;
use entry::{
    ENTRY_HEADER_SIZE, EntryHeader, FileHeaderEntry, LogEntry, LogEntryType, NO_PREV_OFFSET,
};
use files::FileManager;

// ------------------------------------------------------------------------------------------------
// LSN
// ------------------------------------------------------------------------------------------------

/// Log sequence number: the position of an entry in the log.
///
/// The file number occupies the high 32 bits and the byte offset the low 32
/// bits, so the natural `u64` order is the log order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    /// "Not logged" / "not applicable".
    pub const NULL: Lsn = Lsn(u64::MAX);

    /// Builds an LSN from a file number and an offset.
    pub const fn new(file: u32, offset: u32) -> Self {
        Lsn(((file as u64) << 32) | offset as u64)
    }

    /// Rebuilds an LSN from its raw `u64` form.
    pub const fn from_raw(raw: u64) -> Self {
        Lsn(raw)
    }

    /// Raw `u64` form.
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Log file number.
    pub const fn file(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Byte offset within the file.
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    /// True for [`Lsn::NULL`].
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    /// True when `self` is a real LSN later than `other` (or `other` is null).
    pub fn newer_than(self, other: Lsn) -> bool {
        !self.is_null() && (other.is_null() || self > other)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Lsn(NULL)")
        } else {
            write!(f, "Lsn(0x{:x}/0x{:x})", self.file(), self.offset())
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NULL")
        } else {
            write!(f, "0x{:x}/0x{:x}", self.file(), self.offset())
        }
    }
}

impl Encode for Lsn {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)
    }
}

impl Decode for Lsn {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Lsn(reader.read()?))
    }
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Entry payload could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// An entry failed checksum validation or is truncated.
    #[error("checksum failure at {lsn}")]
    Checksum {
        /// Position of the bad entry.
        lsn: Lsn,
    },

    /// The log file does not exist (e.g. deleted by the cleaner).
    #[error("log file 0x{0:x} not found")]
    FileNotFound(u32),

    /// A null LSN was dereferenced.
    #[error("attempt to read the null LSN")]
    NullLsn,

    /// The environment was opened read-only.
    #[error("log is read-only")]
    ReadOnly,

    /// An earlier write failure invalidated the log.
    #[error("log invalidated: {0}")]
    Invalidated(String),

    /// Structural problem with a log file.
    #[error("corrupt log: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Counters kept by the log manager.
#[derive(Debug, Default)]
pub(crate) struct LogStats {
    pub entries_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub buffer_writes: AtomicU64,
    pub fsyncs: AtomicU64,
    pub entry_reads: AtomicU64,
    pub files_created: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// Log manager
// ------------------------------------------------------------------------------------------------

/// Sizing of the log, taken from the environment configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogConfig {
    pub file_max: u32,
    pub buffer_size: usize,
    pub read_only: bool,
}

struct WriteState {
    file_num: u32,
    file: Option<File>,
    /// Bytes of the active file already handed to the OS.
    file_len: u32,
    /// Offset the next entry will get.
    next_offset: u32,
    /// Offset of the last entry in the active file.
    last_entry_offset: u32,
    buffer: Vec<u8>,
}

/// The append-only log of one environment.
pub(crate) struct LogManager {
    files: FileManager,
    config: LogConfig,
    write: Mutex<WriteState>,
    tracker: Arc<UtilizationTracker>,
    validity: Arc<Validity>,
    stats: LogStats,
    /// Bytes cut from the last file at open.
    truncated_tail: u64,
}

impl LogManager {
    /// Opens the log in `dir`, creating file 0 for a fresh environment and
    /// truncating an invalid tail left by a crash.
    pub fn open(
        dir: &Path,
        config: LogConfig,
        tracker: Arc<UtilizationTracker>,
        validity: Arc<Validity>,
    ) -> Result<Self, LogError> {
        let files = FileManager::new(dir);
        let mut nums = files.list_files()?;
        let mut truncated_tail = 0u64;

        let state = loop {
            let Some(&last) = nums.last() else {
                break None;
            };
            let path = files.path_for(last);
            let bytes = fs::read(&path)?;
            match scanner::valid_prefix(&bytes) {
                Some(tail) => {
                    if (tail.end as usize) < bytes.len() {
                        let lost = bytes.len() as u64 - u64::from(tail.end);
                        warn!(
                            file = last,
                            valid = tail.end,
                            lost,
                            "truncating invalid log tail"
                        );
                        truncated_tail = lost;
                        if !config.read_only {
                            OpenOptions::new().write(true).open(&path)?.set_len(u64::from(tail.end))?;
                        }
                    }
                    break Some((last, tail));
                }
                None => {
                    if config.read_only {
                        return Err(LogError::Corrupt(format!(
                            "log file 0x{last:x} has no valid header"
                        )));
                    }
                    warn!(file = last, "removing log file without a valid header");
                    fs::remove_file(&path)?;
                    nums.pop();
                }
            }
        };

        let log = match state {
            Some((num, tail)) => {
                let file = if config.read_only {
                    None
                } else {
                    Some(OpenOptions::new().append(true).open(files.path_for(num))?)
                };
                Self {
                    files,
                    config,
                    write: Mutex::new(WriteState {
                        file_num: num,
                        file,
                        file_len: tail.end,
                        next_offset: tail.end,
                        last_entry_offset: tail.last_entry,
                        buffer: Vec::with_capacity(config.buffer_size),
                    }),
                    tracker,
                    validity,
                    stats: LogStats::default(),
                    truncated_tail,
                }
            }
            None => {
                if config.read_only {
                    return Err(LogError::ReadOnly);
                }
                let log = Self {
                    files,
                    config,
                    write: Mutex::new(WriteState {
                        file_num: 0,
                        file: None,
                        file_len: 0,
                        next_offset: 0,
                        last_entry_offset: NO_PREV_OFFSET,
                        buffer: Vec::with_capacity(config.buffer_size),
                    }),
                    tracker,
                    validity,
                    stats: LogStats::default(),
                    truncated_tail: 0,
                };
                {
                    let mut w = log.write.lock();
                    log.start_file(&mut w, 0, NO_PREV_OFFSET)?;
                }
                log
            }
        };

        info!(dir = %dir.display(), end = %log.end_of_log(), "log opened");
        Ok(log)
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    pub fn stats(&self) -> &LogStats {
        &self.stats
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Bytes dropped from the tail of the last file at open.
    pub fn truncated_tail(&self) -> u64 {
        self.truncated_tail
    }

    /// LSN the next appended entry will get.
    pub fn end_of_log(&self) -> Lsn {
        let w = self.write.lock();
        Lsn::new(w.file_num, w.next_offset)
    }

    /// LSN of the last entry written.
    pub fn last_entry_lsn(&self) -> Lsn {
        let w = self.write.lock();
        Lsn::new(w.file_num, w.last_entry_offset)
    }

    /// Number of the file currently being appended to.
    pub fn current_file(&self) -> u32 {
        self.write.lock().file_num
    }

    /// Total bytes appended since the log was opened.
    pub fn bytes_written(&self) -> u64 {
        self.stats.bytes_written.load(Ordering::Relaxed)
    }

    /// Offset just past the last entry of a file.
    pub fn file_end(&self, num: u32) -> Result<u32, LogError> {
        {
            let w = self.write.lock();
            if num == w.file_num {
                return Ok(w.next_offset);
            }
            if num > w.file_num {
                return Err(LogError::FileNotFound(num));
            }
        }
        Ok(self.files.mapped(num)?.len() as u32)
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Appends an entry and returns its LSN.
    pub fn append(&self, entry: &LogEntry, provisional: bool) -> Result<Lsn, LogError> {
        Ok(self.append_obsoleting(entry, provisional, &[])?.0)
    }

    /// Appends an entry and returns its LSN and total on-disk size.
    pub fn append_sized(&self, entry: &LogEntry, provisional: bool) -> Result<(Lsn, u32), LogError> {
        self.append_obsoleting(entry, provisional, &[])
    }

    /// Appends an entry and counts `obsolete` as superseded by it. Both are
    /// counted under the write lock, so a utilization snapshot sees either
    /// all of it or none of it.
    pub fn append_obsoleting(
        &self,
        entry: &LogEntry,
        provisional: bool,
        obsolete: &[Obsolete],
    ) -> Result<(Lsn, u32), LogError> {
        self.check_writable()?;
        let item = entry.encode_item()?;
        let mut w = self.write.lock();
        self.append_counted(&mut w, entry, provisional, &item, obsolete, false)
    }

    /// Appends an entry that is obsolete from the start, such as a
    /// non-transactional deletion.
    pub fn append_dead(&self, entry: &LogEntry, obsolete: &[Obsolete]) -> Result<(Lsn, u32), LogError> {
        self.check_writable()?;
        let item = entry.encode_item()?;
        let mut w = self.write.lock();
        self.append_counted(&mut w, entry, false, &item, obsolete, true)
    }

    /// Appends an entry built while the write lock is held. `build` sees the
    /// log exactly as it stands before the entry, and `after` runs with the
    /// new LSN before the lock is released.
    pub fn append_built<F, A>(
        &self,
        obsolete: &[Obsolete],
        build: F,
        after: A,
    ) -> Result<(Lsn, u32, LogEntry), LogError>
    where
        F: FnOnce() -> Result<LogEntry, LogError>,
        A: FnOnce(Lsn),
    {
        self.check_writable()?;
        let mut w = self.write.lock();
        let entry = build()?;
        let item = entry.encode_item()?;
        let (lsn, size) = self.append_counted(&mut w, &entry, false, &item, obsolete, false)?;
        after(lsn);
        Ok((lsn, size, entry))
    }

    fn check_writable(&self) -> Result<(), LogError> {
        if self.config.read_only {
            return Err(LogError::ReadOnly);
        }
        if let Some(reason) = self.validity.invalid_reason() {
            return Err(LogError::Invalidated(reason));
        }
        Ok(())
    }

    fn append_counted(
        &self,
        w: &mut WriteState,
        entry: &LogEntry,
        provisional: bool,
        item: &[u8],
        obsolete: &[Obsolete],
        dead: bool,
    ) -> Result<(Lsn, u32), LogError> {
        let entry_type = entry.entry_type();
        let size = (ENTRY_HEADER_SIZE + item.len()) as u32;
        // A file always takes at least one entry after its header.
        let has_entries = w.last_entry_offset != 0;
        if has_entries && u64::from(w.next_offset) + u64::from(size) > u64::from(self.config.file_max) {
            self.roll(w)?;
        }
        let lsn = self.append_locked(w, entry_type, provisional, item)?;
        self.tracker.count_new(lsn, entry_type, size, entry.db_id());
        self.tracker.count_obsolete_all(obsolete);
        if dead {
            self.tracker.count_obsolete(&Obsolete {
                lsn,
                node: entry_type.is_node(),
                size: Some(size),
                db_id: entry.db_id(),
            });
        }
        trace!(%lsn, kind = entry_type.name(), size, provisional, "appended");
        Ok((lsn, size))
    }

    /// Writes the log buffer to the OS, and fsyncs when `sync` is set.
    pub fn flush(&self, sync: bool) -> Result<(), LogError> {
        if self.config.read_only {
            return Ok(());
        }
        let mut w = self.write.lock();
        self.write_buffer(&mut w)?;
        if sync {
            self.sync_file(&mut w)?;
        }
        Ok(())
    }

    /// Ends the active file unless it holds only its header, so every file
    /// before the returned one is complete and fsynced.
    pub fn roll_file(&self) -> Result<u32, LogError> {
        self.check_writable()?;
        let mut w = self.write.lock();
        if w.last_entry_offset != 0 {
            self.roll(&mut w)?;
        }
        Ok(w.file_num)
    }

    fn append_locked(
        &self,
        w: &mut WriteState,
        entry_type: LogEntryType,
        provisional: bool,
        item: &[u8],
    ) -> Result<Lsn, LogError> {
        let prev = if entry_type == LogEntryType::FileHeader {
            NO_PREV_OFFSET
        } else {
            w.last_entry_offset
        };
        let header = EntryHeader::new(entry_type, provisional, prev, item);
        let lsn = Lsn::new(w.file_num, w.next_offset);

        w.buffer.extend_from_slice(&header.to_bytes());
        w.buffer.extend_from_slice(item);
        w.last_entry_offset = w.next_offset;
        w.next_offset += header.entry_size();

        self.stats.entries_written.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(u64::from(header.entry_size()), Ordering::Relaxed);

        if w.buffer.len() >= self.config.buffer_size {
            self.write_buffer(w)?;
        }
        Ok(lsn)
    }

    fn write_buffer(&self, w: &mut WriteState) -> Result<(), LogError> {
        if w.buffer.is_empty() {
            return Ok(());
        }
        let Some(file) = w.file.as_mut() else {
            return Err(LogError::ReadOnly);
        };
        if let Err(e) = file.write_all(&w.buffer) {
            return Err(self.fail_write(e));
        }
        w.file_len += w.buffer.len() as u32;
        w.buffer.clear();
        self.stats.buffer_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync_file(&self, w: &mut WriteState) -> Result<(), LogError> {
        if let Some(file) = w.file.as_mut() {
            if let Err(e) = file.sync_data() {
                return Err(self.fail_write(e));
            }
            self.stats.fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Any failed write, including an interrupted one, leaves the file in an
    /// unknown state.
    fn fail_write(&self, e: io::Error) -> LogError {
        let reason = format!("log write failed: {e}");
        error!(error = %e, "log write failed, invalidating environment");
        self.validity.invalidate(&reason);
        LogError::Io(e)
    }

    /// Closes the active file and starts the next one.
    fn roll(&self, w: &mut WriteState) -> Result<(), LogError> {
        self.write_buffer(w)?;
        self.sync_file(w)?;
        let prev_last = w.last_entry_offset;
        let next = w.file_num + 1;
        self.files.retire_active(w.file_num);
        debug!(from = w.file_num, to = next, "rolling log file");
        self.start_file(w, next, prev_last)
    }

    fn start_file(&self, w: &mut WriteState, num: u32, prev_last: u32) -> Result<(), LogError> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(self.files.path_for(num))
            .map_err(|e| self.fail_write(e))?;
        w.file_num = num;
        w.file = Some(file);
        w.file_len = 0;
        w.next_offset = 0;
        w.last_entry_offset = NO_PREV_OFFSET;

        let header = LogEntry::FileHeader(FileHeaderEntry {
            file_num: num,
            prev_file_last_offset: prev_last,
            created_ms: entry::now_ms(),
        });
        let item = header.encode_item()?;
        let size = (ENTRY_HEADER_SIZE + item.len()) as u32;
        let lsn = self.append_locked(w, LogEntryType::FileHeader, false, &item)?;
        self.write_buffer(w)?;
        self.stats.files_created.fetch_add(1, Ordering::Relaxed);
        self.tracker.count_new(lsn, LogEntryType::FileHeader, size, None);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Reads and decodes the entry at `lsn`.
    pub fn read_entry(&self, lsn: Lsn) -> Result<LogEntry, LogError> {
        let (header, item) = self.read_raw(lsn)?;
        Ok(LogEntry::decode_item(header.entry_type, &item)?)
    }

    /// Reads the header and item bytes of the entry at `lsn`, verifying the
    /// checksum.
    pub fn read_raw(&self, lsn: Lsn) -> Result<(EntryHeader, Vec<u8>), LogError> {
        if lsn.is_null() {
            return Err(LogError::NullLsn);
        }
        self.stats.entry_reads.fetch_add(1, Ordering::Relaxed);

        let w = self.write.lock();
        if lsn.file() == w.file_num {
            if lsn.offset() >= w.next_offset {
                return Err(LogError::Checksum { lsn });
            }
            if lsn.offset() >= w.file_len {
                let start = (lsn.offset() - w.file_len) as usize;
                return parse_entry(&w.buffer[start..], lsn);
            }
            let num = w.file_num;
            drop(w);

            let mut header_bytes = [0u8; ENTRY_HEADER_SIZE];
            self.files
                .read_active(num, lsn.offset(), &mut header_bytes)
                .map_err(|e| eof_as_checksum(e, lsn))?;
            let header = EntryHeader::parse(&header_bytes).ok_or(LogError::Checksum { lsn })?;
            let mut item = vec![0u8; header.item_size as usize];
            self.files
                .read_active(num, lsn.offset() + ENTRY_HEADER_SIZE as u32, &mut item)
                .map_err(|e| eof_as_checksum(e, lsn))?;
            if header.compute_checksum(&item) != header.checksum {
                return Err(LogError::Checksum { lsn });
            }
            return Ok((header, item));
        }
        if lsn.file() > w.file_num {
            return Err(LogError::FileNotFound(lsn.file()));
        }
        drop(w);

        let map = self.files.mapped(lsn.file())?;
        let start = lsn.offset() as usize;
        if start >= map.len() {
            return Err(LogError::Checksum { lsn });
        }
        parse_entry(&map[start..], lsn)
    }

    /// Flushes and fsyncs the log.
    pub fn close(&self) -> Result<(), LogError> {
        self.flush(true)
    }
}

fn eof_as_checksum(e: LogError, lsn: Lsn) -> LogError {
    match e {
        LogError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => LogError::Checksum { lsn },
        other => other,
    }
}

/// Parses and verifies one entry at the start of `bytes`.
fn parse_entry(bytes: &[u8], lsn: Lsn) -> Result<(EntryHeader, Vec<u8>), LogError> {
    let header = EntryHeader::parse(bytes).ok_or(LogError::Checksum { lsn })?;
    let end = ENTRY_HEADER_SIZE + header.item_size as usize;
    if bytes.len() < end {
        return Err(LogError::Checksum { lsn });
    }
    let item = &bytes[ENTRY_HEADER_SIZE..end];
    if header.compute_checksum(item) != header.checksum {
        return Err(LogError::Checksum { lsn });
    }
    Ok((header, item.to_vec()))
}
