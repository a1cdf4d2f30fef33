//! Sequential log scanning, forwards and backwards.

use tracing::trace;

use super::entry::{ENTRY_HEADER_SIZE, EntryHeader, LogEntry, LogEntryType, NO_PREV_OFFSET};
use super::{LogError, LogManager, Lsn};

/// Where the valid part of a log file ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValidTail {
    /// Offset just past the last valid entry.
    pub end: u32,
    /// Offset of the last valid entry.
    pub last_entry: u32,
}

/// Walks the raw bytes of a log file and returns where its valid prefix
/// ends. Returns `None` when not even the file header entry is valid.
pub(crate) fn valid_prefix(bytes: &[u8]) -> Option<ValidTail> {
    let mut offset = 0usize;
    let mut last = None;
    while offset < bytes.len() {
        let Some(header) = EntryHeader::parse(&bytes[offset..]) else {
            break;
        };
        let is_file_header = header.entry_type == LogEntryType::FileHeader;
        if (offset == 0) != is_file_header {
            break;
        }
        let end = offset + header.entry_size() as usize;
        if end > bytes.len() {
            break;
        }
        if header.compute_checksum(&bytes[offset + ENTRY_HEADER_SIZE..end]) != header.checksum {
            break;
        }
        last = Some(offset);
        offset = end;
    }
    last.map(|last_entry| ValidTail {
        end: offset as u32,
        last_entry: last_entry as u32,
    })
}

/// One entry produced by a scanner; decoding is left to the caller.
#[derive(Debug, Clone)]
pub(crate) struct ScannedEntry {
    pub lsn: Lsn,
    pub header: EntryHeader,
    pub item: Vec<u8>,
}

impl ScannedEntry {
    pub fn entry_type(&self) -> LogEntryType {
        self.header.entry_type
    }

    /// Total on-disk size of the entry.
    pub fn size(&self) -> u32 {
        self.header.entry_size()
    }

    pub fn decode(&self) -> Result<LogEntry, LogError> {
        Ok(LogEntry::decode_item(self.header.entry_type, &self.item)?)
    }
}

// ------------------------------------------------------------------------------------------------
// Forward
// ------------------------------------------------------------------------------------------------

/// Reads entries in log order from a start LSN up to an exclusive end.
///
/// Missing files between the start and the end of the log are stepped over,
/// except in single-file mode where a missing file is reported as
/// [`LogError::FileNotFound`].
pub(crate) struct ForwardScanner<'a> {
    log: &'a LogManager,
    pos: Lsn,
    end: Lsn,
    single_file: Option<u32>,
    done: bool,
}

impl<'a> ForwardScanner<'a> {
    /// Scans from `start` to `end` (exclusive); a null `end` means the end
    /// of the log as it is when each entry is read.
    pub fn new(log: &'a LogManager, start: Lsn, end: Lsn) -> Self {
        Self {
            log,
            pos: start,
            end,
            single_file: None,
            done: false,
        }
    }

    /// Scans every entry of one file.
    pub fn over_file(log: &'a LogManager, file: u32) -> Self {
        Self {
            log,
            pos: Lsn::new(file, 0),
            end: Lsn::NULL,
            single_file: Some(file),
            done: false,
        }
    }

    fn next_file_after(&self, file: u32) -> Option<u32> {
        let current = self.log.current_file();
        (file + 1..=current).find(|&n| n == current || self.log.files().exists(n))
    }
}

impl Iterator for ForwardScanner<'_> {
    type Item = Result<ScannedEntry, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if !self.end.is_null() && self.pos >= self.end {
                return None;
            }
            let file = self.pos.file();
            let file_end = match self.log.file_end(file) {
                Ok(end) => Some(end),
                Err(LogError::FileNotFound(num)) => {
                    if self.single_file.is_some() {
                        self.done = true;
                        return Some(Err(LogError::FileNotFound(num)));
                    }
                    None
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let exhausted = file_end.is_none_or(|end| self.pos.offset() >= end);
            if exhausted {
                if self.single_file.is_some() {
                    return None;
                }
                match self.next_file_after(file) {
                    Some(next) => {
                        trace!(from = file, to = next, "forward scan crossing files");
                        self.pos = Lsn::new(next, 0);
                        continue;
                    }
                    None => return None,
                }
            }
            return match self.log.read_raw(self.pos) {
                Ok((header, item)) => {
                    let lsn = self.pos;
                    self.pos = Lsn::new(file, lsn.offset() + header.entry_size());
                    Some(Ok(ScannedEntry { lsn, header, item }))
                }
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            };
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Backward
// ------------------------------------------------------------------------------------------------

/// Reads entries in reverse log order, following the previous-offset chain
/// and the file header back-links.
pub(crate) struct BackwardScanner<'a> {
    log: &'a LogManager,
    next: Option<Lsn>,
    stop: Lsn,
}

impl<'a> BackwardScanner<'a> {
    /// Scans from `start` (inclusive) down to `stop` (inclusive); a null
    /// `stop` scans to the beginning of the log.
    pub fn new(log: &'a LogManager, start: Lsn, stop: Lsn) -> Self {
        Self {
            log,
            next: (!start.is_null()).then_some(start),
            stop,
        }
    }

    /// Scans backwards from the last entry in the log.
    pub fn from_end(log: &'a LogManager) -> Self {
        Self::new(log, log.last_entry_lsn(), Lsn::NULL)
    }

    fn predecessor(&self, lsn: Lsn, header: &EntryHeader, item: &[u8]) -> Result<Option<Lsn>, LogError> {
        if header.entry_type != LogEntryType::FileHeader {
            if header.prev_offset == NO_PREV_OFFSET {
                return Ok(None);
            }
            return Ok(Some(Lsn::new(lsn.file(), header.prev_offset)));
        }
        let Some(prev_file) = lsn.file().checked_sub(1) else {
            return Ok(None);
        };
        let LogEntry::FileHeader(file_header) = LogEntry::decode_item(header.entry_type, item)? else {
            return Err(LogError::Corrupt(format!("bad file header at {lsn}")));
        };
        if file_header.prev_file_last_offset != NO_PREV_OFFSET && self.log.files().exists(prev_file) {
            return Ok(Some(Lsn::new(prev_file, file_header.prev_file_last_offset)));
        }
        // The previous file was cleaned away; find the newest older file.
        for num in (0..prev_file).rev() {
            if self.log.files().exists(num) {
                let mut last = None;
                for entry in ForwardScanner::over_file(self.log, num) {
                    last = Some(entry?.lsn);
                }
                return Ok(last);
            }
        }
        Ok(None)
    }
}

impl Iterator for BackwardScanner<'_> {
    type Item = Result<ScannedEntry, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        let lsn = self.next.take()?;
        if !self.stop.is_null() && lsn < self.stop {
            return None;
        }
        let (header, item) = match self.log.read_raw(lsn) {
            Ok(raw) => raw,
            Err(e) => return Some(Err(e)),
        };
        match self.predecessor(lsn, &header, &item) {
            Ok(prev) => self.next = prev,
            Err(e) => return Some(Err(e)),
        }
        Some(Ok(ScannedEntry { lsn, header, item }))
    }
}
