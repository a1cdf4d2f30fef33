//! Per-file utilization accounting.
//!
//! Every appended entry is counted as new in its file's [`FileSummary`],
//! and every entry that is superseded or deleted is counted obsolete. The
//! cleaner ranks files by the live fraction these counts imply. Counts are
//! exact; obsolete sizes are exact where the caller knows the size and
//! otherwise estimated from the file's average record size.
//!
//! Summaries are persisted as FileSummaryLN records in the utilization
//! database at every checkpoint. A persisted summary describes its file up
//! to the LSN of the record holding it, which recovery uses to avoid
//! counting an entry twice.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::DatabaseId;
use crate::encoding::{self, Decode, Encode, EncodingError, Reader};
use crate::log::Lsn;
use crate::log::entry::LogEntryType;

// ------------------------------------------------------------------------------------------------
// Summaries
// ------------------------------------------------------------------------------------------------

/// Utilization counters of one log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSummary {
    /// Entries of any kind.
    pub total_count: u32,
    /// Bytes of entries of any kind, headers included.
    pub total_size: u64,
    pub total_in_count: u32,
    pub total_in_size: u64,
    pub total_ln_count: u32,
    pub total_ln_size: u64,
    pub obsolete_in_count: u32,
    pub obsolete_ln_count: u32,
    /// Sum of the obsolete LN sizes that were known when counted.
    pub obsolete_ln_size: u64,
    /// Number of obsolete LNs whose size is included in `obsolete_ln_size`.
    pub obsolete_ln_size_counted: u32,
}

impl FileSummary {
    /// Estimated obsolete bytes. Entries that are neither nodes nor records
    /// (file headers, transaction and checkpoint markers) are never needed
    /// by the cleaner and count as obsolete.
    pub fn obsolete_size(&self) -> u64 {
        if self.total_size == 0 {
            return 0;
        }
        let leftover = self
            .total_size
            .saturating_sub(self.total_in_size + self.total_ln_size);
        let mut obsolete = self.obsolete_ln_size + leftover;
        let uncounted = self
            .obsolete_ln_count
            .saturating_sub(self.obsolete_ln_size_counted);
        if uncounted > 0 && self.total_ln_count > 0 {
            let avg_ln = self.total_ln_size / u64::from(self.total_ln_count);
            obsolete += avg_ln * u64::from(uncounted);
        }
        if self.obsolete_in_count > 0 && self.total_in_count > 0 {
            let avg_in = self.total_in_size / u64::from(self.total_in_count);
            obsolete += avg_in * u64::from(self.obsolete_in_count);
        }
        obsolete.min(self.total_size)
    }

    /// Estimated live bytes.
    pub fn live_size(&self) -> u64 {
        self.total_size - self.obsolete_size()
    }

    /// Live bytes as a percentage of total bytes.
    pub fn utilization(&self) -> u32 {
        utilization(self.live_size(), self.total_size)
    }

    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }

    /// Adds the counters of `other`.
    pub fn add(&mut self, other: &FileSummary) {
        self.total_count += other.total_count;
        self.total_size += other.total_size;
        self.total_in_count += other.total_in_count;
        self.total_in_size += other.total_in_size;
        self.total_ln_count += other.total_ln_count;
        self.total_ln_size += other.total_ln_size;
        self.obsolete_in_count += other.obsolete_in_count;
        self.obsolete_ln_count += other.obsolete_ln_count;
        self.obsolete_ln_size += other.obsolete_ln_size;
        self.obsolete_ln_size_counted += other.obsolete_ln_size_counted;
    }
}

/// Percentage of `live` in `total`; an empty file is fully utilized.
pub(crate) fn utilization(live: u64, total: u64) -> u32 {
    if total == 0 {
        return 100;
    }
    ((live * 100) / total) as u32
}

impl Encode for FileSummary {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.total_count.encode_to(buf)?;
        self.total_size.encode_to(buf)?;
        self.total_in_count.encode_to(buf)?;
        self.total_in_size.encode_to(buf)?;
        self.total_ln_count.encode_to(buf)?;
        self.total_ln_size.encode_to(buf)?;
        self.obsolete_in_count.encode_to(buf)?;
        self.obsolete_ln_count.encode_to(buf)?;
        self.obsolete_ln_size.encode_to(buf)?;
        self.obsolete_ln_size_counted.encode_to(buf)
    }
}

impl Decode for FileSummary {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            total_count: reader.read()?,
            total_size: reader.read()?,
            total_in_count: reader.read()?,
            total_in_size: reader.read()?,
            total_ln_count: reader.read()?,
            total_ln_size: reader.read()?,
            obsolete_in_count: reader.read()?,
            obsolete_ln_count: reader.read()?,
            obsolete_ln_size: reader.read()?,
            obsolete_ln_size_counted: reader.read()?,
        })
    }
}

/// Counters of one database within one log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbFileSummary {
    pub in_count: u32,
    pub in_size: u64,
    pub ln_count: u32,
    pub ln_size: u64,
    pub obsolete_in_count: u32,
    pub obsolete_ln_count: u32,
}

impl Encode for DbFileSummary {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.in_count.encode_to(buf)?;
        self.in_size.encode_to(buf)?;
        self.ln_count.encode_to(buf)?;
        self.ln_size.encode_to(buf)?;
        self.obsolete_in_count.encode_to(buf)?;
        self.obsolete_ln_count.encode_to(buf)
    }
}

impl Decode for DbFileSummary {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            in_count: reader.read()?,
            in_size: reader.read()?,
            ln_count: reader.read()?,
            ln_size: reader.read()?,
            obsolete_in_count: reader.read()?,
            obsolete_ln_count: reader.read()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DbEntry {
    db_id: DatabaseId,
    summary: DbFileSummary,
}

impl Encode for DbEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.db_id.encode_to(buf)?;
        self.summary.encode_to(buf)
    }
}

impl Decode for DbEntry {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            db_id: reader.read()?,
            summary: reader.read()?,
        })
    }
}

/// Payload of a FileSummaryLN: the file summary and its per-database
/// breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SummaryRecord {
    pub summary: FileSummary,
    pub dbs: BTreeMap<DatabaseId, DbFileSummary>,
}

impl SummaryRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::new();
        self.summary.encode_to(&mut buf)?;
        let dbs: Vec<DbEntry> = self
            .dbs
            .iter()
            .map(|(&db_id, &summary)| DbEntry { db_id, summary })
            .collect();
        encoding::encode_vec(&dbs, &mut buf)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        let mut reader = Reader::new(bytes);
        let summary = reader.read()?;
        let dbs: Vec<DbEntry> = encoding::decode_vec(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(EncodingError::TrailingBytes(reader.remaining()));
        }
        Ok(Self {
            summary,
            dbs: dbs.into_iter().map(|e| (e.db_id, e.summary)).collect(),
        })
    }
}

/// Key of a file's record in the utilization database.
pub(crate) fn summary_key(file: u32) -> Vec<u8> {
    file.to_be_bytes().to_vec()
}

pub(crate) fn file_from_summary_key(key: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(key.try_into().ok()?))
}

// ------------------------------------------------------------------------------------------------
// Tracker
// ------------------------------------------------------------------------------------------------

/// An entry that became obsolete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Obsolete {
    pub lsn: Lsn,
    pub node: bool,
    /// Total entry size, when known.
    pub size: Option<u32>,
    pub db_id: Option<DatabaseId>,
}

impl Obsolete {
    pub fn ln(lsn: Lsn, size: Option<u32>, db_id: DatabaseId) -> Self {
        Self {
            lsn,
            node: false,
            size,
            db_id: Some(db_id),
        }
    }

    pub fn node(lsn: Lsn, db_id: DatabaseId) -> Self {
        Self {
            lsn,
            node: true,
            size: None,
            db_id: Some(db_id),
        }
    }
}

#[derive(Debug)]
struct TrackedFile {
    record: SummaryRecord,
    /// LSN of the FileSummaryLN that last persisted this file, or null.
    persisted_at: Lsn,
    /// Changed since last persisted.
    dirty: bool,
}

impl TrackedFile {
    fn new() -> Self {
        Self {
            record: SummaryRecord::default(),
            persisted_at: Lsn::NULL,
            dirty: true,
        }
    }

    /// Whether the persisted summary already reflects an event logged at
    /// `lsn`.
    fn covers(&self, lsn: Lsn) -> bool {
        !self.persisted_at.is_null() && self.persisted_at > lsn
    }
}

/// Live utilization counters of every log file.
///
/// Each file has its own lock; the map is write-locked only to add or
/// forget a file, so appends to the current file never wait on a count
/// against an older one.
#[derive(Debug, Default)]
pub(crate) struct UtilizationTracker {
    files: RwLock<BTreeMap<u32, Arc<Mutex<TrackedFile>>>>,
}

impl UtilizationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The counters of `num`, created on first use.
    fn file(&self, num: u32) -> Arc<Mutex<TrackedFile>> {
        if let Some(file) = self.files.read().get(&num) {
            return Arc::clone(file);
        }
        let mut files = self.files.write();
        Arc::clone(
            files
                .entry(num)
                .or_insert_with(|| Arc::new(Mutex::new(TrackedFile::new()))),
        )
    }

    fn existing(&self, num: u32) -> Option<Arc<Mutex<TrackedFile>>> {
        self.files.read().get(&num).cloned()
    }

    /// Counts a newly appended entry.
    pub fn count_new(&self, lsn: Lsn, ty: LogEntryType, size: u32, db_id: Option<DatabaseId>) {
        let file = self.file(lsn.file());
        let mut file = file.lock();
        apply_new(&mut file.record, ty, size, db_id);
        file.dirty = true;
    }

    /// Counts a superseded or deleted entry.
    pub fn count_obsolete(&self, obsolete: &Obsolete) {
        if obsolete.lsn.is_null() {
            return;
        }
        let file = self.file(obsolete.lsn.file());
        let mut file = file.lock();
        apply_obsolete(&mut file.record, obsolete);
        file.dirty = true;
        trace!(lsn = %obsolete.lsn, node = obsolete.node, "counted obsolete");
    }

    pub fn count_obsolete_all(&self, obsolete: &[Obsolete]) {
        for o in obsolete {
            self.count_obsolete(o);
        }
    }

    /// Recovery variant of [`count_new`](Self::count_new): skipped when the
    /// file's persisted summary already includes the entry.
    pub fn count_new_if_uncounted(
        &self,
        lsn: Lsn,
        ty: LogEntryType,
        size: u32,
        db_id: Option<DatabaseId>,
    ) {
        let file = self.file(lsn.file());
        let mut file = file.lock();
        if file.covers(lsn) {
            return;
        }
        apply_new(&mut file.record, ty, size, db_id);
        file.dirty = true;
    }

    /// Recovery variant of [`count_obsolete`](Self::count_obsolete): the
    /// entry became obsolete when the entry at `cause` was logged, and is
    /// skipped when the persisted summary of its file postdates `cause`.
    pub fn count_obsolete_if_uncounted(&self, obsolete: &Obsolete, cause: Lsn) {
        if obsolete.lsn.is_null() {
            return;
        }
        let file = self.file(obsolete.lsn.file());
        let mut file = file.lock();
        if file.covers(cause) {
            return;
        }
        apply_obsolete(&mut file.record, obsolete);
        file.dirty = true;
    }

    /// Installs a persisted summary read from the utilization database.
    pub fn load(&self, num: u32, record: SummaryRecord, persisted_at: Lsn) {
        let file = self.file(num);
        let mut tracked = file.lock();
        if tracked.covers(persisted_at) {
            return;
        }
        tracked.record = record;
        tracked.persisted_at = persisted_at;
        tracked.dirty = false;
    }

    /// Snapshot of a file's record for persisting. Must be called while the
    /// log write lock is held, so that the snapshot describes the log exactly
    /// up to the record that will hold it.
    pub fn snapshot_for_persist(&self, num: u32) -> Option<SummaryRecord> {
        let file = self.existing(num)?;
        let record = file.lock().record.clone();
        Some(record)
    }

    /// Records that a snapshot taken for `num` was logged at `lsn`.
    pub fn persisted(&self, num: u32, lsn: Lsn) {
        if let Some(file) = self.existing(num) {
            let mut file = file.lock();
            file.persisted_at = lsn;
            file.dirty = false;
        }
    }

    /// Forces the next checkpoint to persist a file's summary again, so its
    /// FileSummaryLN moves to a newer file.
    pub fn mark_dirty(&self, num: u32) {
        if let Some(file) = self.existing(num) {
            file.lock().dirty = true;
        }
    }

    /// Files whose summary changed since last persisted.
    pub fn dirty_files(&self) -> Vec<u32> {
        self.files
            .read()
            .iter()
            .filter(|(_, f)| f.lock().dirty)
            .map(|(&n, _)| n)
            .collect()
    }

    pub fn summary(&self, num: u32) -> Option<FileSummary> {
        let file = self.existing(num)?;
        let summary = file.lock().record.summary;
        Some(summary)
    }

    pub fn db_summary(&self, num: u32, db_id: DatabaseId) -> Option<DbFileSummary> {
        let file = self.existing(num)?;
        let summary = file.lock().record.dbs.get(&db_id).copied();
        summary
    }

    /// Summaries of every tracked file.
    pub fn summaries(&self) -> BTreeMap<u32, FileSummary> {
        self.files
            .read()
            .iter()
            .map(|(&n, f)| (n, f.lock().record.summary))
            .collect()
    }

    /// Forgets a deleted file.
    pub fn remove_file(&self, num: u32) {
        self.files.write().remove(&num);
    }
}

fn apply_new(record: &mut SummaryRecord, ty: LogEntryType, size: u32, db_id: Option<DatabaseId>) {
    let s = &mut record.summary;
    s.total_count += 1;
    s.total_size += u64::from(size);
    if ty.is_node() {
        s.total_in_count += 1;
        s.total_in_size += u64::from(size);
    } else if ty.is_ln() {
        s.total_ln_count += 1;
        s.total_ln_size += u64::from(size);
    }
    if let Some(db_id) = db_id {
        let db = record.dbs.entry(db_id).or_default();
        if ty.is_node() {
            db.in_count += 1;
            db.in_size += u64::from(size);
        } else if ty.is_ln() {
            db.ln_count += 1;
            db.ln_size += u64::from(size);
        }
    }
}

fn apply_obsolete(record: &mut SummaryRecord, obsolete: &Obsolete) {
    let s = &mut record.summary;
    if obsolete.node {
        s.obsolete_in_count += 1;
    } else {
        s.obsolete_ln_count += 1;
        if let Some(size) = obsolete.size {
            s.obsolete_ln_size += u64::from(size);
            s.obsolete_ln_size_counted += 1;
        }
    }
    if let Some(db_id) = obsolete.db_id {
        let db = record.dbs.entry(db_id).or_default();
        if obsolete.node {
            db.obsolete_in_count += 1;
        } else {
            db.obsolete_ln_count += 1;
        }
    }
}
