//! Log entry types, the fixed entry header, and entry payloads.
//!
//! # On-disk layout of one entry
//!
//! ```text
//! [CHECKSUM u32][TYPE u8][FLAGS u8][PREV_OFFSET u32][ITEM_SIZE u32][ITEM_BYTES]
//! ```
//!
//! - **CHECKSUM**: CRC32 over every byte after the checksum field
//!   (the rest of the header plus the item).
//! - **FLAGS**: low 7 bits hold the log version, the high bit marks a
//!   provisional node entry.
//! - **PREV_OFFSET**: offset of the previous entry in the same file, which
//!   lets scanners walk a file backwards.
//! - **ITEM_BYTES**: the payload, written through [`crate::encoding`].

use crc32fast::Hasher as Crc32;

use crate::encoding::{self, Decode, Encode, EncodingError, Reader};
use crate::log::Lsn;
use crate::{DatabaseId, NodeId, TxnId};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Size of the fixed entry header in bytes.
pub(crate) const ENTRY_HEADER_SIZE: usize = 14;

/// Current log format version.
pub(crate) const LOG_VERSION: u8 = 1;

/// Marks "no previous entry" in a header or file header.
pub(crate) const NO_PREV_OFFSET: u32 = u32::MAX;

const PROVISIONAL_BIT: u8 = 0x80;
const VERSION_MASK: u8 = 0x7F;

// ------------------------------------------------------------------------------------------------
// Entry type
// ------------------------------------------------------------------------------------------------

/// Kind of a log entry, stored in the entry header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogEntryType {
    /// First entry of every log file.
    FileHeader = 1,
    /// Upper internal node of a main tree.
    In = 2,
    /// Bottom internal node of a main tree.
    Bin = 3,
    /// Upper internal node of a duplicate subtree.
    Din = 4,
    /// Bottom internal node of a duplicate subtree.
    Dbin = 5,
    /// Application record or deletion marker.
    Ln = 6,
    /// Live record count of a duplicate subtree.
    DupCountLn = 7,
    /// Database metadata record in the mapping tree.
    MapLn = 8,
    /// Name to database id record in the naming tree.
    NameLn = 9,
    /// Per-file utilization counters.
    FileSummaryLn = 10,
    /// Transaction commit record.
    TxnCommit = 11,
    /// Transaction abort record.
    TxnAbort = 12,
    /// Checkpoint start marker.
    CkptStart = 13,
    /// Checkpoint end marker.
    CkptEnd = 14,
}

impl LogEntryType {
    /// Parses a header type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::FileHeader,
            2 => Self::In,
            3 => Self::Bin,
            4 => Self::Din,
            5 => Self::Dbin,
            6 => Self::Ln,
            7 => Self::DupCountLn,
            8 => Self::MapLn,
            9 => Self::NameLn,
            10 => Self::FileSummaryLn,
            11 => Self::TxnCommit,
            12 => Self::TxnAbort,
            13 => Self::CkptStart,
            14 => Self::CkptEnd,
            _ => return None,
        })
    }

    /// True for IN, BIN, DIN and DBIN entries.
    pub fn is_node(self) -> bool {
        matches!(self, Self::In | Self::Bin | Self::Din | Self::Dbin)
    }

    /// True for every leaf-record entry kind.
    pub fn is_ln(self) -> bool {
        matches!(
            self,
            Self::Ln | Self::DupCountLn | Self::MapLn | Self::NameLn | Self::FileSummaryLn
        )
    }

    /// Short display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::FileHeader => "FileHeader",
            Self::In => "IN",
            Self::Bin => "BIN",
            Self::Din => "DIN",
            Self::Dbin => "DBIN",
            Self::Ln => "LN",
            Self::DupCountLn => "DupCountLN",
            Self::MapLn => "MapLN",
            Self::NameLn => "NameLN",
            Self::FileSummaryLn => "FileSummaryLN",
            Self::TxnCommit => "TxnCommit",
            Self::TxnAbort => "TxnAbort",
            Self::CkptStart => "CkptStart",
            Self::CkptEnd => "CkptEnd",
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Entry header
// ------------------------------------------------------------------------------------------------

/// Fixed-size header preceding every entry item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryHeader {
    pub checksum: u32,
    pub entry_type: LogEntryType,
    pub version: u8,
    pub provisional: bool,
    pub prev_offset: u32,
    pub item_size: u32,
}

impl EntryHeader {
    /// Builds a header for `item` and computes its checksum.
    pub fn new(entry_type: LogEntryType, provisional: bool, prev_offset: u32, item: &[u8]) -> Self {
        let mut header = Self {
            checksum: 0,
            entry_type,
            version: LOG_VERSION,
            provisional,
            prev_offset,
            item_size: item.len() as u32,
        };
        header.checksum = header.compute_checksum(item);
        header
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut out = [0u8; ENTRY_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        out[4] = self.entry_type as u8;
        out[5] = (self.version & VERSION_MASK) | if self.provisional { PROVISIONAL_BIT } else { 0 };
        out[6..10].copy_from_slice(&self.prev_offset.to_le_bytes());
        out[10..14].copy_from_slice(&self.item_size.to_le_bytes());
        out
    }

    /// Parses a header. Returns `None` when the bytes cannot be a header
    /// (short buffer or unknown type), which callers treat as corruption.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ENTRY_HEADER_SIZE {
            return None;
        }
        let mut reader = Reader::new(&bytes[..ENTRY_HEADER_SIZE]);
        let checksum = reader.read::<u32>().ok()?;
        let entry_type = LogEntryType::from_u8(reader.read::<u8>().ok()?)?;
        let flags = reader.read::<u8>().ok()?;
        let prev_offset = reader.read::<u32>().ok()?;
        let item_size = reader.read::<u32>().ok()?;
        Some(Self {
            checksum,
            entry_type,
            version: flags & VERSION_MASK,
            provisional: flags & PROVISIONAL_BIT != 0,
            prev_offset,
            item_size,
        })
    }

    /// CRC32 over the header bytes after the checksum field, then the item.
    pub fn compute_checksum(&self, item: &[u8]) -> u32 {
        let bytes = self.to_bytes();
        let mut hasher = Crc32::new();
        hasher.update(&bytes[4..]);
        hasher.update(item);
        hasher.finalize()
    }

    /// Total on-disk size of the entry.
    pub fn entry_size(&self) -> u32 {
        ENTRY_HEADER_SIZE as u32 + self.item_size
    }
}

// ------------------------------------------------------------------------------------------------
// Payloads
// ------------------------------------------------------------------------------------------------

/// First entry of each log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileHeaderEntry {
    pub file_num: u32,
    /// Offset of the last entry in the previous file, or [`NO_PREV_OFFSET`].
    pub prev_file_last_offset: u32,
    pub created_ms: u64,
}

/// Which tree a leaf record belongs to, and how it is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum LnKind {
    Data,
    DupCount,
    Map,
    Name,
    FileSummary,
}

impl LnKind {
    pub fn entry_type(self) -> LogEntryType {
        match self {
            Self::Data => LogEntryType::Ln,
            Self::DupCount => LogEntryType::DupCountLn,
            Self::Map => LogEntryType::MapLn,
            Self::Name => LogEntryType::NameLn,
            Self::FileSummary => LogEntryType::FileSummaryLn,
        }
    }

    fn from_entry_type(ty: LogEntryType) -> Option<Self> {
        Some(match ty {
            LogEntryType::Ln => Self::Data,
            LogEntryType::DupCountLn => Self::DupCount,
            LogEntryType::MapLn => Self::Map,
            LogEntryType::NameLn => Self::Name,
            LogEntryType::FileSummaryLn => Self::FileSummary,
            _ => return None,
        })
    }
}

/// Transactional part of an LN entry; enough to undo the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TxnInfo {
    pub txn_id: TxnId,
    /// Previous entry logged by the same transaction.
    pub prev_lsn: Lsn,
    /// LSN the slot pointed to before this write.
    pub abort_lsn: Lsn,
    /// Whether the slot was deleted before this write.
    pub abort_deleted: bool,
    /// Slot key bytes before this write, when the write replaced them.
    pub abort_key: Option<Vec<u8>>,
}

/// A leaf record.
///
/// For records of a duplicates database `key` is the main key and `data`
/// the duplicate value; a deletion keeps `data` so the duplicate can be
/// located during redo. DupCountLN entries carry the count in `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LnEntry {
    pub kind: LnKind,
    pub db_id: DatabaseId,
    pub ln_id: u64,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub deleted: bool,
    pub txn: Option<TxnInfo>,
}

/// Logged image of a tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeImage {
    pub node_id: NodeId,
    pub db_id: DatabaseId,
    pub level: u16,
    /// Root of a main tree or of a duplicate subtree.
    pub root: bool,
    /// Main key owning the duplicate subtree, for DIN/DBIN nodes.
    pub dup_key: Option<Vec<u8>>,
    /// Key the parent uses to reach this node.
    pub id_key: Vec<u8>,
    /// LSN of the version this image supersedes.
    pub prev_logged: Lsn,
    pub slots: Vec<SlotImage>,
}

impl NodeImage {
    pub fn entry_type(&self) -> LogEntryType {
        match (self.level <= 1, self.dup_key.is_some()) {
            (true, false) => LogEntryType::Bin,
            (true, true) => LogEntryType::Dbin,
            (false, false) => LogEntryType::In,
            (false, true) => LogEntryType::Din,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlotImage {
    pub key: Vec<u8>,
    pub lsn: Lsn,
    pub target: TargetImage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TargetImage {
    Child,
    Record {
        ln_id: u64,
        deleted: bool,
    },
    DupTree {
        count_ln_id: u64,
        count_lsn: Lsn,
        count: u64,
    },
}

/// Commit or abort record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TxnEndEntry {
    pub txn_id: TxnId,
    pub last_lsn: Lsn,
    pub time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CkptStartEntry {
    pub id: u64,
    pub invoker: String,
    pub time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CkptEndEntry {
    pub id: u64,
    pub ckpt_start: Lsn,
    /// Earliest LSN of any transaction active when the checkpoint started.
    pub first_active: Lsn,
    /// Root of the mapping tree as of this checkpoint.
    pub mapping_root: Lsn,
    pub last_node_id: NodeId,
    pub last_db_id: DatabaseId,
    pub last_txn_id: TxnId,
    pub time_ms: u64,
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogEntry {
    FileHeader(FileHeaderEntry),
    Node(NodeImage),
    Ln(LnEntry),
    Commit(TxnEndEntry),
    Abort(TxnEndEntry),
    CkptStart(CkptStartEntry),
    CkptEnd(CkptEndEntry),
}

impl LogEntry {
    pub fn entry_type(&self) -> LogEntryType {
        match self {
            Self::FileHeader(_) => LogEntryType::FileHeader,
            Self::Node(image) => image.entry_type(),
            Self::Ln(ln) => ln.kind.entry_type(),
            Self::Commit(_) => LogEntryType::TxnCommit,
            Self::Abort(_) => LogEntryType::TxnAbort,
            Self::CkptStart(_) => LogEntryType::CkptStart,
            Self::CkptEnd(_) => LogEntryType::CkptEnd,
        }
    }

    /// Database the entry belongs to, for per-database utilization.
    pub fn db_id(&self) -> Option<DatabaseId> {
        match self {
            Self::Node(image) => Some(image.db_id),
            Self::Ln(ln) => Some(ln.db_id),
            _ => None,
        }
    }

    /// Encodes the item bytes (everything after the header).
    pub fn encode_item(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::new();
        match self {
            Self::FileHeader(e) => e.encode_to(&mut buf)?,
            Self::Node(e) => e.encode_to(&mut buf)?,
            Self::Ln(e) => e.encode_to(&mut buf)?,
            Self::Commit(e) | Self::Abort(e) => e.encode_to(&mut buf)?,
            Self::CkptStart(e) => e.encode_to(&mut buf)?,
            Self::CkptEnd(e) => e.encode_to(&mut buf)?,
        }
        Ok(buf)
    }

    /// Decodes item bytes of the given type.
    pub fn decode_item(ty: LogEntryType, item: &[u8]) -> Result<Self, EncodingError> {
        if let Some(kind) = LnKind::from_entry_type(ty) {
            let mut ln: LnEntry = encoding::decode_exact(item)?;
            ln.kind = kind;
            return Ok(Self::Ln(ln));
        }
        Ok(match ty {
            LogEntryType::FileHeader => Self::FileHeader(encoding::decode_exact(item)?),
            LogEntryType::In | LogEntryType::Bin | LogEntryType::Din | LogEntryType::Dbin => {
                Self::Node(encoding::decode_exact(item)?)
            }
            LogEntryType::TxnCommit => Self::Commit(encoding::decode_exact(item)?),
            LogEntryType::TxnAbort => Self::Abort(encoding::decode_exact(item)?),
            LogEntryType::CkptStart => Self::CkptStart(encoding::decode_exact(item)?),
            LogEntryType::CkptEnd => Self::CkptEnd(encoding::decode_exact(item)?),
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(other as u8),
                    type_name: "LogEntry",
                });
            }
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Encoding
// ------------------------------------------------------------------------------------------------

impl Encode for FileHeaderEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.file_num.encode_to(buf)?;
        self.prev_file_last_offset.encode_to(buf)?;
        self.created_ms.encode_to(buf)
    }
}

impl Decode for FileHeaderEntry {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            file_num: reader.read()?,
            prev_file_last_offset: reader.read()?,
            created_ms: reader.read()?,
        })
    }
}

impl Encode for TxnInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.txn_id.encode_to(buf)?;
        self.prev_lsn.encode_to(buf)?;
        self.abort_lsn.encode_to(buf)?;
        self.abort_deleted.encode_to(buf)?;
        self.abort_key.encode_to(buf)
    }
}

impl Decode for TxnInfo {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            txn_id: reader.read()?,
            prev_lsn: reader.read()?,
            abort_lsn: reader.read()?,
            abort_deleted: reader.read()?,
            abort_key: reader.read()?,
        })
    }
}

// The LN kind lives in the header type byte, not in the item.
impl Encode for LnEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.db_id.encode_to(buf)?;
        self.ln_id.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.data.encode_to(buf)?;
        self.deleted.encode_to(buf)?;
        self.txn.encode_to(buf)
    }
}

impl Decode for LnEntry {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            kind: LnKind::Data,
            db_id: reader.read()?,
            ln_id: reader.read()?,
            key: reader.read()?,
            data: reader.read()?,
            deleted: reader.read()?,
            txn: reader.read()?,
        })
    }
}

impl Encode for TargetImage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Self::Child => 0u8.encode_to(buf),
            Self::Record { ln_id, deleted } => {
                1u8.encode_to(buf)?;
                ln_id.encode_to(buf)?;
                deleted.encode_to(buf)
            }
            Self::DupTree {
                count_ln_id,
                count_lsn,
                count,
            } => {
                2u8.encode_to(buf)?;
                count_ln_id.encode_to(buf)?;
                count_lsn.encode_to(buf)?;
                count.encode_to(buf)
            }
        }
    }
}

impl Decode for TargetImage {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        match reader.read::<u8>()? {
            0 => Ok(Self::Child),
            1 => Ok(Self::Record {
                ln_id: reader.read()?,
                deleted: reader.read()?,
            }),
            2 => Ok(Self::DupTree {
                count_ln_id: reader.read()?,
                count_lsn: reader.read()?,
                count: reader.read()?,
            }),
            tag => Err(EncodingError::InvalidTag {
                tag: u32::from(tag),
                type_name: "TargetImage",
            }),
        }
    }
}

impl Encode for SlotImage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.lsn.encode_to(buf)?;
        self.target.encode_to(buf)
    }
}

impl Decode for SlotImage {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            key: reader.read()?,
            lsn: reader.read()?,
            target: reader.read()?,
        })
    }
}

impl Encode for NodeImage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.node_id.encode_to(buf)?;
        self.db_id.encode_to(buf)?;
        self.level.encode_to(buf)?;
        self.root.encode_to(buf)?;
        self.dup_key.encode_to(buf)?;
        self.id_key.encode_to(buf)?;
        self.prev_logged.encode_to(buf)?;
        encoding::encode_vec(&self.slots, buf)
    }
}

impl Decode for NodeImage {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            node_id: reader.read()?,
            db_id: reader.read()?,
            level: reader.read()?,
            root: reader.read()?,
            dup_key: reader.read()?,
            id_key: reader.read()?,
            prev_logged: reader.read()?,
            slots: encoding::decode_vec(reader)?,
        })
    }
}

impl Encode for TxnEndEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.txn_id.encode_to(buf)?;
        self.last_lsn.encode_to(buf)?;
        self.time_ms.encode_to(buf)
    }
}

impl Decode for TxnEndEntry {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            txn_id: reader.read()?,
            last_lsn: reader.read()?,
            time_ms: reader.read()?,
        })
    }
}

impl Encode for CkptStartEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.invoker.encode_to(buf)?;
        self.time_ms.encode_to(buf)
    }
}

impl Decode for CkptStartEntry {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            id: reader.read()?,
            invoker: reader.read()?,
            time_ms: reader.read()?,
        })
    }
}

impl Encode for CkptEndEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.ckpt_start.encode_to(buf)?;
        self.first_active.encode_to(buf)?;
        self.mapping_root.encode_to(buf)?;
        self.last_node_id.encode_to(buf)?;
        self.last_db_id.encode_to(buf)?;
        self.last_txn_id.encode_to(buf)?;
        self.time_ms.encode_to(buf)
    }
}

impl Decode for CkptEndEntry {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            id: reader.read()?,
            ckpt_start: reader.read()?,
            first_active: reader.read()?,
            mapping_root: reader.read()?,
            last_node_id: reader.read()?,
            last_db_id: reader.read()?,
            last_txn_id: reader.read()?,
            time_ms: reader.read()?,
        })
    }
}

/// Milliseconds since the Unix epoch, for entry timestamps.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
