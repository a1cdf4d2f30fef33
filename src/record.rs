//! Record values passed through the public API.

/// A byte range of a record's data.
///
/// On a write, the `length` bytes at `offset` in the stored data are
/// replaced by the entry's bytes; data shorter than `offset` is padded with
/// zeros first. On a read, only the range is returned, clipped to the
/// stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partial {
    pub offset: usize,
    pub length: usize,
}

impl Partial {
    /// Applies a partial write of `bytes` to `old`.
    pub fn apply(&self, old: &[u8], bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(old.len().max(self.offset) + bytes.len());
        out.extend_from_slice(&old[..old.len().min(self.offset)]);
        out.resize(self.offset, 0);
        out.extend_from_slice(bytes);
        let tail = self.offset.saturating_add(self.length);
        if tail < old.len() {
            out.extend_from_slice(&old[tail..]);
        }
        out
    }

    /// The part of `data` a partial read returns.
    pub fn extract<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset.min(data.len());
        let end = self.offset.saturating_add(self.length).min(data.len());
        &data[start..end]
    }
}

/// Data handed to a write, optionally as a partial update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseEntry {
    data: Vec<u8>,
    partial: Option<Partial>,
}

impl DatabaseEntry {
    pub fn new(data: impl AsRef<[u8]>) -> Self {
        Self {
            data: data.as_ref().to_vec(),
            partial: None,
        }
    }

    /// An entry that replaces `length` bytes at `offset`.
    pub fn with_partial(data: impl AsRef<[u8]>, offset: usize, length: usize) -> Self {
        Self {
            data: data.as_ref().to_vec(),
            partial: Some(Partial { offset, length }),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn partial(&self) -> Option<Partial> {
        self.partial
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl From<&[u8]> for DatabaseEntry {
    fn from(data: &[u8]) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for DatabaseEntry {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data,
            partial: None,
        }
    }
}

/// Outcome of an operation whose negative results are expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Success,
    /// No record matched.
    NotFound,
    /// The cursor's record was deleted.
    KeyEmpty,
    /// A no-overwrite write found the key (or key and data) present.
    KeyExist,
}

impl OperationStatus {
    pub fn is_success(self) -> bool {
        self == OperationStatus::Success
    }
}

/// Locking of a single read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockMode {
    /// The isolation of the cursor or transaction.
    #[default]
    Default,
    /// No lock; may return uncommitted data.
    ReadUncommitted,
    /// Read lock released when the cursor moves on.
    ReadCommitted,
    /// Write lock up front, for a read followed by an update.
    Rmw,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_write_replaces_range() {
        let p = Partial {
            offset: 2,
            length: 3,
        };
        assert_eq!(p.apply(b"abcdefg", b"XY"), b"abXYfg".to_vec());
    }

    #[test]
    fn partial_write_past_end_pads_with_zeros() {
        let p = Partial {
            offset: 5,
            length: 0,
        };
        assert_eq!(p.apply(b"ab", b"Z"), vec![b'a', b'b', 0, 0, 0, b'Z']);
    }

    #[test]
    fn partial_read_is_clipped() {
        let p = Partial {
            offset: 3,
            length: 10,
        };
        assert_eq!(p.extract(b"abcdef"), b"def");
        assert_eq!(p.extract(b"ab"), b"");
    }
}
