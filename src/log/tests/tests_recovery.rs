#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use tempfile::TempDir;

    use crate::log::entry::ENTRY_HEADER_SIZE;
    use crate::log::scanner::valid_prefix;
    use crate::log::tests::helpers::*;
    use crate::log::{LogError, Lsn};

    #[test]
    fn torn_tail_is_truncated_on_open() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let (last, end) = {
            let log = open_log(tmp.path(), 1 << 20).unwrap();
            log.append(&ln(b"a", b"1"), false).unwrap();
            let last = log.append(&ln(b"b", b"2"), false).unwrap();
            log.close().unwrap();
            (last, log.end_of_log())
        };

        let path = tmp.path().join("00000000.jdb");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAB; 37]).unwrap();
        drop(file);

        let log = open_log(tmp.path(), 1 << 20).unwrap();
        assert_eq!(log.truncated_tail(), 37);
        assert_eq!(log.end_of_log(), end);
        assert_eq!(log.last_entry_lsn(), last);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), u64::from(end.offset()));

        // Appends continue right after the last valid entry.
        assert_eq!(log.append(&commit(1), false).unwrap(), end);
    }

    #[test]
    fn corrupt_entry_fails_its_checksum() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), 1 << 20).unwrap();
        let lsn = log.append(&ln(b"key", b"value"), false).unwrap();
        log.flush(true).unwrap();

        let path = tmp.path().join("00000000.jdb");
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(u64::from(lsn.offset()) + ENTRY_HEADER_SIZE as u64 + 1))
            .unwrap();
        file.write_all(&[0xFF]).unwrap();
        file.sync_all().unwrap();

        assert!(matches!(log.read_entry(lsn), Err(LogError::Checksum { .. })));
    }

    #[test]
    fn valid_prefix_needs_a_file_header() {
        assert!(valid_prefix(&[]).is_none());
        assert!(valid_prefix(&[0u8; 64]).is_none());
    }

    #[test]
    fn file_without_header_is_removed() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        {
            let log = open_log(tmp.path(), 1 << 20).unwrap();
            log.append(&commit(1), false).unwrap();
            log.close().unwrap();
        }
        let junk = tmp.path().join("00000001.jdb");
        std::fs::write(&junk, [1u8, 2, 3]).unwrap();

        let log = open_log(tmp.path(), 1 << 20).unwrap();
        assert!(!junk.exists());
        assert_eq!(log.current_file(), 0);
        assert!(log.end_of_log() > Lsn::new(0, 0));
    }
}
