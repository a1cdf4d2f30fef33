#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tempfile::TempDir;

    use crate::log::LogError;
    use crate::log::Lsn;
    use crate::log::entry::LogEntry;
    use crate::log::tests::helpers::*;

    #[test]
    fn lsn_orders_by_file_then_offset() {
        assert!(Lsn::new(1, 0) > Lsn::new(0, u32::MAX - 1));
        assert!(Lsn::new(2, 10) < Lsn::new(2, 11));
        assert_eq!(Lsn::new(7, 42).file(), 7);
        assert_eq!(Lsn::new(7, 42).offset(), 42);
        assert!(Lsn::NULL.is_null());
        assert!(Lsn::new(0, 1).newer_than(Lsn::NULL));
        assert!(!Lsn::NULL.newer_than(Lsn::new(0, 1)));
    }

    #[test]
    fn fresh_log_starts_with_file_header() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), 1 << 20).unwrap();

        assert_eq!(log.current_file(), 0);
        assert_eq!(log.last_entry_lsn(), Lsn::new(0, 0));
        assert!(log.end_of_log() > Lsn::new(0, 0));
        assert!(matches!(log.read_entry(Lsn::new(0, 0)).unwrap(), LogEntry::FileHeader(_)));
        assert_eq!(log.stats().files_created.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn entries_read_back_from_buffer_and_file() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), 1 << 20).unwrap();

        let a = log.append(&ln(b"a", b"1"), false).unwrap();
        let b = log.append(&commit(9), false).unwrap();
        assert!(a < b);
        assert_eq!(log.end_of_log().file(), 0);

        // Still buffered.
        assert_eq!(log.read_entry(a).unwrap(), ln(b"a", b"1"));

        log.flush(true).unwrap();
        assert_eq!(log.read_entry(a).unwrap(), ln(b"a", b"1"));
        assert_eq!(log.read_entry(b).unwrap(), commit(9));
    }

    #[test]
    fn reading_past_the_end_is_a_checksum_error() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), 1 << 20).unwrap();

        let end = log.end_of_log();
        assert!(matches!(log.read_entry(end), Err(LogError::Checksum { .. })));
        assert!(matches!(log.read_entry(Lsn::NULL), Err(LogError::NullLsn)));
        assert!(matches!(log.read_entry(Lsn::new(5, 0)), Err(LogError::FileNotFound(5))));
    }

    #[test]
    fn files_roll_at_the_size_limit() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), 4096).unwrap();

        let value = vec![7u8; 500];
        let mut lsns = Vec::new();
        for i in 0..30u32 {
            lsns.push(log.append(&ln(&i.to_be_bytes(), &value), false).unwrap());
        }

        assert!(log.current_file() >= 3);
        for lsn in &lsns {
            assert!(lsn.offset() < 4096);
        }
        // Rolled files are read through their memory map.
        assert_eq!(log.read_entry(lsns[0]).unwrap(), ln(&0u32.to_be_bytes(), &value));
        assert_eq!(log.files().list_files().unwrap().len() as u32, log.current_file() + 1);
    }

    #[test]
    fn read_only_log_rejects_appends() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        {
            let log = open_log(tmp.path(), 1 << 20).unwrap();
            log.append(&commit(1), false).unwrap();
            log.close().unwrap();
        }

        let log = open_log_with(tmp.path(), 1 << 20, true).unwrap();
        assert!(log.is_read_only());
        assert!(matches!(log.append(&commit(2), false), Err(LogError::ReadOnly)));
    }

    #[test]
    fn read_only_open_of_empty_directory_fails() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            open_log_with(tmp.path(), 1 << 20, true),
            Err(LogError::ReadOnly)
        ));
    }
}
