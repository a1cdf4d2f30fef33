#[cfg(test)]
mod tests {
    use crate::cleaner::*;
    use crate::log::Lsn;
    use crate::log::entry::LogEntryType;

    #[test]
    fn empty_file_is_fully_utilized() {
        let summary = FileSummary::default();
        assert!(summary.is_empty());
        assert_eq!(summary.obsolete_size(), 0);
        assert_eq!(summary.utilization(), 100);
    }

    #[test]
    fn markers_count_as_obsolete() {
        let tracker = UtilizationTracker::new();
        tracker.count_new(Lsn::new(0, 0), LogEntryType::FileHeader, 40, None);
        tracker.count_new(Lsn::new(0, 40), LogEntryType::Ln, 60, Some(3));
        tracker.count_new(Lsn::new(0, 100), LogEntryType::TxnCommit, 100, None);

        let summary = tracker.summary(0).unwrap();
        assert_eq!(summary.total_count, 3);
        assert_eq!(summary.total_size, 200);
        assert_eq!(summary.total_ln_size, 60);
        // Only the LN is live.
        assert_eq!(summary.obsolete_size(), 140);
        assert_eq!(summary.utilization(), 30);
    }

    #[test]
    fn obsolete_sizes_known_and_estimated() {
        let tracker = UtilizationTracker::new();
        for i in 0..4u32 {
            tracker.count_new(Lsn::new(2, i * 100), LogEntryType::Ln, 100, Some(5));
        }
        tracker.count_new(Lsn::new(2, 400), LogEntryType::Bin, 200, Some(5));

        tracker.count_obsolete(&Obsolete::ln(Lsn::new(2, 0), Some(100), 5));
        tracker.count_obsolete(&Obsolete::ln(Lsn::new(2, 100), None, 5));
        tracker.count_obsolete(&Obsolete::node(Lsn::new(2, 400), 5));

        let summary = tracker.summary(2).unwrap();
        assert_eq!(summary.obsolete_ln_count, 2);
        assert_eq!(summary.obsolete_ln_size_counted, 1);
        // 100 known + 100 average LN + 200 average node.
        assert_eq!(summary.obsolete_size(), 400);
        assert_eq!(summary.live_size(), 200);

        let db = tracker.db_summary(2, 5).unwrap();
        assert_eq!((db.ln_count, db.obsolete_ln_count), (4, 2));
        assert_eq!((db.in_count, db.obsolete_in_count), (1, 1));
    }

    #[test]
    fn null_lsn_is_never_counted() {
        let tracker = UtilizationTracker::new();
        tracker.count_obsolete(&Obsolete::ln(Lsn::NULL, Some(10), 3));
        assert!(tracker.summaries().is_empty());
    }

    #[test]
    fn persisted_summary_covers_earlier_events() {
        let tracker = UtilizationTracker::new();
        let mut record = SummaryRecord::default();
        record.summary.total_count = 10;
        record.summary.total_size = 1000;
        tracker.load(1, record, Lsn::new(3, 500));
        assert!(tracker.dirty_files().is_empty());

        // Logged before the summary was persisted: already included.
        tracker.count_new_if_uncounted(Lsn::new(1, 900), LogEntryType::Ln, 50, Some(3));
        tracker.count_obsolete_if_uncounted(&Obsolete::ln(Lsn::new(1, 100), Some(50), 3), Lsn::new(3, 100));
        assert_eq!(tracker.summary(1).unwrap().total_count, 10);
        assert_eq!(tracker.summary(1).unwrap().obsolete_ln_count, 0);

        // Caused after it: counted.
        tracker.count_obsolete_if_uncounted(&Obsolete::ln(Lsn::new(1, 100), Some(50), 3), Lsn::new(3, 600));
        assert_eq!(tracker.summary(1).unwrap().obsolete_ln_count, 1);
        assert_eq!(tracker.dirty_files(), vec![1]);
    }

    #[test]
    fn persist_clears_dirty_until_marked() {
        let tracker = UtilizationTracker::new();
        tracker.count_new(Lsn::new(0, 0), LogEntryType::Ln, 10, Some(3));
        assert_eq!(tracker.dirty_files(), vec![0]);

        let snapshot = tracker.snapshot_for_persist(0).unwrap();
        assert_eq!(snapshot.summary.total_count, 1);
        tracker.persisted(0, Lsn::new(1, 0));
        assert!(tracker.dirty_files().is_empty());

        tracker.mark_dirty(0);
        assert_eq!(tracker.dirty_files(), vec![0]);

        tracker.remove_file(0);
        assert!(tracker.summary(0).is_none());
    }

    #[test]
    fn summary_record_bytes_decode() {
        let mut record = SummaryRecord::default();
        record.summary.total_count = 3;
        record.summary.obsolete_ln_size = 77;
        record.dbs.insert(4, DbFileSummary {
            ln_count: 2,
            ..DbFileSummary::default()
        });

        let bytes = record.to_bytes().unwrap();
        assert_eq!(SummaryRecord::from_bytes(&bytes).unwrap(), record);

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(SummaryRecord::from_bytes(&trailing).is_err());
    }

    #[test]
    fn summary_keys_sort_by_file_number() {
        assert!(summary_key(2) < summary_key(10));
        assert_eq!(file_from_summary_key(&summary_key(0x1234)), Some(0x1234));
        assert_eq!(file_from_summary_key(b"abc"), None);
    }

    #[test]
    fn concurrent_counts_land_in_their_own_files() {
        let tracker = UtilizationTracker::new();
        std::thread::scope(|s| {
            for file in 0..8u32 {
                let tracker = &tracker;
                s.spawn(move || {
                    for i in 0..500u32 {
                        tracker.count_new(Lsn::new(file, i * 10), LogEntryType::Ln, 10, Some(9));
                        if i % 2 == 0 {
                            tracker.count_obsolete(&Obsolete::ln(Lsn::new(file, i * 10), Some(10), 9));
                        }
                    }
                });
            }
        });

        let summaries = tracker.summaries();
        assert_eq!(summaries.len(), 8);
        for (file, summary) in summaries {
            assert_eq!(summary.total_ln_count, 500, "file {file}");
            assert_eq!(summary.obsolete_ln_count, 250, "file {file}");
            assert_eq!(summary.utilization(), 50, "file {file}");
        }
        tracker.remove_file(3);
        assert!(tracker.summary(3).is_none());
        assert_eq!(tracker.db_summary(4, 9).unwrap().ln_count, 500);
    }
}
