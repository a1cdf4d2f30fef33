#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::*;

    #[test]
    fn defaults_are_valid() {
        EnvironmentConfig::default().validate().unwrap();
        MutableConfig::default().validate().unwrap();
        DatabaseConfig::default().validate().unwrap();
        TransactionConfig::default().validate().unwrap();
        CursorConfig::default().validate().unwrap();
    }

    #[test]
    fn node_fanout_bounds() {
        let mut config = EnvironmentConfig {
            node_max_entries: 3,
            ..EnvironmentConfig::default()
        };
        assert!(config.validate().is_err());

        config.node_max_entries = 4;
        config.validate().unwrap();

        config.dup_node_max_entries = 40_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let config = EnvironmentConfig {
            lock_timeout: Duration::ZERO,
            ..EnvironmentConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EnvironmentConfig {
            cleaner_lock_timeout: Duration::ZERO,
            ..EnvironmentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn environment_validation_covers_mutable_part() {
        let config = EnvironmentConfig {
            mutable: MutableConfig {
                cache_size: 1024,
                ..MutableConfig::default()
            },
            ..EnvironmentConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cache_size"));
    }

    #[test]
    fn utilization_thresholds() {
        let mut config = MutableConfig {
            cleaner_min_utilization: 91,
            ..MutableConfig::default()
        };
        assert!(config.validate().is_err());

        config.cleaner_min_utilization = 90;
        config.cleaner_min_file_utilization = 51;
        assert!(config.validate().is_err());

        config.cleaner_min_file_utilization = 0;
        config.validate().unwrap();
    }

    #[test]
    fn exclusive_create_needs_allow_create() {
        let config = DatabaseConfig {
            exclusive_create: true,
            ..DatabaseConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_comparator_needs_sorted_duplicates() {
        let mut config = DatabaseConfig {
            duplicate_comparator: Some("reverse".into()),
            ..DatabaseConfig::default()
        };
        assert!(config.validate().is_err());

        config.sorted_duplicates = true;
        config.validate().unwrap();
    }

    #[test]
    fn isolation_levels_are_exclusive() {
        let config = TransactionConfig {
            serializable: true,
            read_committed: true,
            ..TransactionConfig::default()
        };
        assert!(config.validate().is_err());

        let config = CursorConfig {
            read_committed: true,
            read_uncommitted: true,
        };
        assert!(config.validate().is_err());
    }
}
