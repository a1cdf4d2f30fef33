//! Choosing the next file to clean.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::env::EnvironmentImpl;

use super::{FileSummary, utilization};

/// Highest file number recovery may still need to read: files from the
/// one holding the redo start of the last checkpoint onward are kept.
/// `None` before the first checkpoint.
fn recovery_horizon(env: &EnvironmentImpl) -> Option<u32> {
    let last = env.checkpointer.last()?;
    let start = if !last.first_active.is_null() && last.first_active < last.start {
        last.first_active
    } else {
        last.start
    };
    Some(start.file())
}

/// Files that may be cleaned at all, with their summaries.
pub(crate) fn candidates(env: &EnvironmentImpl, skip: &BTreeSet<u32>) -> Vec<(u32, FileSummary)> {
    let Some(horizon) = recovery_horizon(env) else {
        return Vec::new();
    };
    let current = env.log.current_file();
    let min_age = env.config.cleaner_min_age;
    env.tracker
        .summaries()
        .into_iter()
        .filter(|&(file, summary)| {
            file < horizon
                && current.saturating_sub(file) >= min_age
                && file != current
                && summary.total_count > 0
                && !skip.contains(&file)
                && !env.cleaner.is_claimed(file)
                && env.log.files().exists(file)
        })
        .collect()
}

/// Picks the file to clean next, or `None` when utilization is good
/// enough. Files named in `force_clean_files` come first.
pub(crate) fn select(env: &EnvironmentImpl, force: bool, skip: &BTreeSet<u32>) -> Option<u32> {
    let config = env.mutable.snapshot().config.clone();
    let candidates = candidates(env, skip);
    if let Some(&(file, _)) = candidates
        .iter()
        .find(|(file, _)| config.force_clean_files.contains(file))
    {
        debug!(file, "selected file named in force_clean_files");
        return Some(file);
    }

    let (live, total) = env
        .tracker
        .summaries()
        .iter()
        .filter(|&(&file, _)| !env.cleaner.is_claimed(file))
        .fold((0u64, 0u64), |(live, total), (_, s)| {
            (live + s.live_size(), total + s.total_size)
        });
    let total_utilization = utilization(live, total);

    let (file, lowest) = candidates
        .iter()
        .map(|&(file, summary)| (file, summary.utilization()))
        .min_by_key(|&(file, util)| (util, file))?;
    trace!(
        file,
        utilization = lowest,
        total = total_utilization,
        candidates = candidates.len(),
        "cleaner candidates"
    );

    let reason = if force {
        "forced"
    } else if total_utilization < u32::from(config.cleaner_min_utilization) {
        "total utilization"
    } else if lowest < u32::from(config.cleaner_min_file_utilization) {
        "file utilization"
    } else {
        return None;
    };
    debug!(file, utilization = lowest, total = total_utilization, reason, "selected file to clean");
    Some(file)
}
