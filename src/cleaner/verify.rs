//! Consistency checks between the trees and utilization accounting.
//!
//! Two things must hold for the cleaner to be safe. Every LSN a tree
//! references lies in a log file that still exists. And no file's
//! summary claims fewer live records of a database than the tree of that
//! database still references there, since the cleaner ranks files by
//! those counts.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::env::EnvironmentImpl;
use crate::env::dbtree::is_reserved;
use crate::log::Lsn;
use crate::{DatabaseId, Error};

/// One inconsistency found by [`verify_utilization`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyProblem {
    /// A tree references an entry in a log file that was deleted.
    MissingFile {
        db: DatabaseId,
        lsn: Lsn,
        node: bool,
    },
    /// The summary of `file` leaves fewer live records of `db` than the
    /// tree references in it.
    ObsoleteOvercount {
        file: u32,
        db: DatabaseId,
        referenced: u32,
        counted_live: u32,
    },
}

impl std::fmt::Display for VerifyProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFile { db, lsn, node } => {
                let kind = if *node { "node" } else { "record" };
                write!(f, "database {db}: {kind} at {lsn} lies in a deleted file")
            }
            Self::ObsoleteOvercount {
                file,
                db,
                referenced,
                counted_live,
            } => write!(
                f,
                "file {file}: database {db} references {referenced} records, \
                 summary leaves {counted_live} live"
            ),
        }
    }
}

/// Walks every database tree and checks its references against the log
/// files and the utilization summaries.
pub(crate) fn verify_utilization(env: &EnvironmentImpl) -> Result<Vec<VerifyProblem>, Error> {
    let mut ids: BTreeSet<DatabaseId> = env
        .databases()
        .iter()
        .map(|db| db.id)
        .filter(|&id| is_reserved(id))
        .collect();
    ids.extend(env.named_ids()?);

    let existing: BTreeSet<u32> = env.log.files().list_files()?.into_iter().collect();
    let mut problems = Vec::new();
    let mut checked = 0u64;
    for id in ids {
        let Some(db) = env.db(id)? else {
            continue;
        };
        let mut referenced: BTreeMap<u32, u32> = BTreeMap::new();
        db.tree.visit_lsns(&mut |lsn, node| {
            checked += 1;
            if !existing.contains(&lsn.file()) {
                problems.push(VerifyProblem::MissingFile { db: id, lsn, node });
            } else if !node {
                *referenced.entry(lsn.file()).or_default() += 1;
            }
        })?;
        if is_reserved(id) {
            continue;
        }
        for (file, referenced) in referenced {
            let counted_live = env
                .tracker
                .db_summary(file, id)
                .map_or(0, |s| s.ln_count.saturating_sub(s.obsolete_ln_count));
            if referenced > counted_live {
                problems.push(VerifyProblem::ObsoleteOvercount {
                    file,
                    db: id,
                    referenced,
                    counted_live,
                });
            }
        }
    }

    for problem in &problems {
        warn!(%problem, "utilization check failed");
    }
    info!(checked, problems = problems.len(), "utilization verified");
    Ok(problems)
}
