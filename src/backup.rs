//! Hot backups.
//!
//! A backup set is every log file up to the last one complete when the
//! backup started. While a [`Backup`] is open the checkpointer keeps those
//! files even when the cleaner has finished with them, so they can be
//! copied while the environment keeps running. Copying the listed files,
//! in order, into an empty directory yields an environment that opens to
//! the state of the backup's start.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::Error;
use crate::env::EnvironmentImpl;
use crate::log::files::file_name;

/// An open backup, from [`Environment::start_backup`](crate::Environment::start_backup).
///
/// End it with [`end`](Self::end); a dropped backup ends too.
pub struct Backup {
    env: Arc<EnvironmentImpl>,
    id: u64,
    last_file: Option<u32>,
    files: Vec<String>,
}

impl std::fmt::Debug for Backup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backup")
            .field("id", &self.id)
            .field("last_file", &self.last_file)
            .field("files", &self.files.len())
            .finish()
    }
}

impl Backup {
    pub(crate) fn start(env: &Arc<EnvironmentImpl>) -> Result<Self, Error> {
        env.check_usable()?;
        // A writable log rolls so the last listed file no longer grows.
        let last_file = if env.config.read_only {
            Some(env.log.current_file())
        } else {
            let current = env.guard(env.log.roll_file().map_err(Error::from))?;
            current.checked_sub(1)
        };
        let (id, listed) = env
            .cleaner
            .pin_backup(last_file.unwrap_or(0), || env.log.files().list_files());
        let listed = match listed {
            Ok(listed) => listed,
            Err(e) => {
                env.cleaner.unpin_backup(id);
                return Err(e.into());
            }
        };
        let files: Vec<String> = match last_file {
            Some(last) => listed
                .into_iter()
                .filter(|&n| n <= last)
                .map(file_name)
                .collect(),
            None => Vec::new(),
        };
        info!(id, ?last_file, files = files.len(), "backup started");
        Ok(Self {
            env: Arc::clone(env),
            id,
            last_file,
            files,
        })
    }

    /// File names, relative to the environment home, to copy in order.
    pub fn log_files(&self) -> &[String] {
        &self.files
    }

    /// Full paths of [`log_files`](Self::log_files).
    pub fn log_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| self.env.home.join(f)).collect()
    }

    /// Number of the last file in the backup set.
    pub fn last_file(&self) -> Option<u32> {
        self.last_file
    }

    /// Releases the files of the backup set to the cleaner.
    pub fn end(self) {
        drop(self);
    }
}

impl Drop for Backup {
    fn drop(&mut self) {
        if self.env.cleaner.unpin_backup(self.id) {
            debug!(id = self.id, "backup ended");
        }
    }
}
