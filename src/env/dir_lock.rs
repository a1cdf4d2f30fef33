//! The environment lock file.
//!
//! A read-only environment reads log files without any coordination with
//! the process writing them, so the writer must not delete a file such a
//! reader may still need. Every read-only handle holds a shared `flock` on
//! `arborlog.lck` for as long as it is open. The checkpointer deletes
//! cleaned files only while it holds the exclusive lock, which it asks for
//! without waiting; when a reader is present the files stay and the next
//! checkpoint tries again.
//!
//! `flock` locks belong to the open file description, so two handles in
//! the same process conflict exactly like two processes do.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Name of the lock file inside the environment home.
pub(crate) const LOCK_FILE: &str = "arborlog.lck";

pub(crate) struct DirLock {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

/// Holds the exclusive lock until dropped.
pub(crate) struct ExclusiveGuard<'a> {
    file: &'a File,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file, Op::Unlock) {
            warn!(error = %e, "could not release the environment lock");
        }
    }
}

impl DirLock {
    /// Opens the lock file in `home`. A read-only environment takes the
    /// shared lock here and keeps it until [`release`](Self::release).
    pub fn open(home: &Path, read_only: bool) -> io::Result<Self> {
        let path = home.join(LOCK_FILE);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            // A reader without write access to the directory can still lock
            // a lock file the writer created.
            Err(e) if read_only && e.kind() == io::ErrorKind::PermissionDenied => {
                File::open(&path)?
            }
            Err(e) => return Err(e),
        };
        if read_only {
            flock(&file, Op::Shared)?;
            debug!(path = %path.display(), "shared environment lock taken");
        }
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// Runs `f` while holding the exclusive lock. Returns `None` without
    /// running it when a read-only handle holds the shared lock.
    pub fn with_exclusive<T>(&self, f: impl FnOnce() -> T) -> io::Result<Option<T>> {
        let file = self.file.lock();
        let Some(file) = file.as_ref() else {
            return Ok(None);
        };
        if !try_flock(file, Op::Exclusive)? {
            debug!(path = %self.path.display(), "environment lock held by a reader");
            return Ok(None);
        }
        let _guard = ExclusiveGuard { file };
        Ok(Some(f()))
    }

    /// Closes the lock file, dropping any lock held through it.
    pub fn release(&self) {
        self.file.lock().take();
    }
}

// ------------------------------------------------------------------------------------------------
// Platform
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Op {
    Shared,
    Exclusive,
    Unlock,
}

/// Blocking lock call.
fn flock(file: &File, op: Op) -> io::Result<()> {
    sys::flock(file, op, false).map(|_| ())
}

/// Non-blocking lock call; `false` when another holder conflicts.
fn try_flock(file: &File, op: Op) -> io::Result<bool> {
    sys::flock(file, op, true)
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    use super::Op;

    pub(super) fn flock(file: &File, op: Op, nonblocking: bool) -> io::Result<bool> {
        let mut flags = match op {
            Op::Shared => libc::LOCK_SH,
            Op::Exclusive => libc::LOCK_EX,
            Op::Unlock => libc::LOCK_UN,
        };
        if nonblocking {
            flags |= libc::LOCK_NB;
        }
        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), flags) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if nonblocking && err.kind() == io::ErrorKind::WouldBlock {
            return Ok(false);
        }
        Err(err)
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    use super::Op;

    // No advisory locking: deletion is never held back.
    pub(super) fn flock(_file: &File, _op: Op, _nonblocking: bool) -> io::Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn readers_block_exclusive_until_released() {
        let tmp = TempDir::new().unwrap();
        let writer = DirLock::open(tmp.path(), false).unwrap();
        assert_eq!(writer.with_exclusive(|| 1).unwrap(), Some(1));

        let reader = DirLock::open(tmp.path(), true).unwrap();
        let second = DirLock::open(tmp.path(), true).unwrap();
        assert_eq!(writer.with_exclusive(|| 2).unwrap(), None);

        reader.release();
        assert_eq!(writer.with_exclusive(|| 3).unwrap(), None);
        second.release();
        assert_eq!(writer.with_exclusive(|| 4).unwrap(), Some(4));
    }

    #[test]
    fn exclusive_is_dropped_after_the_call() {
        let tmp = TempDir::new().unwrap();
        let writer = DirLock::open(tmp.path(), false).unwrap();
        writer.with_exclusive(|| ()).unwrap();
        // A reader would block forever if the writer kept the lock.
        let reader = DirLock::open(tmp.path(), true).unwrap();
        reader.release();
    }

    #[test]
    fn released_writer_runs_nothing() {
        let tmp = TempDir::new().unwrap();
        let writer = DirLock::open(tmp.path(), false).unwrap();
        writer.release();
        assert_eq!(writer.with_exclusive(|| 1).unwrap(), None);
    }
}
