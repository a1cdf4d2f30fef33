//! Log file naming, listing, memory-mapped reads and deletion.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::LogError;

/// Suffix shared by every log file.
pub(crate) const FILE_SUFFIX: &str = ".jdb";

/// Returns the file name for a log file number (`0000001a.jdb`).
pub(crate) fn file_name(num: u32) -> String {
    format!("{num:08x}{FILE_SUFFIX}")
}

/// Parses a log file number from a file name.
pub(crate) fn parse_file_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(FILE_SUFFIX)?;
    if stem.len() != 8 {
        return None;
    }
    u32::from_str_radix(stem, 16).ok()
}

/// Read-side access to the numbered log files of one environment.
///
/// Files that have been rolled are immutable and are read through a cached
/// read-only memory map. The active file is read through a plain handle
/// because it still grows.
pub(crate) struct FileManager {
    dir: PathBuf,
    maps: Mutex<HashMap<u32, Arc<Mmap>>>,
    active_reader: Mutex<Option<(u32, File)>>,
}

impl FileManager {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            maps: Mutex::new(HashMap::new()),
            active_reader: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, num: u32) -> PathBuf {
        self.dir.join(file_name(num))
    }

    pub fn exists(&self, num: u32) -> bool {
        self.path_for(num).exists()
    }

    /// All log file numbers in ascending order.
    pub fn list_files(&self) -> Result<Vec<u32>, LogError> {
        let mut nums = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(num) = entry.file_name().to_str().and_then(parse_file_name) {
                nums.push(num);
            }
        }
        nums.sort_unstable();
        Ok(nums)
    }

    /// Returns the memory map of a rolled (immutable) file.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }`. The map is read-only and rolled log
    /// files are never written again; they are only removed through
    /// [`FileManager::delete_file`], which drops the cached map first.
    pub fn mapped(&self, num: u32) -> Result<Arc<Mmap>, LogError> {
        let mut maps = self.maps.lock();
        if let Some(map) = maps.get(&num) {
            return Ok(Arc::clone(map));
        }
        let file = match File::open(self.path_for(num)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LogError::FileNotFound(num));
            }
            Err(e) => return Err(e.into()),
        };
        let map = Arc::new(unsafe { Mmap::map(&file)? });
        maps.insert(num, Arc::clone(&map));
        Ok(map)
    }

    /// Reads `buf.len()` bytes at `offset` of the active file.
    pub fn read_active(&self, num: u32, offset: u32, buf: &mut [u8]) -> Result<(), LogError> {
        let mut reader = self.active_reader.lock();
        let stale = !matches!(reader.as_ref(), Some((n, _)) if *n == num);
        if stale {
            let file = match File::open(self.path_for(num)) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(LogError::FileNotFound(num));
                }
                Err(e) => return Err(e.into()),
            };
            *reader = Some((num, file));
        }
        let Some((_, file)) = reader.as_mut() else {
            return Err(LogError::FileNotFound(num));
        };
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Forgets the read handle of a file that just stopped being active.
    pub fn retire_active(&self, num: u32) {
        let mut reader = self.active_reader.lock();
        if matches!(reader.as_ref(), Some((n, _)) if *n == num) {
            *reader = None;
        }
    }

    /// Removes a log file from disk and from the map cache.
    pub fn delete_file(&self, num: u32) -> Result<(), LogError> {
        self.maps.lock().remove(&num);
        match fs::remove_file(self.path_for(num)) {
            Ok(()) => {
                info!(file = num, "deleted log file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(file = num, "log file already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Total size in bytes of all log files.
    pub fn total_size(&self) -> Result<u64, LogError> {
        let mut total = 0;
        for num in self.list_files()? {
            if let Ok(meta) = fs::metadata(self.path_for(num)) {
                total += meta.len();
            }
        }
        Ok(total)
    }
}
