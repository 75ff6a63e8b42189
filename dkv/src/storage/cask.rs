use std::path::{Path, PathBuf};

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::log::Log;
use crate::storage::{now_secs, Entry, KeyDir, Status};

/// A very simple log-structured key-value engine.
///
/// Cask writes key-value pairs to an append-only log file, and keeps a
/// mapping of keys to file positions in memory. All live keys must fit in
/// memory. Deletes write a tombstone value to the log file. To remove old
/// garbage and expired entries, logs can be compacted by writing new logs
/// containing only live data, skipping replaced values, tombstones, and
/// entries whose expiry has passed.
///
/// This implementation makes several significant simplifications over a
/// standard cask:
///
/// - Instead of writing multiple fixed-size log files, it uses a single
///   append-only log file of arbitrary size. This increases the compaction
///   volume, since the entire log file must be rewritten on every compaction,
///   and can exceed the filesystem's file size limit.
///
/// - Hint files are not used, the log itself is scanned when opened to
///   build the keydir.
///
/// - Log entries don't contain checksums.
pub struct Cask {
    /// The active append-only log file.
    log: Log,

    /// use index, Maps keys to a value position, length and expiry in the
    /// log file.
    keydir: KeyDir,

    /// Copy buffer size for backup and compaction, in bytes.
    cache_size: usize,
}

const DEFAULT_CACHE_SIZE: usize = 64 * 1024;

impl Cask {
    /// Opens or creates a Cask in the given file.
    pub fn new(path: PathBuf) -> CResult<Self> {
        Self::new_with_lock(path, true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        let mut log = Log::new_with_lock(path, try_lock)?;
        let keydir = log.build_keydir()?;
        Ok(Self { log, keydir, cache_size: DEFAULT_CACHE_SIZE })
    }

    /// Opens a Cask, and automatically compacts it if the amount of garbage
    /// exceeds the given ratio when opened.
    pub fn new_compact(path: PathBuf, garbage_ratio_threshold: f64) -> CResult<Self> {
        let mut s = Self::new(path)?;

        let status = s.status()?;
        let garbage_ratio = status.garbage_disk_size as f64 / status.total_disk_size as f64;
        if status.garbage_disk_size > 0 && garbage_ratio >= garbage_ratio_threshold {
            log::info!(
                "Compacting {} to remove {:.3}MB garbage ({:.0}% of {:.3}MB)",
                s.log.path.display(),
                status.garbage_disk_size / 1024 / 1024,
                garbage_ratio * 100.0,
                status.total_disk_size / 1024 / 1024
            );
            s.compact()?;
            log::info!(
                "Compacted {} to size {:.3}MB",
                s.log.path.display(),
                (status.total_disk_size - status.garbage_disk_size) / 1024 / 1024
            );
        }

        Ok(s)
    }

    /// Sets the copy buffer size used by backup and compaction.
    pub fn set_cache_size(&mut self, cache_size: usize) {
        if cache_size > 0 {
            self.cache_size = cache_size;
        }
    }

    pub fn get_path(&self) -> Option<&str> {
        self.log.path.to_str()
    }
}

impl std::fmt::Display for Cask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cask")
    }
}

impl Engine for Cask {
    type ScanIterator<'a> = CaskScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.log.write_entry(key, None)?;
        self.keydir.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(self.log.file.sync_all()?)
    }

    fn get(&mut self, key: &[u8]) -> CResult<Option<Entry>> {
        if let Some((value_pos, value_len, expire_at)) = self.keydir.get(key).copied() {
            let value = self.log.read_value(value_pos, value_len)?;
            Ok(Some(Entry { value, expire_at }))
        } else {
            Ok(None)
        }
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
    where
        Self: Sized,
    {
        CaskScanIterator { inner: self.keydir.range(range), log: &mut self.log }
    }

    fn set(&mut self, key: &[u8], entry: Entry) -> CResult<()> {
        let (pos, len) = self.log.write_entry(key, Some((&entry.value, entry.expire_at)))?;
        let value_len = entry.value.len() as u32;
        self.keydir.insert(
            key.to_vec(),
            (pos + len as u64 - value_len as u64, value_len, entry.expire_at),
        );
        Ok(())
    }

    fn status(&mut self) -> CResult<Status> {
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .iter()
            .fold(0, |size, (key, (_, value_len, _))| size + key.len() as u64 + *value_len as u64);
        let total_disk_size = self.log.file.metadata()?.len();
        let live_disk_size = size + 16 * keys; // account for length and expiry prefixes
        let garbage_disk_size = total_disk_size - live_disk_size;
        Ok(Status {
            name: self.to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size,
            garbage_disk_size,
        })
    }

    fn backup_to(&mut self, path: &Path) -> CResult<()> {
        self.flush()?;
        if let Some(dir) = path.parent() {
            fs_extra::dir::create_all(dir, false)?;
        }
        let mut options = fs_extra::file::CopyOptions::new();
        options.overwrite = true;
        options.buffer_size = self.cache_size;
        fs_extra::file::copy(&self.log.path, path, &options)?;
        Ok(())
    }

    fn restore_from(&mut self, path: &Path) -> CResult<()> {
        let mut snap = Log::new_with_lock(path.to_path_buf(), false)?;
        let snap_keydir = snap.build_keydir()?;

        self.log.file.set_len(0)?;
        let mut keydir = KeyDir::new();
        for (key, (value_pos, value_len, expire_at)) in snap_keydir.iter() {
            let value = snap.read_value(*value_pos, *value_len)?;
            let (pos, len) = self.log.write_entry(key, Some((&value, *expire_at)))?;
            keydir.insert(
                key.clone(),
                (pos + len as u64 - *value_len as u64, *value_len, *expire_at),
            );
        }
        self.keydir = keydir;
        self.flush()
    }
}

impl Cask {
    /// Compacts the current log file by writing out a new log file containing
    /// only live keys and replacing the current file with it. Entries expired
    /// at compaction time are dropped.
    pub fn compact(&mut self) -> CResult<()> {
        let mut tmp_path = self.log.path.clone();
        // need double disk size
        tmp_path.set_extension("new");

        let (mut new_log, new_keydir) = self.write_log(tmp_path, now_secs())?;

        match std::fs::rename(&new_log.path, &self.log.path) {
            Ok(_) => {}
            Err(err) => {
                return Err(Error::Value(format!(
                    "db file compact error, from {:?} to {:?}, cause:{}.",
                    &new_log.path.to_str(),
                    &self.log.path.to_str(),
                    err
                )))
            }
        };

        new_log.path = self.log.path.clone();

        self.log = new_log;
        self.keydir = new_keydir;
        Ok(())
    }

    /// Writes out a new log file with the live, unexpired entries of the
    /// current log file and returns it along with its keydir. Entries are
    /// written in key order.
    fn write_log(&mut self, path: PathBuf, now: u64) -> CResult<(Log, KeyDir)> {
        let mut new_keydir = KeyDir::new();
        let mut new_log = Log::new(path)?;
        new_log.file.set_len(0)?; // truncate file if it exists
        for (key, (value_pos, value_len, expire_at)) in self.keydir.iter() {
            if *expire_at != 0 && *expire_at <= now {
                continue;
            }
            let value = self.log.read_value(*value_pos, *value_len)?;
            let (pos, len) = new_log.write_entry(key, Some((&value, *expire_at)))?;
            new_keydir.insert(
                key.clone(),
                (pos + len as u64 - *value_len as u64, *value_len, *expire_at),
            );
        }
        Ok((new_log, new_keydir))
    }
}

/// Attempt to flush the file when the Cask is closed.
impl Drop for Cask {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::error!("failed to flush file: {}", error)
        }
    }
}

pub struct CaskScanIterator<'a> {
    inner: std::collections::btree_map::Range<'a, Vec<u8>, (u64, u32, u64)>,
    log: &'a mut Log,
}

impl<'a> CaskScanIterator<'a> {
    fn map(&mut self, item: (&Vec<u8>, &(u64, u32, u64))) -> <Self as Iterator>::Item {
        let (key, (value_pos, value_len, expire_at)) = item;
        let value = self.log.read_value(*value_pos, *value_len)?;
        Ok((key.clone(), Entry { value, expire_at: *expire_at }))
    }
}

impl<'a> Iterator for CaskScanIterator<'a> {
    type Item = CResult<(Vec<u8>, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| self.map(item))
    }
}

impl<'a> DoubleEndedIterator for CaskScanIterator<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|item| self.map(item))
    }
}
