use std::path::Path;

use crate::error::CResult;
use crate::storage::engine::Engine;
use crate::storage::{Entry, Status};

/// 纯内存的存储引擎，使用的就是BTreeMap，将key和entry直接存储在内存当中，不会对数据进行持久化。
/// Snapshots are the exception: backup_to/restore_from serialize the whole
/// map so an in-memory replica can still bootstrap.
pub struct Memory {
    data: std::collections::BTreeMap<Vec<u8>, Entry>,
}

impl Memory {
    /// Creates a Memory key-value storage engine.
    pub fn new() -> Self {
        Self { data: std::collections::BTreeMap::new() }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl Engine for Memory {
    type ScanIterator<'a> = MemoryScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.data.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> CResult<Option<Entry>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
    where
        Self: Sized,
    {
        MemoryScanIterator { inner: self.data.range(range) }
    }

    fn set(&mut self, key: &[u8], entry: Entry) -> CResult<()> {
        self.data.insert(key.to_vec(), entry);
        Ok(())
    }

    fn status(&mut self) -> CResult<Status> {
        Ok(Status {
            name: self.to_string(),
            keys: self.data.len() as u64,
            size: self
                .data
                .iter()
                .fold(0, |size, (k, e)| size + k.len() as u64 + e.value.len() as u64),
            total_disk_size: 0,
            live_disk_size: 0,
            garbage_disk_size: 0,
        })
    }

    fn backup_to(&mut self, path: &Path) -> CResult<()> {
        let pairs: Vec<(&Vec<u8>, &Entry)> = self.data.iter().collect();
        std::fs::write(path, bincode::serialize(&pairs)?)?;
        Ok(())
    }

    fn restore_from(&mut self, path: &Path) -> CResult<()> {
        let bytes = std::fs::read(path)?;
        let pairs: Vec<(Vec<u8>, Entry)> = bincode::deserialize(&bytes)?;
        self.data = pairs.into_iter().collect();
        Ok(())
    }
}

pub struct MemoryScanIterator<'a> {
    inner: std::collections::btree_map::Range<'a, Vec<u8>, Entry>,
}

impl<'a> MemoryScanIterator<'a> {
    fn map(item: (&Vec<u8>, &Entry)) -> <Self as Iterator>::Item {
        let (key, entry) = item;
        Ok((key.clone(), entry.clone()))
    }
}

impl<'a> Iterator for MemoryScanIterator<'a> {
    type Item = CResult<(Vec<u8>, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Self::map)
    }
}

impl<'a> DoubleEndedIterator for MemoryScanIterator<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(Self::map)
    }
}
