use crate::error::CResult;
use crate::storage::{Entry, ScanIteratorT, Status};

/// A key/value storage engine, where keys are arbitrary byte strings stored
/// in lexicographical order and values carry an optional expiry. Writes are
/// only guaranteed durable after calling flush().
///
/// Only supports single-threaded use since all methods (including reads) take
/// a mutable reference -- serialized access can't be avoided anyway, since
/// the change journal above it assigns a single monotonic sequence and file
/// access is serial.
///
/// Expiry is stored, not enforced: the engine returns expired entries as
/// written, the store above decides what "now" is. Compaction is the one
/// place the engine itself drops expired entries.
pub trait Engine: std::fmt::Display + Send {
    /// The iterator returned by scan().
    type ScanIterator<'a>: ScanIteratorT + 'a
    where
        Self: Sized + 'a; // omit in trait objects, for object safety

    /// Deletes a key, or does nothing if it does not exist.
    fn delete(&mut self, key: &[u8]) -> CResult<()>;

    /// Flushes any buffered data to the underlying storage medium.
    fn flush(&mut self) -> CResult<()>;

    /// Gets the entry for a key, if it exists.
    fn get(&mut self, key: &[u8]) -> CResult<Option<Entry>>;

    /// Iterates over an ordered range of key/entry pairs.
    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
    where
        Self: Sized;

    /// Sets an entry for a key, replacing the existing one if any.
    fn set(&mut self, key: &[u8], entry: Entry) -> CResult<()>;

    /// Returns engine status.
    fn status(&mut self) -> CResult<Status>;

    /// Writes a self-contained snapshot of the keyspace to the given file.
    fn backup_to(&mut self, path: &std::path::Path) -> CResult<()>;

    /// Replaces the entire keyspace with the snapshot in the given file.
    fn restore_from(&mut self, path: &std::path::Path) -> CResult<()>;
}
