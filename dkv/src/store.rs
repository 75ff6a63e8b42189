use std::path::Path;

use crate::changes::{ChangeRecord, Mutation, Op};
use crate::error::{CResult, Error};
use crate::storage::cask::Cask;
use crate::storage::engine::Engine;
use crate::storage::journal::Journal;
use crate::storage::memory::Memory;
use crate::storage::{now_secs, Entry, Status};

/// File names inside a store directory (and inside a backup of one).
pub const DATA_FILE: &str = "data";
pub const CHANGES_FILE: &str = "changes";

/// Default retention window of the change journal, in records.
pub const DEFAULT_RETAIN_CHANGES: u64 = 65_536;

/// The master half of the replication seam: a source of committed changes.
pub trait ChangePropagator {
    /// The change number of the last durably committed record.
    fn latest_change_number(&self) -> u64;

    /// All committed changes with change numbers >= from, up to max, in
    /// ascending dense order. Fails with ChangesUnavailable when from is
    /// below the retained history.
    fn load_changes(&mut self, from: u64, max: u32) -> CResult<Vec<ChangeRecord>>;
}

/// The slave half of the replication seam: an applier of shipped changes.
pub trait ChangeApplier {
    /// Applies the records in order, each atomically, and returns the highest
    /// applied change number. Requires strict contiguity with the local
    /// history, rejecting anything else with NonContiguous.
    fn save_changes(&mut self, records: &[ChangeRecord]) -> CResult<u64>;
}

/// The key/value store: a storage engine plus the change journal that gives
/// every committed write batch a strictly monotonic, dense change number.
///
/// The store is the single writer for both files; read-only operations never
/// advance the change number.
pub struct Store<E: Engine> {
    engine: E,
    journal: Journal,

    /// The change number of the last committed record. Restored from the
    /// journal on open.
    sequence: u64,
}

impl Store<Cask> {
    /// Opens a disk-backed store under the given folder, creating
    /// `<dir>/data` and `<dir>/changes`.
    pub fn cask(dir: &Path, retain_changes: u64) -> CResult<Self> {
        let engine = Cask::new(dir.join(DATA_FILE))?;
        let journal = Journal::file(dir.join(CHANGES_FILE), retain_changes)?;
        Ok(Self::with_parts(engine, journal))
    }

    /// As cask(), but compacts the data log on open when the garbage ratio
    /// warrants it, and applies the configured copy buffer size.
    pub fn cask_compact(dir: &Path, retain_changes: u64, cache_size: usize) -> CResult<Self> {
        let mut engine = Cask::new_compact(dir.join(DATA_FILE), 0.2)?;
        engine.set_cache_size(cache_size);
        let journal = Journal::file(dir.join(CHANGES_FILE), retain_changes)?;
        Ok(Self::with_parts(engine, journal))
    }
}

impl Store<Memory> {
    /// An in-memory store, mostly for tests and ephemeral replicas.
    pub fn memory() -> Self {
        Self::with_parts(Memory::new(), Journal::memory(DEFAULT_RETAIN_CHANGES))
    }

    pub fn memory_with_retain(retain_changes: u64) -> Self {
        Self::with_parts(Memory::new(), Journal::memory(retain_changes))
    }
}

impl<E: Engine> Store<E> {
    pub fn with_parts(engine: E, journal: Journal) -> Self {
        let sequence = journal.latest();
        Store { engine, journal, sequence }
    }

    /// Writes a single key atomically. Returns the assigned change number.
    pub fn put(&mut self, key: &[u8], value: Vec<u8>) -> CResult<u64> {
        self.write_batch(vec![Mutation::put(key, value)])
    }

    /// Writes a single key with a time-to-live in seconds.
    pub fn put_with_ttl(&mut self, key: &[u8], value: Vec<u8>, ttl_secs: u64) -> CResult<u64> {
        self.write_batch(vec![Mutation::put_at(key, value, now_secs() + ttl_secs)])
    }

    /// Writes a single key with an absolute expiry (epoch seconds, 0 = none).
    pub fn put_at(&mut self, key: &[u8], value: Vec<u8>, expire_at: u64) -> CResult<u64> {
        self.write_batch(vec![Mutation::put_at(key, value, expire_at)])
    }

    /// Writes a tombstone atomically. Returns the assigned change number.
    pub fn delete(&mut self, key: &[u8]) -> CResult<u64> {
        self.write_batch(vec![Mutation::delete(key)])
    }

    /// Commits a batch of mutations as one atomic ChangeRecord: the batch
    /// gets one change number and a peer replays it all-or-nothing.
    pub fn write_batch(&mut self, mutations: Vec<Mutation>) -> CResult<u64> {
        if mutations.is_empty() {
            return Err(Error::InvalidRequest("empty write batch".to_string()));
        }
        let trxns = mutations.into_iter().map(Mutation::into_record).collect();
        let record = ChangeRecord::new(self.sequence + 1, trxns);

        self.apply_record(&record)?;
        self.journal.append(&record)?;
        self.sequence = record.change_number;
        Ok(self.sequence)
    }

    /// Replays a record's transactions against the engine and flushes once.
    fn apply_record(&mut self, record: &ChangeRecord) -> CResult<()> {
        for trxn in &record.trxns {
            match trxn.op {
                Op::Put => self
                    .engine
                    .set(&trxn.key, Entry::with_expiry(trxn.value.clone(), trxn.expire_at))?,
                Op::Delete => self.engine.delete(&trxn.key)?,
            }
        }
        self.engine.flush()
    }

    /// Gets a value. Keys whose expiry has passed read as absent.
    pub fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let now = now_secs();
        Ok(self.engine.get(key)?.filter(|e| !e.is_expired_at(now)).map(|e| e.value))
    }

    /// Gets one value per input key, in input order. Missing (or expired)
    /// keys yield an empty value, not an error.
    pub fn multi_get(&mut self, keys: &[Vec<u8>]) -> CResult<Vec<Vec<u8>>> {
        let now = now_secs();
        keys.iter()
            .map(|key| {
                Ok(self
                    .engine
                    .get(key)?
                    .filter(|e| !e.is_expired_at(now))
                    .map(|e| e.value)
                    .unwrap_or_default())
            })
            .collect()
    }

    /// Iterates over keys >= start_key in ascending lexicographic order,
    /// skipping expired entries. With a prefix, iteration halts at the first
    /// key not bearing it. The iterator holds the store's exclusive borrow,
    /// so it observes a consistent snapshot.
    pub fn iterate<'a>(&'a mut self, start_key: &[u8], key_prefix: Option<&[u8]>) -> Iterate<'a, E> {
        let mut start = start_key.to_vec();
        if let Some(prefix) = key_prefix {
            // Keys below the prefix range cannot match, skip straight to it.
            if prefix > start_key {
                start = prefix.to_vec();
            }
        }
        Iterate {
            inner: self.engine.scan(start..),
            prefix: key_prefix.map(|p| p.to_vec()),
            now: now_secs(),
            done: false,
        }
    }

    /// Writes a self-contained point-in-time snapshot (keyspace + retained
    /// journal) under the given directory.
    pub fn backup(&mut self, path: &Path) -> CResult<()> {
        std::fs::create_dir_all(path)?;
        self.engine.backup_to(&path.join(DATA_FILE))?;
        self.journal.backup_to(&path.join(CHANGES_FILE))?;
        log::info!("Backed up store to {}", path.display());
        Ok(())
    }

    /// Replaces the entire keyspace with the snapshot under the given
    /// directory. The restored store's latest change number is that of the
    /// snapshot source.
    pub fn restore(&mut self, path: &Path) -> CResult<()> {
        let data = path.join(DATA_FILE);
        let changes = path.join(CHANGES_FILE);
        if !data.is_file() || !changes.is_file() {
            return Err(Error::InvalidRequest(format!(
                "no snapshot at {}",
                path.display()
            )));
        }
        self.engine.restore_from(&data)?;
        self.journal.restore_from(&changes)?;
        self.sequence = self.journal.latest();
        log::info!(
            "Restored store from {}, latest change number {}",
            path.display(),
            self.sequence
        );
        Ok(())
    }

    pub fn status(&mut self) -> CResult<Status> {
        self.engine.status()
    }
}

impl<E: Engine> ChangePropagator for Store<E> {
    fn latest_change_number(&self) -> u64 {
        self.sequence
    }

    fn load_changes(&mut self, from: u64, max: u32) -> CResult<Vec<ChangeRecord>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        self.journal.load(from, max)
    }
}

impl<E: Engine> ChangeApplier for Store<E> {
    fn save_changes(&mut self, records: &[ChangeRecord]) -> CResult<u64> {
        if records.is_empty() {
            return Err(Error::InvalidRequest("empty change range".to_string()));
        }

        for record in records {
            let expected = self.sequence + 1;
            if record.change_number != expected {
                return Err(Error::NonContiguous { expected, got: record.change_number });
            }
            self.apply_record(record)?;
            self.journal.append(record)?;
            self.sequence = record.change_number;
        }
        Ok(self.sequence)
    }
}

/// The iterator returned by Store::iterate().
pub struct Iterate<'a, E: Engine + 'a> {
    inner: E::ScanIterator<'a>,
    prefix: Option<Vec<u8>>,
    now: u64,
    done: bool,
}

impl<'a, E: Engine> Iterator for Iterate<'a, E> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next() {
                None => return None,
                Some(Err(err)) => return Some(Err(err)),
                Some(Ok((key, entry))) => {
                    if let Some(prefix) = &self.prefix {
                        if !key.starts_with(prefix) {
                            self.done = true;
                            return None;
                        }
                    }
                    if entry.is_expired_at(self.now) {
                        continue;
                    }
                    return Some(Ok((key, entry.value)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collect(iter: Iterate<'_, Memory>) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        iter.collect()
    }

    #[test]
    /// Each get returns the value of the last put for that key.
    fn last_put_wins() -> CResult<()> {
        let mut s = Store::memory();
        for i in 0..20u8 {
            s.put(format!("key_{}", i).as_bytes(), vec![i])?;
        }
        s.put(b"key_3", vec![0xaa])?;

        for i in 0..20u8 {
            let expect = if i == 3 { vec![0xaa] } else { vec![i] };
            assert_eq!(s.get(format!("key_{}", i).as_bytes())?, Some(expect));
        }
        Ok(())
    }

    #[test]
    /// Get on a never-written key yields no value and no error; multi_get
    /// yields one (possibly empty) value per key in input order.
    fn multi_get_order() -> CResult<()> {
        let mut s = Store::memory();
        let mut keys = Vec::new();
        for i in 1..=10u8 {
            let key = format!("K_{}", i).into_bytes();
            s.put(&key, format!("V_{}", i).into_bytes())?;
            keys.push(key);
        }

        let values = s.multi_get(&keys)?;
        assert_eq!(
            values,
            (1..=10u8).map(|i| format!("V_{}", i).into_bytes()).collect::<Vec<_>>()
        );

        assert_eq!(s.get(b"never")?, None);
        keys.insert(5, b"missing".to_vec());
        let values = s.multi_get(&keys)?;
        assert_eq!(values.len(), 11);
        assert_eq!(values[5], Vec::<u8>::new());
        Ok(())
    }

    #[test]
    /// Iterate from a start key with a prefix yields exactly the prefixed
    /// suffix, including the start key itself.
    fn iterate_prefix() -> CResult<()> {
        let mut s = Store::memory();
        for group in ["aa_t", "bb_t", "cc_t"] {
            for i in 1..=5u8 {
                let key = format!("{}_{}", group, i).into_bytes();
                s.put(&key, key.clone())?;
            }
        }

        let items = collect(s.iterate(b"bb_t_2", Some(b"bb_t")))?;
        assert_eq!(
            items.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![
                b"bb_t_2".to_vec(),
                b"bb_t_3".to_vec(),
                b"bb_t_4".to_vec(),
                b"bb_t_5".to_vec()
            ]
        );

        // An empty start key with a prefix yields the whole prefix range.
        let items = collect(s.iterate(b"", Some(b"cc_t")))?;
        assert_eq!(items.len(), 5);

        // No prefix runs to the end of the keyspace.
        let items = collect(s.iterate(b"cc_t_4", None))?;
        assert_eq!(
            items.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"cc_t_4".to_vec(), b"cc_t_5".to_vec()]
        );
        Ok(())
    }

    #[test]
    /// LoadChanges returns dense ascending single-put records.
    fn load_changes_dense() -> CResult<()> {
        let mut s = Store::memory();
        s.put(b"seed", vec![0])?;
        let pre = s.latest_change_number();

        s.put(b"bb_1", vec![1])?;
        s.put(b"bb_2", vec![2])?;
        s.put(b"bb_3", vec![3])?;

        let records = s.load_changes(pre + 1, 8)?;
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.change_number, pre + 1 + i as u64);
            assert_eq!(record.trxns.len(), 1);
            assert_eq!(record.trxns[0].op, Op::Put);
            assert_eq!(record.trxns[0].key, format!("bb_{}", i + 1).into_bytes());
        }
        Ok(())
    }

    #[test]
    /// Read-only operations never advance the change number.
    fn reads_do_not_advance() -> CResult<()> {
        let mut s = Store::memory();
        s.put(b"a", vec![1])?;
        s.put(b"b", vec![2])?;

        let before = s.latest_change_number();
        s.get(b"a")?;
        s.multi_get(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])?;
        let _ = s.iterate(b"", None).collect::<CResult<Vec<_>>>()?;
        s.load_changes(1, 100)?;
        s.status()?;
        assert_eq!(s.latest_change_number(), before);
        Ok(())
    }

    #[test]
    /// A slave replaying a master's batched changes converges to the same
    /// keyspace, including deletes inside mixed batches.
    fn save_changes_replays_batches() -> CResult<()> {
        let mut master = Store::memory();
        for i in 1..=3u8 {
            master.put(format!("cc_{}", i).as_bytes(), vec![i])?;
        }
        for i in 1..=3u8 {
            master.write_batch(vec![
                Mutation::put(format!("dd_{}", i).as_bytes(), vec![0x10 + i]),
                Mutation::delete(format!("cc_{}", i).as_bytes()),
            ])?;
        }

        let mut slave = Store::memory();
        let records = master.load_changes(1, 100)?;
        let applied = slave.save_changes(&records)?;
        assert_eq!(applied, master.latest_change_number());

        for i in 1..=3u8 {
            assert_eq!(slave.get(format!("cc_{}", i).as_bytes())?, None);
            assert_eq!(slave.get(format!("dd_{}", i).as_bytes())?, Some(vec![0x10 + i]));
        }
        Ok(())
    }

    #[test]
    /// Replaying an already-applied range is rejected, as is a gapped one.
    fn save_changes_contiguity() -> CResult<()> {
        let mut master = Store::memory();
        master.put(b"a", vec![1])?;
        master.put(b"b", vec![2])?;

        let records = master.load_changes(1, 100)?;
        let mut slave = Store::memory();
        slave.save_changes(&records)?;

        // Idempotence by rejection: the same range fails.
        assert_eq!(
            slave.save_changes(&records),
            Err(Error::NonContiguous { expected: 3, got: 1 })
        );

        // A range starting beyond the local history fails too.
        let mut gapped = Store::memory();
        assert_eq!(
            gapped.save_changes(&records[1..]),
            Err(Error::NonContiguous { expected: 1, got: 2 })
        );
        Ok(())
    }

    #[test]
    /// Entries whose expiry has passed read as absent everywhere.
    fn expired_reads_absent() -> CResult<()> {
        let mut s = Store::memory();
        s.put_at(b"old", vec![1], 1)?;
        s.put(b"live", vec![2])?;
        s.put_at(b"later", vec![3], now_secs() + 3600)?;

        assert_eq!(s.get(b"old")?, None);
        assert_eq!(s.get(b"live")?, Some(vec![2]));
        assert_eq!(s.get(b"later")?, Some(vec![3]));

        assert_eq!(
            s.multi_get(&[b"old".to_vec(), b"live".to_vec()])?,
            vec![Vec::new(), vec![2]]
        );

        let items = s.iterate(b"", None).collect::<CResult<Vec<_>>>()?;
        assert_eq!(
            items.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"later".to_vec(), b"live".to_vec()]
        );
        Ok(())
    }

    #[test]
    /// Expiry replicates: a slave applying a TTL'd put sees it expire too.
    fn expiry_replicates() -> CResult<()> {
        let mut master = Store::memory();
        master.put_at(b"old", vec![1], 1)?;
        master.put(b"live", vec![2])?;

        let mut slave = Store::memory();
        slave.save_changes(&master.load_changes(1, 100)?)?;
        assert_eq!(slave.get(b"old")?, None);
        assert_eq!(slave.get(b"live")?, Some(vec![2]));
        Ok(())
    }

    #[test]
    /// Loading below the retention floor demands a bootstrap.
    fn load_below_floor() -> CResult<()> {
        let mut s = Store::memory_with_retain(4);
        for i in 0..10u8 {
            s.put(&[i], vec![i])?;
        }
        assert_eq!(
            s.load_changes(1, 100),
            Err(Error::ChangesUnavailable { from: 1, floor: 7 })
        );

        // from = 0 means "earliest retained".
        let records = s.load_changes(0, 100)?;
        assert_eq!(records.first().map(|r| r.change_number), Some(7));
        Ok(())
    }

    #[test]
    /// max = 0 loads nothing (metadata-only pulls).
    fn load_zero_max() -> CResult<()> {
        let mut s = Store::memory();
        s.put(b"a", vec![1])?;
        assert_eq!(s.load_changes(1, 0)?, Vec::new());
        Ok(())
    }

    #[test]
    /// Restore(Backup(store)) reproduces the keyspace and change number.
    fn backup_restore_roundtrip() -> CResult<()> {
        let dir = tempdir::TempDir::new("demo")?;
        let snap = dir.path().join("snap");

        let mut source = Store::cask(&dir.path().join("source"), 1024)?;
        source.put(b"a", vec![1])?;
        source.put_at(b"t", vec![2], now_secs() + 3600)?;
        source.delete(b"a")?;
        source.put(b"b", vec![3])?;
        source.backup(&snap)?;

        let mut target = Store::cask(&dir.path().join("target"), 1024)?;
        target.put(b"junk", vec![9])?;
        target.restore(&snap)?;

        assert_eq!(target.latest_change_number(), source.latest_change_number());
        assert_eq!(target.get(b"junk")?, None);
        assert_eq!(target.get(b"a")?, None);
        assert_eq!(target.get(b"b")?, Some(vec![3]));
        assert_eq!(target.get(b"t")?, Some(vec![2]));

        // The restored journal keeps serving the same change stream.
        assert_eq!(
            source.load_changes(0, 100)?,
            target.load_changes(0, 100)?
        );
        Ok(())
    }

    #[test]
    /// Restoring from a missing snapshot is a terminal request error.
    fn restore_missing_snapshot() -> CResult<()> {
        let dir = tempdir::TempDir::new("demo")?;
        let mut s = Store::cask(&dir.path().join("db"), 1024)?;
        assert!(matches!(
            s.restore(&dir.path().join("nope")),
            Err(Error::InvalidRequest(_))
        ));
        Ok(())
    }

    #[test]
    /// The sequence survives reopen of a disk store.
    fn reopen_keeps_sequence() -> CResult<()> {
        let dir = tempdir::TempDir::new("demo")?;
        let path = dir.path().join("db");

        let mut s = Store::cask(&path, 1024)?;
        s.put(b"a", vec![1])?;
        s.put(b"b", vec![2])?;
        let latest = s.latest_change_number();
        drop(s);

        let mut s = Store::cask(&path, 1024)?;
        assert_eq!(s.latest_change_number(), latest);
        assert_eq!(s.get(b"b")?, Some(vec![2]));
        s.put(b"c", vec![3])?;
        assert_eq!(s.latest_change_number(), latest + 1);
        Ok(())
    }

    #[test]
    /// An empty write batch is rejected outright.
    fn empty_batch_invalid() {
        let mut s = Store::memory();
        assert!(matches!(
            s.write_batch(Vec::new()),
            Err(Error::InvalidRequest(_))
        ));
    }
}
