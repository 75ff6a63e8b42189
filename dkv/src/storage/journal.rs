use std::collections::{BTreeMap, VecDeque};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs4::FileExt;

use crate::changes::ChangeRecord;
use crate::error::{CResult, Error};

/// How many records past the retention window may accumulate before the
/// journal is compacted. Compacting on every append would rewrite the file
/// each time.
fn compact_slack(retain: u64) -> u64 {
    std::cmp::max(retain / 4, 1)
}

/// The change journal: an ordered history of committed ChangeRecords.
///
/// The file variant persists records; the memory variant backs the in-memory
/// engine. A tagged enum keeps the store monomorphic over the pair.
pub enum Journal {
    File(FileJournal),
    Memory(MemJournal),
}

impl Journal {
    pub fn file(path: PathBuf, retain: u64) -> CResult<Self> {
        Ok(Journal::File(FileJournal::new(path, retain)?))
    }

    pub fn memory(retain: u64) -> Self {
        Journal::Memory(MemJournal::new(retain))
    }

    /// Appends a committed record and makes it durable. The record must
    /// extend the journal: its change number is the successor of latest().
    pub fn append(&mut self, record: &ChangeRecord) -> CResult<()> {
        match self {
            Journal::File(j) => j.append(record),
            Journal::Memory(j) => j.append(record),
        }
    }

    /// Returns up to max records with change numbers >= from, ascending.
    /// from = 0 starts at the earliest retained record. Fails with
    /// ChangesUnavailable when from lies below the retention floor.
    pub fn load(&mut self, from: u64, max: u32) -> CResult<Vec<ChangeRecord>> {
        match self {
            Journal::File(j) => j.load(from, max),
            Journal::Memory(j) => j.load(from, max),
        }
    }

    /// The change number of the last appended record, 0 if none.
    pub fn latest(&self) -> u64 {
        match self {
            Journal::File(j) => j.latest(),
            Journal::Memory(j) => j.latest(),
        }
    }

    /// The change number of the earliest retained record. latest() + 1 when
    /// the journal is empty (nothing retained, nothing missing).
    pub fn floor(&self) -> u64 {
        match self {
            Journal::File(j) => j.floor(),
            Journal::Memory(j) => j.floor(),
        }
    }

    pub fn backup_to(&mut self, path: &std::path::Path) -> CResult<()> {
        match self {
            Journal::File(j) => j.backup_to(path),
            Journal::Memory(j) => j.backup_to(path),
        }
    }

    pub fn restore_from(&mut self, path: &std::path::Path) -> CResult<()> {
        match self {
            Journal::File(j) => j.restore_from(path),
            Journal::Memory(j) => j.restore_from(path),
        }
    }
}

/// A journal backed by an append-only file of length-framed records:
///
/// - Record length as big-endian u32.
/// - The bincode-encoded ChangeRecord.
///
/// An in-memory index from change number to file position is rebuilt by
/// scanning the file on open; a partial trailing record is truncated away.
pub struct FileJournal {
    path: PathBuf,
    file: std::fs::File,

    /// Maps change numbers to a record position and length in the file.
    index: BTreeMap<u64, (u64, u32)>,

    /// Retention window, in records.
    retain: u64,
}

impl FileJournal {
    pub fn new(path: PathBuf, retain: u64) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            match std::fs::create_dir_all(dir) {
                Ok(_) => {}
                Err(err) => {
                    return Err(Error::Internal(format!("{}:{:?}", err, dir.to_str())))
                }
            }
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive()?;

        let mut journal = Self { path, file, index: BTreeMap::new(), retain };
        journal.index = journal.build_index()?;
        Ok(journal)
    }

    /// Rebuilds the change-number index by scanning the journal file,
    /// truncating a partial trailing record.
    fn build_index(&mut self) -> CResult<BTreeMap<u64, (u64, u32)>> {
        let mut len_buf = [0u8; 4];
        let mut index = BTreeMap::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);
        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            let mut result = || -> Result<(u64, u32), std::io::Error> {
                r.read_exact(&mut len_buf)?;
                let record_len = u32::from_be_bytes(len_buf);
                if pos + 4 + record_len as u64 > file_len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "record extends beyond end of file",
                    ));
                }
                let mut bytes = vec![0; record_len as usize];
                r.read_exact(&mut bytes)?;
                let record = ChangeRecord::decode(&bytes)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                Ok((record.change_number, record_len))
            };

            match result() {
                Ok((change_number, record_len)) => {
                    index.insert(change_number, (pos + 4, record_len));
                    pos += 4 + record_len as u64;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::error!("Found incomplete record at offset {}, truncating journal", pos);
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(index)
    }

    fn append(&mut self, record: &ChangeRecord) -> CResult<()> {
        let latest = self.latest();
        if latest != 0 && record.change_number != latest + 1 {
            return Err(Error::Internal(format!(
                "journal append out of order: latest {}, appending {}",
                latest, record.change_number
            )));
        }

        let bytes = record.encode()?;
        let record_len = bytes.len() as u32;

        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(4 + bytes.len(), &mut self.file);
        w.write_all(&record_len.to_be_bytes())?;
        w.write_all(&bytes)?;
        w.flush()?;
        drop(w);
        // The durable commit point: a write is only acknowledged once its
        // record has reached disk.
        self.file.sync_all()?;

        self.index.insert(record.change_number, (pos + 4, record_len));

        if self.retain > 0 && self.index.len() as u64 >= self.retain + compact_slack(self.retain) {
            self.compact()?;
        }
        Ok(())
    }

    fn read_record(&mut self, pos: u64, len: u32) -> CResult<ChangeRecord> {
        let mut bytes = vec![0; len as usize];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut bytes)?;
        ChangeRecord::decode(&bytes)
    }

    fn load(&mut self, from: u64, max: u32) -> CResult<Vec<ChangeRecord>> {
        let floor = self.floor();
        if from != 0 && from < floor {
            return Err(Error::ChangesUnavailable { from, floor });
        }
        let from = std::cmp::max(from, floor);

        let positions: Vec<(u64, u32)> =
            self.index.range(from..).take(max as usize).map(|(_, p)| *p).collect();
        let mut records = Vec::with_capacity(positions.len());
        for (pos, len) in positions {
            records.push(self.read_record(pos, len)?);
        }
        Ok(records)
    }

    fn latest(&self) -> u64 {
        self.index.keys().next_back().copied().unwrap_or(0)
    }

    fn floor(&self) -> u64 {
        self.index.keys().next().copied().unwrap_or_else(|| self.latest() + 1)
    }

    /// Rewrites the journal keeping only the newest retain records, then
    /// swaps the new file in.
    fn compact(&mut self) -> CResult<()> {
        let drop_below = match self.index.keys().rev().nth(self.retain as usize - 1) {
            Some(n) => *n,
            None => return Ok(()),
        };

        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("new");

        let keep: Vec<(u64, u32)> = self.index.range(drop_below..).map(|(_, p)| *p).collect();
        let mut records = Vec::with_capacity(keep.len());
        for (pos, len) in keep {
            records.push(self.read_record(pos, len)?);
        }

        let mut new_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&tmp_path)?;
        new_file.set_len(0)?;
        let mut new_index = BTreeMap::new();
        let mut pos = 0u64;
        {
            let mut w = BufWriter::new(&mut new_file);
            for record in &records {
                let bytes = record.encode()?;
                w.write_all(&(bytes.len() as u32).to_be_bytes())?;
                w.write_all(&bytes)?;
                new_index.insert(record.change_number, (pos + 4, bytes.len() as u32));
                pos += 4 + bytes.len() as u64;
            }
            w.flush()?;
        }
        new_file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;
        self.file = new_file;
        self.index = new_index;

        log::info!(
            "Compacted journal {} down to {} records (floor {})",
            self.path.display(),
            self.index.len(),
            self.floor()
        );
        Ok(())
    }

    fn backup_to(&mut self, path: &std::path::Path) -> CResult<()> {
        self.file.sync_all()?;
        if let Some(dir) = path.parent() {
            fs_extra::dir::create_all(dir, false)?;
        }
        let mut options = fs_extra::file::CopyOptions::new();
        options.overwrite = true;
        fs_extra::file::copy(&self.path, path, &options)?;
        Ok(())
    }

    fn restore_from(&mut self, path: &std::path::Path) -> CResult<()> {
        let bytes = std::fs::read(path)?;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        self.file.sync_all()?;
        self.index = self.build_index()?;
        Ok(())
    }
}

/// A journal held entirely in memory. Backs the memory engine; snapshots
/// serialize the retained records so even in-memory replicas can seed peers.
pub struct MemJournal {
    records: VecDeque<ChangeRecord>,
    retain: u64,
}

impl MemJournal {
    pub fn new(retain: u64) -> Self {
        MemJournal { records: VecDeque::new(), retain }
    }

    fn append(&mut self, record: &ChangeRecord) -> CResult<()> {
        let latest = self.latest();
        if latest != 0 && record.change_number != latest + 1 {
            return Err(Error::Internal(format!(
                "journal append out of order: latest {}, appending {}",
                latest, record.change_number
            )));
        }
        self.records.push_back(record.clone());
        while self.retain > 0 && self.records.len() as u64 > self.retain {
            self.records.pop_front();
        }
        Ok(())
    }

    fn load(&mut self, from: u64, max: u32) -> CResult<Vec<ChangeRecord>> {
        let floor = self.floor();
        if from != 0 && from < floor {
            return Err(Error::ChangesUnavailable { from, floor });
        }
        let from = std::cmp::max(from, floor);
        Ok(self
            .records
            .iter()
            .filter(|r| r.change_number >= from)
            .take(max as usize)
            .cloned()
            .collect())
    }

    fn latest(&self) -> u64 {
        self.records.back().map(|r| r.change_number).unwrap_or(0)
    }

    fn floor(&self) -> u64 {
        self.records.front().map(|r| r.change_number).unwrap_or_else(|| self.latest() + 1)
    }

    fn backup_to(&mut self, path: &std::path::Path) -> CResult<()> {
        let records: Vec<&ChangeRecord> = self.records.iter().collect();
        std::fs::write(path, bincode::serialize(&records)?)?;
        Ok(())
    }

    fn restore_from(&mut self, path: &std::path::Path) -> CResult<()> {
        let bytes = std::fs::read(path)?;
        let records: Vec<ChangeRecord> = bincode::deserialize(&bytes)?;
        self.records = records.into();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::TransactionRecord;

    fn record(n: u64) -> ChangeRecord {
        ChangeRecord::new(n, vec![TransactionRecord::put(format!("k{}", n).as_bytes(), vec![n as u8], 0)])
    }

    fn check_journal(journal: &mut Journal) -> CResult<()> {
        for n in 1..=6 {
            journal.append(&record(n))?;
        }
        assert_eq!(journal.latest(), 6);
        assert_eq!(journal.floor(), 1);

        // A dense ascending range.
        let loaded = journal.load(3, 2)?;
        assert_eq!(
            loaded.iter().map(|r| r.change_number).collect::<Vec<_>>(),
            vec![3, 4]
        );

        // from = 0 starts at the earliest retained record.
        assert_eq!(journal.load(0, 100)?.len(), 6);

        // A gap is rejected.
        assert_eq!(
            journal.append(&record(9)),
            Err(Error::Internal(
                "journal append out of order: latest 6, appending 9".to_string()
            ))
        );
        Ok(())
    }

    #[test]
    fn memory_journal() -> CResult<()> {
        check_journal(&mut Journal::memory(1024))
    }

    #[test]
    fn file_journal() -> CResult<()> {
        let path = tempdir::TempDir::new("demo")?.path().join("changes");
        check_journal(&mut Journal::file(path, 1024)?)
    }

    #[test]
    fn file_journal_reopen() -> CResult<()> {
        let dir = tempdir::TempDir::new("demo")?;
        let path = dir.path().join("changes");

        let mut journal = Journal::file(path.clone(), 1024)?;
        for n in 1..=4 {
            journal.append(&record(n))?;
        }
        drop(journal);

        let mut journal = Journal::file(path, 1024)?;
        assert_eq!(journal.latest(), 4);
        assert_eq!(journal.load(1, 100)?.len(), 4);
        Ok(())
    }

    #[test]
    fn file_journal_truncated_tail() -> CResult<()> {
        let dir = tempdir::TempDir::new("demo")?;
        let path = dir.path().join("changes");

        let mut journal = Journal::file(path.clone(), 1024)?;
        for n in 1..=3 {
            journal.append(&record(n))?;
        }
        drop(journal);

        // Chop two bytes off the last record.
        let len = std::fs::metadata(&path)?.len();
        let f = std::fs::OpenOptions::new().write(true).open(&path)?;
        f.set_len(len - 2)?;
        drop(f);

        let mut journal = Journal::file(path, 1024)?;
        assert_eq!(journal.latest(), 2);
        assert_eq!(journal.load(1, 100)?.len(), 2);
        Ok(())
    }

    #[test]
    fn retention_floor() -> CResult<()> {
        let mut journal = Journal::memory(4);
        for n in 1..=10 {
            journal.append(&record(n))?;
        }
        assert_eq!(journal.latest(), 10);
        assert_eq!(journal.floor(), 7);

        // Below the floor the caller must bootstrap instead.
        assert_eq!(
            journal.load(2, 100),
            Err(Error::ChangesUnavailable { from: 2, floor: 7 })
        );

        // from = 0 still works against the retained suffix.
        assert_eq!(
            journal.load(0, 100)?.iter().map(|r| r.change_number).collect::<Vec<_>>(),
            vec![7, 8, 9, 10]
        );
        Ok(())
    }

    #[test]
    fn file_retention_compacts() -> CResult<()> {
        let dir = tempdir::TempDir::new("demo")?;
        let path = dir.path().join("changes");

        let mut journal = Journal::file(path.clone(), 4)?;
        for n in 1..=12 {
            journal.append(&record(n))?;
        }
        assert!(journal.floor() > 1);
        let latest = journal.latest();
        assert_eq!(latest, 12);
        drop(journal);

        // Retention survives reopen.
        let mut journal = Journal::file(path, 4)?;
        assert_eq!(journal.latest(), latest);
        let records = journal.load(0, 100)?;
        let numbers: Vec<u64> = records.iter().map(|r| r.change_number).collect();
        assert_eq!(numbers.last(), Some(&12));
        for w in numbers.windows(2) {
            assert_eq!(w[1], w[0] + 1);
        }
        Ok(())
    }
}
