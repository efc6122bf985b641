//! Commit journal for staged commits.
//!
//! In journaled mode a whole commit batch is written here before any record
//! file is touched. Once every record of the batch is applied a commit marker
//! follows. A batch that failed to apply gets an abandon marker instead. A
//! batch without either marker is replayed when the store is reopened.

use crate::error::{Result, StoreError};
use crate::records::StoredRecord;
use crate::types::{ObjectKey, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"JRN\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Journal entry status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalStatus {
    /// Batch logged but not yet fully applied.
    Pending,
    /// Batch fully applied to the record files.
    Committed,
    /// Applying the batch failed; it must never be replayed.
    Abandoned,
}

/// One step of a commit batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Write a record, replacing any existing one.
    Put(StoredRecord),
    /// Remove a record.
    Remove(ObjectKey),
}

impl JournalOp {
    pub fn key(&self) -> ObjectKey {
        match self {
            JournalOp::Put(record) => record.key(),
            JournalOp::Remove(key) => *key,
        }
    }
}

/// A single journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub status: JournalStatus,
    /// Empty for commit markers.
    pub batch: Vec<JournalOp>,
    pub timestamp: Timestamp,
}

pub struct CommitJournal {
    path: PathBuf,
    next_seq: Mutex<u64>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl CommitJournal {
    /// Create or open a journal file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (next_seq, writer) = if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let mut reader = BufReader::new(&file);
            Self::read_header(&mut reader)?;

            let mut max_seq = 0u64;
            let mut valid_end = HEADER_LEN;
            while let Ok((entry, size)) = Self::read_entry(&mut reader) {
                max_seq = max_seq.max(entry.seq);
                valid_end += size;
            }

            // Drop a torn tail so new entries stay readable.
            if file.metadata()?.len() > valid_end {
                tracing::warn!(
                    path = %path.display(),
                    valid_end,
                    "truncating torn journal tail"
                );
                file.set_len(valid_end)?;
                file.sync_all()?;
            }

            let file = OpenOptions::new().append(true).open(&path)?;
            (max_seq + 1, Some(BufWriter::new(file)))
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;

            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;

            (1, Some(BufWriter::new(file)))
        };

        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(writer),
        })
    }

    /// Durably log a batch as pending. Returns its sequence number.
    pub fn log(&self, batch: Vec<JournalOp>) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;
        *next_seq += 1;

        self.append(&JournalEntry {
            seq,
            status: JournalStatus::Pending,
            batch,
            timestamp: Timestamp::now(),
        })?;

        Ok(seq)
    }

    /// Mark a batch as fully applied.
    pub fn commit(&self, seq: u64) -> Result<()> {
        self.append(&JournalEntry {
            seq,
            status: JournalStatus::Committed,
            batch: Vec::new(),
            timestamp: Timestamp::now(),
        })
    }

    /// Mark a batch as given up.
    pub fn abandon(&self, seq: u64) -> Result<()> {
        self.append(&JournalEntry {
            seq,
            status: JournalStatus::Abandoned,
            batch: Vec::new(),
            timestamp: Timestamp::now(),
        })
    }

    /// Batches logged without a commit or abandon marker, oldest first.
    pub fn pending(&self) -> Result<Vec<JournalEntry>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(HEADER_LEN))?;

        let mut reader = BufReader::new(file);
        let mut entries = BTreeMap::new();
        let mut closed = HashSet::new();

        // A torn tail ends the scan.
        while let Ok((entry, _)) = Self::read_entry(&mut reader) {
            match entry.status {
                JournalStatus::Committed | JournalStatus::Abandoned => {
                    closed.insert(entry.seq);
                }
                JournalStatus::Pending => {
                    entries.insert(entry.seq, entry);
                }
            }
        }

        Ok(entries
            .into_values()
            .filter(|entry| !closed.contains(&entry.seq))
            .collect())
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.pending()?.is_empty())
    }

    /// Truncate the journal back to its header.
    pub fn clear(&self) -> Result<()> {
        let mut next_seq = self.next_seq.lock();
        let mut writer = self.writer.lock();
        *writer = None;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;

        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;

        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));

        *next_seq = 1;

        Ok(())
    }

    fn append(&self, entry: &JournalEntry) -> Result<()> {
        let mut writer = self.writer.lock();
        let w = writer
            .as_mut()
            .ok_or_else(|| StoreError::InvalidOperation("journal is closed".into()))?;

        let encoded = rmp_serde::to_vec(entry)?;
        w.write_all(&(encoded.len() as u32).to_le_bytes())?;
        w.write_all(&encoded)?;
        w.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;

        w.flush()?;
        w.get_ref().sync_all()?;
        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    /// Next entry and its size on disk.
    fn read_entry(reader: &mut impl Read) -> Result<(JournalEntry, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > 256 * 1024 * 1024 {
            return Err(StoreError::Corruption("journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok((entry, (len + 8) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectId, TypeTag, Value};
    use tempfile::TempDir;

    fn put(name: &str) -> JournalOp {
        JournalOp::Put(StoredRecord {
            tag: TypeTag(1),
            id: ObjectId::new(),
            fields: vec![("name".to_string(), Value::Text(name.into()))],
            references: vec![],
            associations: vec![],
        })
    }

    #[test]
    fn test_log_and_commit() {
        let dir = TempDir::new().unwrap();
        let journal = CommitJournal::open(dir.path().join("commit.journal")).unwrap();

        let seq = journal.log(vec![put("a"), put("b")]).unwrap();
        assert_eq!(seq, 1);

        let pending = journal.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].batch.len(), 2);

        journal.commit(seq).unwrap();
        assert!(!journal.has_pending().unwrap());
    }

    #[test]
    fn test_pending_in_sequence_order() {
        let dir = TempDir::new().unwrap();
        let journal = CommitJournal::open(dir.path().join("commit.journal")).unwrap();

        let first = journal.log(vec![put("a")]).unwrap();
        let second = journal.log(vec![put("b")]).unwrap();
        let third = journal.log(vec![put("c")]).unwrap();
        journal.commit(second).unwrap();

        let seqs: Vec<_> = journal.pending().unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![first, third]);
    }

    #[test]
    fn test_pending_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commit.journal");
        let key = ObjectKey::new(TypeTag(2), ObjectId::new());

        {
            let journal = CommitJournal::open(&path).unwrap();
            journal.log(vec![put("a"), JournalOp::Remove(key)]).unwrap();
        }

        let journal = CommitJournal::open(&path).unwrap();
        let pending = journal.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].batch[1], JournalOp::Remove(key));

        let next = journal.log(vec![]).unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn test_abandoned_batch_is_not_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commit.journal");

        {
            let journal = CommitJournal::open(&path).unwrap();
            let failed = journal.log(vec![put("a")]).unwrap();
            journal.abandon(failed).unwrap();
            let open = journal.log(vec![put("b")]).unwrap();
            assert_eq!(open, failed + 1);
        }

        let journal = CommitJournal::open(&path).unwrap();
        let pending = journal.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, 2);
    }

    #[test]
    fn test_clear_resets_sequence() {
        let dir = TempDir::new().unwrap();
        let journal = CommitJournal::open(dir.path().join("commit.journal")).unwrap();

        journal.log(vec![put("a")]).unwrap();
        assert!(journal.has_pending().unwrap());

        journal.clear().unwrap();
        assert!(!journal.has_pending().unwrap());
        assert_eq!(journal.log(vec![put("b")]).unwrap(), 1);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commit.journal");

        {
            let journal = CommitJournal::open(&path).unwrap();
            journal.log(vec![put("a")]).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xFF, 0x00, 0x00]).unwrap();
        }

        let journal = CommitJournal::open(&path).unwrap();
        assert_eq!(journal.pending().unwrap().len(), 1);

        let seq = journal.log(vec![put("b")]).unwrap();
        journal.commit(seq).unwrap();
        assert_eq!(journal.pending().unwrap().len(), 1);
    }
}
