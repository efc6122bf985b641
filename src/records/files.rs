//! Record files on disk.
//!
//! One file per record at `<root>/<tag>/<uuid>.rec`:
//!
//! ```text
//! magic "OBJ\0" | version u8 | tag i32 | id [u8; 16] | len u64 | payload | crc32
//! ```
//!
//! The payload is the MessagePack encoding of a [`StoredRecord`].

use super::record::StoredRecord;
use crate::error::{Result, StoreError};
use crate::types::{Digest, ObjectId, ObjectKey, TypeTag};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Magic bytes for record files.
const RECORD_MAGIC: &[u8; 4] = b"OBJ\0";

/// Current record format version.
const RECORD_VERSION: u8 = 1;

const RECORD_EXT: &str = "rec";

/// Bytes before the payload: magic, version, tag, id and length.
const HEADER_LEN: u64 = 4 + 1 + 4 + 16 + 8;

const CHECKSUM_LEN: u64 = 4;

/// A decoded record and the digest of its payload.
#[derive(Clone, Debug)]
pub struct LoadedRecord {
    pub record: StoredRecord,
    pub digest: Digest,
}

/// Result of [`RecordFiles::write`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    pub digest: Digest,
    /// False when the payload matched `unless` and nothing was written.
    pub written: bool,
}

/// File-per-record storage with an LRU of decoded records.
pub struct RecordFiles {
    path: PathBuf,
    cache: Mutex<LruCache<ObjectKey, LoadedRecord>>,
}

impl RecordFiles {
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Encode and write a record, replacing any previous file for its key.
    ///
    /// When `unless` equals the digest of the new payload the write is skipped.
    pub fn write(&self, record: &StoredRecord, unless: Option<Digest>) -> Result<WriteOutcome> {
        let key = record.key();
        let payload = record.encode()?;
        let digest = Digest::from_bytes(&payload);

        if unless == Some(digest) && self.record_path(key).exists() {
            return Ok(WriteOutcome {
                digest,
                written: false,
            });
        }

        fs::create_dir_all(self.tag_path(key.tag))?;

        let final_path = self.record_path(key);
        let tmp_path = final_path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;

            file.write_all(RECORD_MAGIC)?;
            file.write_all(&[RECORD_VERSION])?;
            file.write_all(&key.tag.to_le_bytes())?;
            file.write_all(key.id.0.as_bytes())?;

            file.write_all(&(payload.len() as u64).to_le_bytes())?;
            file.write_all(&payload)?;

            let checksum = crc32fast::hash(&payload);
            file.write_all(&checksum.to_le_bytes())?;

            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        self.cache.lock().put(
            key,
            LoadedRecord {
                record: record.clone(),
                digest,
            },
        );

        Ok(WriteOutcome {
            digest,
            written: true,
        })
    }

    /// Read a record. `Ok(None)` if no file exists for `key`.
    pub fn read(&self, key: ObjectKey) -> Result<Option<LoadedRecord>> {
        if let Some(cached) = self.cache.lock().get(&key).cloned() {
            return Ok(Some(cached));
        }

        let mut file = match File::open(self.record_path(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != RECORD_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid record magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != RECORD_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported record version: {}",
                version[0]
            )));
        }

        let mut tag_bytes = [0u8; 4];
        file.read_exact(&mut tag_bytes)?;
        let mut id_bytes = [0u8; 16];
        file.read_exact(&mut id_bytes)?;
        let found = ObjectKey::new(
            TypeTag::from_le_bytes(tag_bytes),
            ObjectId(Uuid::from_bytes(id_bytes)),
        );
        if found != key {
            return Err(StoreError::KeyMismatch {
                expected: key,
                found,
            });
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);

        let available = file
            .metadata()?
            .len()
            .saturating_sub(HEADER_LEN + CHECKSUM_LEN);
        if len > available {
            return Err(StoreError::Corruption(format!(
                "record {key} declares {len} payload bytes but the file holds {available}"
            )));
        }

        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&payload);
        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let record = StoredRecord::decode(&payload)?;
        if record.key() != key {
            return Err(StoreError::KeyMismatch {
                expected: key,
                found: record.key(),
            });
        }

        let loaded = LoadedRecord {
            record,
            digest: Digest::from_bytes(&payload),
        };
        self.cache.lock().put(key, loaded.clone());

        Ok(Some(loaded))
    }

    pub fn exists(&self, key: ObjectKey) -> bool {
        if self.cache.lock().contains(&key) {
            return true;
        }
        self.record_path(key).exists()
    }

    /// Remove a record file. Returns false if there was none.
    pub fn remove(&self, key: ObjectKey) -> Result<bool> {
        self.cache.lock().pop(&key);

        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys of every record on disk.
    pub fn list(&self) -> Result<Vec<ObjectKey>> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name();
            let Ok(tag) = dir_name.to_string_lossy().parse::<i32>() else {
                continue;
            };

            for record_entry in fs::read_dir(entry.path())? {
                let record_path = record_entry?.path();
                if record_path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                    continue;
                }
                let stem = record_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if let Ok(id) = ObjectId::parse(&stem) {
                    keys.push(ObjectKey::new(TypeTag(tag), id));
                }
            }
        }

        Ok(keys)
    }

    fn tag_path(&self, tag: TypeTag) -> PathBuf {
        self.path.join(tag.0.to_string())
    }

    fn record_path(&self, key: ObjectKey) -> PathBuf {
        self.tag_path(key.tag)
            .join(format!("{}.{}", key.id, RECORD_EXT))
    }
}
