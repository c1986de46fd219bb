//! Commit journal and checkpoint image.
//!
//! ## Journal Record Format
//!
//! ```text
//! | length (4, LE) | CBOR-encoded JournalRecord (N) |
//! ```
//!
//! A record whose header or payload is cut short is treated as the clean end
//! of the log: it can only be the product of a crash mid-append. A record that
//! is complete but fails to decode is corruption and fails the open.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const LEN_SIZE: usize = 4;

/// One schema or data operation inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum JournalOp {
    Create { uri: String, config: String },
    Drop { uri: String },
    Put { uri: String, key: Vec<u8>, value: Vec<u8> },
    Remove { uri: String, key: Vec<u8> },
}

/// All operations of one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct JournalRecord {
    pub seq: u64,
    pub ops: Vec<JournalOp>,
}

/// Serialized form of every table at a checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CheckpointImage {
    pub commit_seq: u64,
    pub tables: BTreeMap<String, TableImage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct TableImage {
    pub config: String,
    pub rows: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Append-only commit journal.
#[derive(Debug)]
pub(crate) struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Opens or creates the journal, creating its directory if needed.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Appends one record. With `sync` the data is forced to disk.
    pub fn append(&mut self, record: &JournalRecord, sync: bool) -> EngineResult<()> {
        let mut payload = Vec::new();
        ciborium::ser::into_writer(record, &mut payload)
            .map_err(|e| EngineError::Corrupted(format!("journal encode: {e}")))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| EngineError::invalid_state("journal record too large"))?;

        let mut data = Vec::with_capacity(LEN_SIZE + payload.len());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        self.file.write_all(&data)?;
        self.file.flush()?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Reads every complete record.
    pub fn read_all(&self) -> EngineResult<Vec<JournalRecord>> {
        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset + LEN_SIZE <= data.len() {
            let mut len_bytes = [0u8; LEN_SIZE];
            len_bytes.copy_from_slice(&data[offset..offset + LEN_SIZE]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            let start = offset + LEN_SIZE;
            if start + len > data.len() {
                tracing::warn!(
                    path = %self.path.display(),
                    offset,
                    "truncated journal record, treating as end of log"
                );
                break;
            }
            let record: JournalRecord = ciborium::de::from_reader(&data[start..start + len])
                .map_err(|e| {
                    EngineError::Corrupted(format!("journal record at offset {offset}: {e}"))
                })?;
            records.push(record);
            offset = start + len;
        }
        Ok(records)
    }

    /// Forces appended records to disk.
    pub fn sync(&mut self) -> EngineResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Discards every record.
    pub fn truncate(&mut self) -> EngineResult<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Loads a checkpoint image, returning `None` if there is none yet.
pub(crate) fn load_checkpoint(path: &Path) -> EngineResult<Option<CheckpointImage>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    if data.is_empty() {
        return Ok(None);
    }
    let image = ciborium::de::from_reader(data.as_slice())
        .map_err(|e| EngineError::Corrupted(format!("checkpoint {}: {e}", path.display())))?;
    Ok(Some(image))
}

/// Writes a checkpoint image atomically (temp file, sync, rename).
pub(crate) fn save_checkpoint(path: &Path, image: &CheckpointImage) -> EngineResult<()> {
    let mut data = Vec::new();
    ciborium::ser::into_writer(image, &mut data)
        .map_err(|e| EngineError::Corrupted(format!("checkpoint encode: {e}")))?;

    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(seq: u64, key: &[u8]) -> JournalRecord {
        JournalRecord {
            seq,
            ops: vec![JournalOp::Put {
                uri: "table:t".into(),
                key: key.to_vec(),
                value: b"v".to_vec(),
            }],
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut journal = Journal::open(&dir.path().join("journal/kv.journal")).unwrap();
        journal.append(&put(1, b"a"), false).unwrap();
        journal.append(&put(2, b"b"), true).unwrap();

        let records = journal.read_all().unwrap();
        assert_eq!(records, vec![put(1, b"a"), put(2, b"b")]);
    }

    #[test]
    fn truncated_tail_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.journal");
        let mut journal = Journal::open(&path).unwrap();
        journal.append(&put(1, b"a"), false).unwrap();
        journal.append(&put(2, b"b"), false).unwrap();

        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let records = Journal::open(&path).unwrap().read_all().unwrap();
        assert_eq!(records, vec![put(1, b"a")]);
    }

    #[test]
    fn garbage_record_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.journal");
        let mut raw = 3u32.to_le_bytes().to_vec();
        raw.extend_from_slice(&[0xff, 0xff, 0xff]);
        fs::write(&path, raw).unwrap();

        let result = Journal::open(&path).unwrap().read_all();
        assert!(matches!(result, Err(EngineError::Corrupted(_))));
    }

    #[test]
    fn truncate_empties_journal() {
        let dir = TempDir::new().unwrap();
        let mut journal = Journal::open(&dir.path().join("kv.journal")).unwrap();
        journal.append(&put(1, b"a"), false).unwrap();
        journal.truncate().unwrap();
        assert!(journal.read_all().unwrap().is_empty());
        journal.append(&put(2, b"b"), false).unwrap();
        assert_eq!(journal.read_all().unwrap(), vec![put(2, b"b")]);
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.checkpoint");
        assert!(load_checkpoint(&path).unwrap().is_none());

        let mut image = CheckpointImage {
            commit_seq: 7,
            ..Default::default()
        };
        image.tables.insert(
            "table:t".into(),
            TableImage {
                config: "key_format=u".into(),
                rows: vec![(b"k".to_vec(), b"v".to_vec())],
            },
        );
        save_checkpoint(&path, &image).unwrap();

        let loaded = load_checkpoint(&path).unwrap().unwrap();
        assert_eq!(loaded.commit_seq, 7);
        assert_eq!(loaded.tables["table:t"].rows, image.tables["table:t"].rows);
    }
}
