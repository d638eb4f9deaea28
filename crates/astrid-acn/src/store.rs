//! Append-only persistent store of relay-client agent records.
//!
//! On-disk format: a sequence of `uint32_be length || record_bytes` frames.
//! The file is replayed once at startup to rebuild the relay table; after
//! that it is write-only. A corrupt tail (truncated frame, undecodable
//! record) aborts loading with the byte offset; records acknowledged to a
//! client are never silently forgotten.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use astrid_crypto::AgentRecord;

use crate::error::AcnError;
use crate::proto::{decode_record, encode_record};

#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    file: File,
}

impl RecordStore {
    /// Open (creating if absent) the store at `path` and replay its
    /// contents. Returns the store handle and the records in append order.
    pub fn open(path: &Path) -> Result<(Self, Vec<AgentRecord>), AcnError> {
        let records = match File::open(path) {
            Ok(mut file) => replay(&mut file)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
            },
            records,
        ))
    }

    /// Append one record and flush it to disk.
    pub fn append(&mut self, record: &AgentRecord) -> Result<(), AcnError> {
        let bytes = encode_record(record);
        self.file.write_all(&(bytes.len() as u32).to_be_bytes())?;
        self.file.write_all(&bytes)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn replay(file: &mut File) -> Result<Vec<AgentRecord>, AcnError> {
    let mut records = Vec::new();
    let mut offset: u64 = 0;
    loop {
        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(file, &mut len_buf) {
            ReadOutcome::Eof => break,
            ReadOutcome::Partial(n) => {
                return Err(AcnError::CorruptStore {
                    offset,
                    reason: format!("truncated length prefix ({n} of 4 bytes)"),
                })
            }
            ReadOutcome::Full => {}
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        match read_exact_or_eof(file, &mut payload) {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Partial(_) => {
                return Err(AcnError::CorruptStore {
                    offset,
                    reason: format!("truncated record body (expected {len} bytes)"),
                })
            }
        }
        let record = decode_record(&payload).map_err(|e| AcnError::CorruptStore {
            offset,
            reason: e.to_string(),
        })?;
        records.push(record);
        offset += 4 + len as u64;
    }
    Ok(records)
}

enum ReadOutcome {
    Full,
    Eof,
    Partial(usize),
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial(filled)
                }
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return ReadOutcome::Partial(filled),
        }
    }
    ReadOutcome::Full
}

#[cfg(test)]
mod tests {
    use super::*;
    use astrid_crypto::{Crypto, Keypair, LedgerId};

    fn sample_record() -> AgentRecord {
        let agent = Crypto::generate(LedgerId::Ed25519);
        let peer = Keypair::generate_ed25519();
        AgentRecord::new_signed(&agent, &peer.public(), chrono::Duration::hours(1)).unwrap()
    }

    #[test]
    fn append_then_reload_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");

        let originals: Vec<AgentRecord> = (0..5).map(|_| sample_record()).collect();
        {
            let (mut store, loaded) = RecordStore::open(&path).unwrap();
            assert!(loaded.is_empty());
            for record in &originals {
                store.append(record).unwrap();
            }
        }
        let (_store, loaded) = RecordStore::open(&path).unwrap();
        assert_eq!(loaded, originals);
    }

    #[test]
    fn reopening_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");

        let first = sample_record();
        let second = sample_record();
        {
            let (mut store, _) = RecordStore::open(&path).unwrap();
            store.append(&first).unwrap();
        }
        {
            let (mut store, loaded) = RecordStore::open(&path).unwrap();
            assert_eq!(loaded, vec![first.clone()]);
            store.append(&second).unwrap();
        }
        let (_store, loaded) = RecordStore::open(&path).unwrap();
        assert_eq!(loaded, vec![first, second]);
    }

    #[test]
    fn truncated_tail_aborts_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");

        let record = sample_record();
        {
            let (mut store, _) = RecordStore::open(&path).unwrap();
            store.append(&record).unwrap();
            store.append(&record).unwrap();
        }
        // Chop a few bytes off the last frame.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let err = RecordStore::open(&path).unwrap_err();
        assert!(matches!(err, AcnError::CorruptStore { .. }), "got {err}");
    }

    #[test]
    fn garbage_tail_aborts_loading_with_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");

        let record = sample_record();
        let good_len;
        {
            let (mut store, _) = RecordStore::open(&path).unwrap();
            store.append(&record).unwrap();
            good_len = std::fs::metadata(&path).unwrap().len();
        }
        // Append a frame whose body is not a record.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&8u32.to_be_bytes()).unwrap();
        file.write_all(&[0xff; 8]).unwrap();
        drop(file);

        match RecordStore::open(&path).unwrap_err() {
            AcnError::CorruptStore { offset, .. } => assert_eq!(offset, good_len),
            other => panic!("expected CorruptStore, got {other}"),
        }
    }
}
