//! The write-ahead log: every data-page mutation is durable here before
//! the corresponding page is written to the data file (§3 invariant).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32Hasher;
use log::{debug, warn};

use super::record::{RecordKind, WalRecord};
use crate::errors::{MonoError, MonoResult};

pub const WAL_MAGIC: u32 = 0x5741_4C4D;
pub const WAL_VERSION: u16 = 1;
pub const WAL_HEADER_SIZE: usize = 32;

struct WalHeader {
    checkpoint_lsn: u64,
    file_size: u64,
}

impl WalHeader {
    fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&WAL_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
        buf[6..14].copy_from_slice(&self.checkpoint_lsn.to_le_bytes());
        buf[14..22].copy_from_slice(&self.file_size.to_le_bytes());
        let mut hasher = Crc32Hasher::new();
        hasher.update(&buf[0..24]);
        let checksum = hasher.finalize();
        buf[22..26].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; WAL_HEADER_SIZE]) -> MonoResult<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != WAL_MAGIC {
            return Err(MonoError::WalCorrupt { lsn: 0 });
        }
        let checkpoint_lsn = u64::from_le_bytes(buf[6..14].try_into().unwrap());
        let file_size = u64::from_le_bytes(buf[14..22].try_into().unwrap());
        let stored_checksum = u32::from_le_bytes(buf[22..26].try_into().unwrap());
        let mut hasher = Crc32Hasher::new();
        hasher.update(&buf[0..24]);
        if hasher.finalize() != stored_checksum {
            return Err(MonoError::WalCorrupt { lsn: 0 });
        }
        Ok(Self { checkpoint_lsn, file_size })
    }
}

/// Owns the WAL file. Single-writer: callers serialize access the same
/// way they serialize access to the [`crate::storage::pager::Pager`]
/// that owns this WAL.
pub struct Wal {
    file: File,
    path: PathBuf,
    next_lsn: u64,
    checkpoint_lsn: u64,
}

impl Wal {
    /// Opens an existing WAL file, or creates one with a fresh header if
    /// it does not exist.
    pub fn open(path: impl AsRef<Path>) -> MonoResult<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        if !existed || file.metadata()?.len() < WAL_HEADER_SIZE as u64 {
            let header = WalHeader { checkpoint_lsn: 0, file_size: WAL_HEADER_SIZE as u64 };
            file.set_len(0)?;
            file.write_all(&header.encode())?;
            file.sync_all()?;
            return Ok(Self { file, path, next_lsn: 1, checkpoint_lsn: 0 });
        }

        let mut header_bytes = [0u8; WAL_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_bytes)?;
        let header = WalHeader::decode(&header_bytes)?;

        let mut wal = Self { file, path, next_lsn: 1, checkpoint_lsn: header.checkpoint_lsn };
        let records = wal.read_all()?;
        wal.next_lsn = records.last().map_or(1, |r| r.lsn + 1);
        Ok(wal)
    }

    /// Appends a record and fsyncs before returning, so the caller may
    /// safely write the corresponding data page afterward. `txn_id` is 0
    /// for ambient writes outside any user transaction.
    pub fn append(&mut self, kind: RecordKind, txn_id: u64, page_id: u32, data: Vec<u8>) -> MonoResult<u64> {
        let lsn = self.next_lsn;
        let record = WalRecord { lsn, kind, flags: 0, page_id, txn_id, data };
        let bytes = record.to_bytes();
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        self.next_lsn += 1;
        debug!("wal: appended lsn={lsn} kind={kind:?} page_id={page_id}", kind = record.kind);
        Ok(lsn)
    }

    /// Reads every record currently in the log, in LSN order.
    pub fn read_all(&mut self) -> MonoResult<Vec<WalRecord>> {
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        let mut records = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            match WalRecord::parse(&buf[offset..]) {
                Some((record, consumed)) => {
                    offset += consumed;
                    records.push(record);
                }
                None => {
                    if offset != buf.len() {
                        warn!("wal: stopping replay at offset {offset}, trailing bytes unparsable");
                    }
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Persists a new checkpoint LSN into the header. Does not truncate
    /// already-applied records; callers may recreate the log file with
    /// `reset_after_checkpoint` once every page touched before the
    /// checkpoint is confirmed durable.
    pub fn checkpoint(&mut self, lsn: u64) -> MonoResult<()> {
        self.checkpoint_lsn = lsn;
        let file_size = self.file.metadata()?.len();
        let header = WalHeader { checkpoint_lsn: lsn, file_size };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        self.file.sync_all()?;
        Ok(())
    }

    #[must_use]
    pub const fn checkpoint_lsn(&self) -> u64 {
        self.checkpoint_lsn
    }

    /// Truncates the log back to a bare header, used after a checkpoint
    /// has confirmed every prior record is reflected in the data file.
    pub fn reset_after_checkpoint(&mut self) -> MonoResult<()> {
        let header = WalHeader { checkpoint_lsn: self.checkpoint_lsn, file_size: WAL_HEADER_SIZE as u64 };
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        self.file.sync_all()?;
        self.next_lsn = 1;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_replay_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = Wal::open(&path).unwrap();
        let lsn1 = wal.append(RecordKind::PageWrite, 9, 3, vec![1, 2, 3]).unwrap();
        let lsn2 = wal.append(RecordKind::Commit, 9, 0, vec![]).unwrap();
        assert_eq!(lsn1 + 1, lsn2);
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, vec![1, 2, 3]);
        assert_eq!(records[1].txn_id, 9);
    }

    #[test]
    fn reopen_resumes_lsn_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(RecordKind::PageWrite, 0, 1, vec![9]).unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        let lsn = wal.append(RecordKind::PageWrite, 0, 2, vec![8]).unwrap();
        assert_eq!(lsn, 2);
    }

    #[test]
    fn truncated_trailing_record_is_ignored_on_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(RecordKind::PageWrite, 0, 1, vec![1, 2, 3, 4]).unwrap();
        }
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 1).unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        let records = wal.read_all().unwrap();
        assert!(records.is_empty());
    }
}
