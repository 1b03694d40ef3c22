//! WAL record kinds and their 28-byte header layout, per §3.

use crc32fast::Hasher as Crc32Hasher;

pub const RECORD_HEADER_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    PageWrite = 1,
    PageAlloc = 2,
    PageInit = 3,
    Meta = 4,
    Commit = 5,
    Checkpoint = 6,
}

impl RecordKind {
    #[must_use]
    pub const fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::PageWrite),
            2 => Some(Self::PageAlloc),
            3 => Some(Self::PageInit),
            4 => Some(Self::Meta),
            5 => Some(Self::Commit),
            6 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalRecord {
    pub lsn: u64,
    pub kind: RecordKind,
    pub flags: u8,
    pub page_id: u32,
    /// The transaction this record belongs to, or 0 for ambient writes
    /// made outside any user transaction (catalog/DDL bookkeeping), which
    /// recovery always redoes. A `Commit` record's `txn_id` names the
    /// transaction recovery should treat every one of its page records as
    /// durable for.
    pub txn_id: u64,
    pub data: Vec<u8>,
}

impl WalRecord {
    /// Serializes the record as `header(28B) ‖ data ‖ zero-padding to an
    /// 8-byte boundary`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let data_len = u16::try_from(self.data.len()).unwrap_or(u16::MAX);
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[0..8].copy_from_slice(&self.lsn.to_le_bytes());
        header[8] = self.kind as u8;
        header[9] = self.flags;
        header[10..12].copy_from_slice(&data_len.to_le_bytes());
        header[12..16].copy_from_slice(&self.page_id.to_le_bytes());
        header[16..24].copy_from_slice(&self.txn_id.to_le_bytes());

        let mut hasher = Crc32Hasher::new();
        hasher.update(&header[0..24]);
        hasher.update(&self.data);
        let checksum = hasher.finalize();
        header[24..28].copy_from_slice(&checksum.to_le_bytes());

        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + self.data.len() + 8);
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.data);
        let unpadded = out.len();
        let padded = unpadded.div_ceil(8) * 8;
        out.resize(padded, 0);
        out
    }

    /// Parses one record starting at `buf[0]`; returns the record and the
    /// total encoded length (including padding) consumed.
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < RECORD_HEADER_SIZE {
            return None;
        }
        let lsn = u64::from_le_bytes(buf[0..8].try_into().ok()?);
        let kind = RecordKind::from_u8(buf[8])?;
        let flags = buf[9];
        let data_len = u16::from_le_bytes(buf[10..12].try_into().ok()?) as usize;
        let page_id = u32::from_le_bytes(buf[12..16].try_into().ok()?);
        let txn_id = u64::from_le_bytes(buf[16..24].try_into().ok()?);
        let stored_checksum = u32::from_le_bytes(buf[24..28].try_into().ok()?);
        let data_start = RECORD_HEADER_SIZE;
        let data_end = data_start.checked_add(data_len)?;
        if data_end > buf.len() {
            return None;
        }
        let data = buf[data_start..data_end].to_vec();

        let mut hasher = Crc32Hasher::new();
        hasher.update(&buf[0..24]);
        hasher.update(&data);
        if hasher.finalize() != stored_checksum {
            return None;
        }

        let unpadded = data_end;
        let padded = unpadded.div_ceil(8) * 8;
        Some((Self { lsn, kind, flags, page_id, txn_id, data }, padded))
    }
}
