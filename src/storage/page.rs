//! The fixed-size 4096-byte page: 24-byte header + 4072-byte payload,
//! checksummed with XOR-of-little-endian-u32-words (§3).

use crate::errors::{MonoError, MonoResult};
use crate::limits::{PAGE_HEADER_SIZE, PAGE_PAYLOAD_SIZE, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Free,
    Data,
    BTreeInternal,
    BTreeLeaf,
    Meta,
    Catalog,
}

impl PageType {
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Data => 1,
            Self::BTreeInternal => 2,
            Self::BTreeLeaf => 3,
            Self::Meta => 4,
            Self::Catalog => 5,
        }
    }

    #[must_use]
    pub const fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Free),
            1 => Some(Self::Data),
            2 => Some(Self::BTreeInternal),
            3 => Some(Self::BTreeLeaf),
            4 => Some(Self::Meta),
            5 => Some(Self::Catalog),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Page {
    pub page_id: u32,
    pub page_type: u8,
    pub flags: u8,
    pub item_count: u16,
    pub free_space: u16,
    pub next_page_id: u32,
    pub prev_page_id: u32,
    pub payload: Box<[u8; PAGE_PAYLOAD_SIZE]>,
}

impl Page {
    #[must_use]
    pub fn new(page_id: u32, page_type: PageType) -> Self {
        Self {
            page_id,
            page_type: page_type.to_u8(),
            flags: 0,
            item_count: 0,
            free_space: PAGE_PAYLOAD_SIZE as u16,
            next_page_id: 0,
            prev_page_id: 0,
            payload: Box::new([0u8; PAGE_PAYLOAD_SIZE]),
        }
    }

    /// XOR of the payload interpreted as little-endian u32 words; any
    /// trailing remainder (there is none at the current payload size,
    /// which is a multiple of 4) would be zero-padded before folding in.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let mut acc = 0u32;
        let mut chunks = self.payload.chunks_exact(4);
        for chunk in &mut chunks {
            acc ^= u32::from_le_bytes(chunk.try_into().unwrap());
        }
        let rem = chunks.remainder();
        if !rem.is_empty() {
            let mut buf = [0u8; 4];
            buf[..rem.len()].copy_from_slice(rem);
            acc ^= u32::from_le_bytes(buf);
        }
        acc
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; PAGE_SIZE] {
        let mut out = [0u8; PAGE_SIZE];
        out[0..4].copy_from_slice(&self.page_id.to_le_bytes());
        out[4] = self.page_type;
        out[5] = self.flags;
        out[6..8].copy_from_slice(&self.item_count.to_le_bytes());
        out[8..10].copy_from_slice(&self.free_space.to_le_bytes());
        out[10..14].copy_from_slice(&self.next_page_id.to_le_bytes());
        out[14..18].copy_from_slice(&self.prev_page_id.to_le_bytes());
        out[18..22].copy_from_slice(&self.compute_checksum().to_le_bytes());
        // out[22..24] reserved, left zero.
        out[PAGE_HEADER_SIZE..].copy_from_slice(self.payload.as_slice());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> MonoResult<Self> {
        if buf.len() < PAGE_SIZE {
            return Err(MonoError::InternalError("page buffer truncated".into()));
        }
        let page_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let page_type = buf[4];
        let flags = buf[5];
        let item_count = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        let free_space = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let next_page_id = u32::from_le_bytes(buf[10..14].try_into().unwrap());
        let prev_page_id = u32::from_le_bytes(buf[14..18].try_into().unwrap());
        let stored_checksum = u32::from_le_bytes(buf[18..22].try_into().unwrap());

        let mut payload = Box::new([0u8; PAGE_PAYLOAD_SIZE]);
        payload.copy_from_slice(&buf[PAGE_HEADER_SIZE..PAGE_SIZE]);

        let page =
            Self { page_id, page_type, flags, item_count, free_space, next_page_id, prev_page_id, payload };
        if page.compute_checksum() != stored_checksum {
            return Err(MonoError::ChecksumMismatch { page_id });
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_fields_and_checksum() {
        let mut page = Page::new(7, PageType::Data);
        page.payload[0..4].copy_from_slice(&[1, 2, 3, 4]);
        page.item_count = 2;
        let bytes = page.to_bytes();
        let back = Page::from_bytes(&bytes).unwrap();
        assert_eq!(back.page_id, 7);
        assert_eq!(back.item_count, 2);
        assert_eq!(&back.payload[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let page = Page::new(1, PageType::Data);
        let mut bytes = page.to_bytes();
        bytes[PAGE_HEADER_SIZE] ^= 0xFF;
        assert!(matches!(Page::from_bytes(&bytes), Err(MonoError::ChecksumMismatch { page_id: 1 })));
    }
}
