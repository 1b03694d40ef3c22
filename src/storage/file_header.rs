//! The 64-byte header at offset 0 of the data file, per §3.

use crate::errors::{MonoError, MonoResult};
use crate::limits::{FILE_HEADER_SIZE, PAGE_SIZE};

pub const FILE_MAGIC: u32 = 0x4D4F_4E4F;
pub const FILE_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy)]
pub struct FileHeader {
    pub page_count: u32,
    pub free_list_head: u32,
    pub meta_page_id: u32,
    pub catalog_page_id: u32,
    pub create_time: i64,
    pub modify_time: i64,
}

impl FileHeader {
    #[must_use]
    pub fn new(now_ms: i64) -> Self {
        Self {
            page_count: 0,
            free_list_head: 0,
            meta_page_id: 0,
            catalog_page_id: 0,
            create_time: now_ms,
            modify_time: now_ms,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&FILE_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&(PAGE_SIZE as u16).to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.free_list_head.to_le_bytes());
        buf[16..20].copy_from_slice(&self.meta_page_id.to_le_bytes());
        buf[20..24].copy_from_slice(&self.catalog_page_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.create_time.to_le_bytes());
        buf[32..40].copy_from_slice(&self.modify_time.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> MonoResult<Self> {
        if buf.len() < FILE_HEADER_SIZE {
            return Err(MonoError::InternalError("file header truncated".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != FILE_MAGIC {
            return Err(MonoError::InternalError("bad data file magic".into()));
        }
        let page_size = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        if page_size as usize != PAGE_SIZE {
            return Err(MonoError::InternalError("unexpected page size in file header".into()));
        }
        Ok(Self {
            page_count: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            free_list_head: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            meta_page_id: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            catalog_page_id: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            create_time: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
            modify_time: i64::from_le_bytes(buf[32..40].try_into().unwrap()),
        })
    }
}
