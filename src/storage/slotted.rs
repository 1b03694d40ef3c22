//! Slotted page layout: records grow from the low end of the payload,
//! the slot directory grows from the high end, and a 2-byte in-payload
//! prefix tracks how many record bytes are currently used (§3).
//!
//! `RecordId` (pageId, slotIndex) stays stable across `updateRecord`;
//! only `compact` renumbers slots.

use std::collections::HashMap;

use super::page::{Page, PageType};
use crate::errors::{MonoError, MonoResult};
use crate::limits::PAGE_PAYLOAD_SIZE;

const DATA_USED_PREFIX: usize = 2;
const SLOT_SIZE: usize = 6;
const TOMBSTONE_FLAG: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub page_id: u32,
    pub slot_index: u16,
}

struct Slot {
    offset: u16,
    length: u16,
    flags: u16,
}

/// A view over a [`Page`]'s payload as a slotted record store.
pub struct SlottedPage<'p> {
    page: &'p mut Page,
}

impl<'p> SlottedPage<'p> {
    #[must_use]
    pub fn new(page: &'p mut Page) -> Self {
        Self { page }
    }

    /// Initializes a freshly allocated data page's slotted layout.
    pub fn init(page: &mut Page) {
        page.payload[0..DATA_USED_PREFIX].copy_from_slice(&0u16.to_le_bytes());
        page.item_count = 0;
        page.free_space = Self::data_capacity() as u16;
    }

    fn data_capacity() -> usize {
        PAGE_PAYLOAD_SIZE - DATA_USED_PREFIX
    }

    fn data_used(&self) -> usize {
        u16::from_le_bytes(self.page.payload[0..2].try_into().unwrap()) as usize
    }

    fn set_data_used(&mut self, used: usize) {
        self.page.payload[0..2].copy_from_slice(&(used as u16).to_le_bytes());
    }

    fn slot_count(&self) -> usize {
        self.page.item_count as usize
    }

    fn slot_dir_offset(&self, index: usize) -> usize {
        PAGE_PAYLOAD_SIZE - (index + 1) * SLOT_SIZE
    }

    fn read_slot(&self, index: usize) -> Slot {
        let at = self.slot_dir_offset(index);
        let bytes = &self.page.payload[at..at + SLOT_SIZE];
        Slot {
            offset: u16::from_le_bytes(bytes[0..2].try_into().unwrap()),
            length: u16::from_le_bytes(bytes[2..4].try_into().unwrap()),
            flags: u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
        }
    }

    fn write_slot(&mut self, index: usize, slot: &Slot) {
        let at = self.slot_dir_offset(index);
        self.page.payload[at..at + 2].copy_from_slice(&slot.offset.to_le_bytes());
        self.page.payload[at + 2..at + 4].copy_from_slice(&slot.length.to_le_bytes());
        self.page.payload[at + 4..at + 6].copy_from_slice(&slot.flags.to_le_bytes());
    }

    fn free_space(&self) -> usize {
        let dir_start = PAGE_PAYLOAD_SIZE - self.slot_count() * SLOT_SIZE;
        let data_end = DATA_USED_PREFIX + self.data_used();
        dir_start.saturating_sub(data_end)
    }

    fn refresh_header_free_space(&mut self) {
        self.page.free_space = self.free_space() as u16;
    }

    /// Appends a new record, returning its stable slot index.
    pub fn insert_record(&mut self, data: &[u8]) -> MonoResult<u16> {
        if data.len() > u16::MAX as usize {
            return Err(MonoError::InternalError("record exceeds page slot capacity".into()));
        }
        if self.free_space() < data.len() + SLOT_SIZE {
            return Err(MonoError::InternalError("page out of space".into()));
        }
        let offset = DATA_USED_PREFIX + self.data_used();
        self.page.payload[offset..offset + data.len()].copy_from_slice(data);
        let new_used = self.data_used() + data.len();
        self.set_data_used(new_used);

        let slot_index = self.slot_count();
        self.page.item_count += 1;
        self.write_slot(
            slot_index,
            &Slot { offset: offset as u16, length: data.len() as u16, flags: 0 },
        );
        self.refresh_header_free_space();
        Ok(slot_index as u16)
    }

    pub fn read_record(&self, slot_index: u16) -> Option<&[u8]> {
        if slot_index as usize >= self.slot_count() {
            return None;
        }
        let slot = self.read_slot(slot_index as usize);
        if slot.flags & TOMBSTONE_FLAG != 0 {
            return None;
        }
        let start = slot.offset as usize;
        let end = start + slot.length as usize;
        Some(&self.page.payload[start..end])
    }

    /// Updates a record's body in place when it fits in its current
    /// slot, or relocates the bytes within the page otherwise. The slot
    /// index — and therefore the `RecordId` — never changes.
    pub fn update_record(&mut self, slot_index: u16, data: &[u8]) -> MonoResult<()> {
        if slot_index as usize >= self.slot_count() {
            return Err(MonoError::InternalError("slot index out of range".into()));
        }
        let mut slot = self.read_slot(slot_index as usize);
        if slot.flags & TOMBSTONE_FLAG != 0 {
            return Err(MonoError::InternalError("cannot update a deleted slot".into()));
        }
        if data.len() <= slot.length as usize {
            let start = slot.offset as usize;
            self.page.payload[start..start + data.len()].copy_from_slice(data);
            slot.length = data.len() as u16;
            self.write_slot(slot_index as usize, &slot);
            self.refresh_header_free_space();
            return Ok(());
        }
        if self.free_space() < data.len() {
            return Err(MonoError::InternalError("page out of space for record growth".into()));
        }
        let new_offset = DATA_USED_PREFIX + self.data_used();
        self.page.payload[new_offset..new_offset + data.len()].copy_from_slice(data);
        self.set_data_used(self.data_used() + data.len());
        slot.offset = new_offset as u16;
        slot.length = data.len() as u16;
        self.write_slot(slot_index as usize, &slot);
        self.refresh_header_free_space();
        Ok(())
    }

    /// Tombstones a slot; `itemCount` is never decremented here.
    pub fn delete_record(&mut self, slot_index: u16) -> MonoResult<()> {
        if slot_index as usize >= self.slot_count() {
            return Err(MonoError::InternalError("slot index out of range".into()));
        }
        let mut slot = self.read_slot(slot_index as usize);
        slot.flags |= TOMBSTONE_FLAG;
        self.write_slot(slot_index as usize, &slot);
        Ok(())
    }

    #[must_use]
    pub fn live_count(&self) -> u16 {
        (0..self.slot_count()).filter(|&i| self.read_slot(i).flags & TOMBSTONE_FLAG == 0).count() as u16
    }

    /// Repacks live records contiguously from the low end and rebuilds
    /// the slot directory without tombstones, returning the map from old
    /// to new slot index for every surviving record.
    pub fn compact(&mut self) -> HashMap<u16, u16> {
        let mut survivors = Vec::new();
        for i in 0..self.slot_count() {
            let slot = self.read_slot(i);
            if slot.flags & TOMBSTONE_FLAG == 0 {
                let start = slot.offset as usize;
                let end = start + slot.length as usize;
                survivors.push((i as u16, self.page.payload[start..end].to_vec()));
            }
        }

        let mut mapping = HashMap::with_capacity(survivors.len());
        let mut cursor = DATA_USED_PREFIX;
        let mut rebuilt = vec![0u8; PAGE_PAYLOAD_SIZE];
        rebuilt[0..DATA_USED_PREFIX].copy_from_slice(&self.page.payload[0..DATA_USED_PREFIX]);

        for (new_index, (old_index, bytes)) in survivors.iter().enumerate() {
            rebuilt[cursor..cursor + bytes.len()].copy_from_slice(bytes);
            let slot_at = PAGE_PAYLOAD_SIZE - (new_index + 1) * SLOT_SIZE;
            rebuilt[slot_at..slot_at + 2].copy_from_slice(&(cursor as u16).to_le_bytes());
            rebuilt[slot_at + 2..slot_at + 4].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
            rebuilt[slot_at + 4..slot_at + 6].copy_from_slice(&0u16.to_le_bytes());
            mapping.insert(*old_index, new_index as u16);
            cursor += bytes.len();
        }

        self.page.payload.copy_from_slice(&rebuilt);
        self.page.item_count = survivors.len() as u16;
        self.set_data_used(cursor - DATA_USED_PREFIX);
        self.refresh_header_free_space();
        mapping
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (u16, &[u8])> {
        (0..self.slot_count()).filter_map(move |i| {
            let slot = self.read_slot(i);
            if slot.flags & TOMBSTONE_FLAG != 0 {
                return None;
            }
            let start = slot.offset as usize;
            let end = start + slot.length as usize;
            Some((i as u16, &self.page.payload[start..end]))
        })
    }
}

#[must_use]
pub fn new_data_page(page_id: u32) -> Page {
    let mut page = Page::new(page_id, PageType::Data);
    SlottedPage::init(&mut page);
    page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_read_back_preserves_bytes() {
        let mut page = new_data_page(1);
        let mut sp = SlottedPage::new(&mut page);
        let slot = sp.insert_record(b"hello").unwrap();
        assert_eq!(sp.read_record(slot), Some(b"hello".as_slice()));
    }

    #[test]
    fn update_in_place_keeps_slot_index() {
        let mut page = new_data_page(1);
        let mut sp = SlottedPage::new(&mut page);
        let slot = sp.insert_record(b"hello").unwrap();
        sp.update_record(slot, b"hi").unwrap();
        assert_eq!(sp.read_record(slot), Some(b"hi".as_slice()));
    }

    #[test]
    fn update_with_growth_relocates_but_keeps_slot_index() {
        let mut page = new_data_page(1);
        let mut sp = SlottedPage::new(&mut page);
        let slot = sp.insert_record(b"hi").unwrap();
        sp.update_record(slot, b"hello world").unwrap();
        assert_eq!(sp.read_record(slot), Some(b"hello world".as_slice()));
    }

    #[test]
    fn delete_tombstones_without_shrinking_item_count() {
        let mut page = new_data_page(1);
        let mut sp = SlottedPage::new(&mut page);
        let s1 = sp.insert_record(b"a").unwrap();
        let _s2 = sp.insert_record(b"b").unwrap();
        sp.delete_record(s1).unwrap();
        assert_eq!(sp.read_record(s1), None);
        assert_eq!(page.item_count, 2);
    }

    #[test]
    fn compact_renumbers_and_reports_mapping() {
        let mut page = new_data_page(1);
        let mut sp = SlottedPage::new(&mut page);
        let s1 = sp.insert_record(b"a").unwrap();
        let s2 = sp.insert_record(b"b").unwrap();
        let s3 = sp.insert_record(b"c").unwrap();
        sp.delete_record(s2).unwrap();
        let mapping = sp.compact();
        assert_eq!(mapping.get(&s1), Some(&0));
        assert_eq!(mapping.get(&s3), Some(&1));
        assert!(!mapping.contains_key(&s2));
        assert_eq!(sp.live_count(), 2);
    }
}
