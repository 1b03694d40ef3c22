//! B+Tree node layout: serialized directly into a page's payload, with
//! the remainder zero-filled so `unmarshal` never sees stale bytes
//! (§4.6).

use crate::errors::{MonoError, MonoResult};
use crate::limits::PAGE_PAYLOAD_SIZE;
use crate::storage::pager::NO_PAGE;
use crate::storage::slotted::RecordId;

const KIND_INTERNAL: u8 = 0;
const KIND_LEAF: u8 = 1;

/// Keys beyond this count always force a split, independent of the
/// byte-size check; this stands in for the "fan-out derived order" the
/// design notes describe in the abstract.
pub const ORDER: usize = 200;
pub const MIN_KEYS: usize = (ORDER - 1) / 2;

#[derive(Debug, Clone)]
pub enum Node {
    Internal { keys: Vec<Vec<u8>>, children: Vec<u32> },
    Leaf { entries: Vec<(Vec<u8>, Vec<RecordId>)>, next_leaf: u32 },
}

impl Node {
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf { .. })
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        match self {
            Self::Internal { keys, .. } => keys.len(),
            Self::Leaf { entries, .. } => entries.len(),
        }
    }

    pub fn serialize_into(&self, payload: &mut [u8; PAGE_PAYLOAD_SIZE]) -> MonoResult<()> {
        let mut buf = Vec::with_capacity(PAGE_PAYLOAD_SIZE);
        match self {
            Self::Internal { keys, children } => {
                buf.push(KIND_INTERNAL);
                buf.extend_from_slice(&(keys.len() as u16).to_le_bytes());
                for key in keys {
                    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
                    buf.extend_from_slice(key);
                }
                for child in children {
                    buf.extend_from_slice(&child.to_le_bytes());
                }
            }
            Self::Leaf { entries, next_leaf } => {
                buf.push(KIND_LEAF);
                buf.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                buf.extend_from_slice(&next_leaf.to_le_bytes());
                for (key, rids) in entries {
                    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
                    buf.extend_from_slice(key);
                    buf.extend_from_slice(&(rids.len() as u16).to_le_bytes());
                    for rid in rids {
                        buf.extend_from_slice(&rid.page_id.to_le_bytes());
                        buf.extend_from_slice(&rid.slot_index.to_le_bytes());
                    }
                }
            }
        }
        if buf.len() > PAGE_PAYLOAD_SIZE {
            return Err(MonoError::InternalError("serialized btree node exceeds page size".into()));
        }
        payload.fill(0);
        payload[..buf.len()].copy_from_slice(&buf);
        Ok(())
    }

    pub fn deserialize(payload: &[u8; PAGE_PAYLOAD_SIZE]) -> MonoResult<Self> {
        let mut cur = 0usize;
        let take = |cur: &mut usize, n: usize| -> MonoResult<std::ops::Range<usize>> {
            let end = cur.checked_add(n).ok_or_else(|| MonoError::InternalError("btree node corrupt".into()))?;
            if end > payload.len() {
                return Err(MonoError::InternalError("btree node truncated".into()));
            }
            let range = *cur..end;
            *cur = end;
            Ok(range)
        };

        let kind = payload[cur];
        cur += 1;
        match kind {
            KIND_INTERNAL => {
                let r = take(&mut cur, 2)?;
                let key_count = u16::from_le_bytes(payload[r].try_into().unwrap()) as usize;
                let mut keys = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    let r = take(&mut cur, 2)?;
                    let len = u16::from_le_bytes(payload[r].try_into().unwrap()) as usize;
                    let r = take(&mut cur, len)?;
                    keys.push(payload[r].to_vec());
                }
                let mut children = Vec::with_capacity(key_count + 1);
                for _ in 0..=key_count {
                    let r = take(&mut cur, 4)?;
                    children.push(u32::from_le_bytes(payload[r].try_into().unwrap()));
                }
                Ok(Self::Internal { keys, children })
            }
            KIND_LEAF => {
                let r = take(&mut cur, 2)?;
                let entry_count = u16::from_le_bytes(payload[r].try_into().unwrap()) as usize;
                let r = take(&mut cur, 4)?;
                let next_leaf = u32::from_le_bytes(payload[r].try_into().unwrap());
                let mut entries = Vec::with_capacity(entry_count);
                for _ in 0..entry_count {
                    let r = take(&mut cur, 2)?;
                    let key_len = u16::from_le_bytes(payload[r].try_into().unwrap()) as usize;
                    let r = take(&mut cur, key_len)?;
                    let key = payload[r].to_vec();
                    let r = take(&mut cur, 2)?;
                    let rid_count = u16::from_le_bytes(payload[r].try_into().unwrap()) as usize;
                    let mut rids = Vec::with_capacity(rid_count);
                    for _ in 0..rid_count {
                        let r = take(&mut cur, 4)?;
                        let page_id = u32::from_le_bytes(payload[r].try_into().unwrap());
                        let r = take(&mut cur, 2)?;
                        let slot_index = u16::from_le_bytes(payload[r].try_into().unwrap());
                        rids.push(RecordId { page_id, slot_index });
                    }
                    entries.push((key, rids));
                }
                Ok(Self::Leaf { entries, next_leaf })
            }
            _ => Err(MonoError::InternalError("unknown btree node kind".into())),
        }
    }

    #[must_use]
    pub fn new_leaf() -> Self {
        Self::Leaf { entries: Vec::new(), next_leaf: NO_PAGE }
    }
}
