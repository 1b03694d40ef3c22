//! Cursor management (§4.11): `find`/`aggregate` results beyond the first
//! batch are held server-side under a cursor id until `getMore` drains
//! them, `killCursors` removes them, or they sit idle past the timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bson::Document;
use crate::errors::{MonoError, MonoResult};
use crate::limits::CURSOR_TIMEOUT;

struct Cursor {
    ns: String,
    remaining: VecDeque<Document>,
    last_active: Instant,
}

pub struct CursorManager {
    cursors: Mutex<HashMap<u64, Cursor>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl Default for CursorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorManager {
    #[must_use]
    pub fn new() -> Self {
        Self { cursors: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1), timeout: CURSOR_TIMEOUT }
    }

    /// Splits `docs` into a first batch of `batch_size` and, if anything
    /// remains, registers a cursor for the rest. Returns `(cursorId,
    /// firstBatch)`; `cursorId == 0` means the result set is exhausted.
    pub fn open(&self, ns: String, mut docs: VecDeque<Document>, batch_size: usize) -> (u64, Vec<Document>) {
        let first_batch: Vec<Document> = docs.drain(..docs.len().min(batch_size)).collect();
        if docs.is_empty() {
            return (0, first_batch);
        }
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        self.cursors.lock().insert(id, Cursor { ns, remaining: docs, last_active: Instant::now() });
        (id, first_batch)
    }

    /// Drains up to `batch_size` more documents. Returns `(batch,
    /// cursorId)`; `cursorId == 0` means the cursor was exhausted and
    /// removed.
    pub fn get_more(&self, id: u64, ns: &str, batch_size: usize) -> MonoResult<(Vec<Document>, u64)> {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.get_mut(&id).ok_or(MonoError::CursorNotFound(id))?;
        if cursor.ns != ns {
            return Err(MonoError::CursorNotFound(id));
        }
        cursor.last_active = Instant::now();
        let batch: Vec<Document> = cursor.remaining.drain(..cursor.remaining.len().min(batch_size)).collect();
        if cursor.remaining.is_empty() {
            cursors.remove(&id);
            Ok((batch, 0))
        } else {
            Ok((batch, id))
        }
    }

    /// Removes the named cursors, returning the ones that actually
    /// existed (MongoDB's `killCursors` reports `cursorsNotFound`
    /// separately for the rest).
    pub fn kill(&self, ids: &[u64]) -> Vec<u64> {
        let mut cursors = self.cursors.lock();
        ids.iter().copied().filter(|id| cursors.remove(id).is_some()).collect()
    }

    pub fn kill_all(&self) {
        self.cursors.lock().clear();
    }

    /// Evicts cursors idle past the timeout, returning their ids.
    pub fn sweep_expired(&self) -> Vec<u64> {
        let mut cursors = self.cursors.lock();
        let now = Instant::now();
        let timeout = self.timeout;
        let expired: Vec<u64> =
            cursors.iter().filter(|(_, c)| now.duration_since(c.last_active) > timeout).map(|(id, _)| *id).collect();
        for id in &expired {
            cursors.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::Value;

    fn docs(n: i32) -> VecDeque<Document> {
        (0..n)
            .map(|i| {
                let mut d = Document::new();
                d.insert("n", Value::Int32(i));
                d
            })
            .collect()
    }

    #[test]
    fn small_result_set_needs_no_cursor() {
        let cm = CursorManager::new();
        let (id, batch) = cm.open("db.coll".into(), docs(3), 10);
        assert_eq!(id, 0);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn get_more_drains_until_exhausted() {
        let cm = CursorManager::new();
        let (id, first) = cm.open("db.coll".into(), docs(5), 2);
        assert_ne!(id, 0);
        assert_eq!(first.len(), 2);
        let (second, id2) = cm.get_more(id, "db.coll", 2).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(id2, id);
        let (third, id3) = cm.get_more(id, "db.coll", 2).unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(id3, 0);
        assert!(cm.get_more(id, "db.coll", 2).is_err());
    }

    #[test]
    fn kill_cursors_removes_them() {
        let cm = CursorManager::new();
        let (id, _) = cm.open("db.coll".into(), docs(5), 1);
        let killed = cm.kill(&[id, 9999]);
        assert_eq!(killed, vec![id]);
        assert!(cm.get_more(id, "db.coll", 1).is_err());
    }
}
