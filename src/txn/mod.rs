//! The transaction manager: begin/commit/abort, an undo log, and lock
//! lifecycle management (§4.8).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bson::{Document, Value};
use crate::errors::{MonoError, MonoResult};
use crate::lock::{LockManager, TxnId};
use crate::storage::Pager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct UndoRecord {
    pub op: UndoOp,
    pub collection: String,
    pub doc_id: Value,
    pub old_doc: Option<Document>,
}

/// Implemented by whatever owns collections (the engine), so the
/// transaction manager can replay undo records without knowing about
/// collection internals.
pub trait UndoSink {
    fn apply_undo(&self, record: &UndoRecord) -> MonoResult<()>;
}

pub struct Txn {
    pub id: TxnId,
    pub isolation: Isolation,
    pub timeout: Duration,
    state: Mutex<TxnState>,
    undo_log: Mutex<Vec<UndoRecord>>,
    locks_held: Mutex<HashSet<String>>,
}

impl Txn {
    #[must_use]
    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub fn append_undo(&self, record: UndoRecord) {
        self.undo_log.lock().push(record);
    }

    pub fn note_lock_held(&self, resource: &str) {
        self.locks_held.lock().insert(resource.to_string());
    }

    /// Require `state == Active`, applying the mutation `f`, and set the
    /// new state. Both double-commit and double-abort return `Ok(())`;
    /// crossing a commit/abort from the other terminal state fails with
    /// `TransactionAborted` (this error kind is used for both
    /// directions, matching the source behavior this engine mirrors).
    fn transition(&self, to: TxnState) -> MonoResult<bool> {
        let mut state = self.state.lock();
        match (*state, to) {
            (TxnState::Active, _) => {
                *state = to;
                Ok(true)
            }
            (TxnState::Committed, TxnState::Committed) | (TxnState::Aborted, TxnState::Aborted) => Ok(false),
            _ => Err(MonoError::TransactionAborted),
        }
    }

    /// Marks the transaction durable by appending a `Commit` WAL record
    /// (synced before this returns) naming every page write it made.
    /// This does not checkpoint or touch the data file — that is the
    /// separate, coarser `Pager::flush` a host calls periodically.
    pub fn commit(&self, lock_manager: &LockManager, pager: &mut Pager) -> MonoResult<()> {
        let first_time = self.transition(TxnState::Committed)?;
        if first_time {
            pager.mark_committed(self.id)?;
            lock_manager.release_all(self.id);
        }
        Ok(())
    }

    pub fn abort(&self, lock_manager: &LockManager, sink: &dyn UndoSink) -> MonoResult<()> {
        let first_time = self.transition(TxnState::Aborted)?;
        if first_time {
            let records: Vec<UndoRecord> = self.undo_log.lock().drain(..).collect();
            for record in records.into_iter().rev() {
                sink.apply_undo(&record)?;
            }
            lock_manager.release_all(self.id);
        }
        Ok(())
    }
}

pub struct TransactionManager {
    next_id: AtomicU64,
    active: Mutex<std::collections::HashMap<TxnId, Arc<Txn>>>,
    pub lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    #[must_use]
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self { next_id: AtomicU64::new(1), active: Mutex::new(std::collections::HashMap::new()), lock_manager }
    }

    #[must_use]
    pub fn begin(&self, isolation: Isolation, timeout: Duration) -> Arc<Txn> {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let txn = Arc::new(Txn {
            id,
            isolation,
            timeout,
            state: Mutex::new(TxnState::Active),
            undo_log: Mutex::new(Vec::new()),
            locks_held: Mutex::new(HashSet::new()),
        });
        self.active.lock().insert(id, txn.clone());
        txn
    }

    #[must_use]
    pub fn get(&self, id: TxnId) -> Option<Arc<Txn>> {
        self.active.lock().get(&id).cloned()
    }

    pub fn forget(&self, id: TxnId) {
        self.active.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct NoopSink;
    impl UndoSink for NoopSink {
        fn apply_undo(&self, _record: &UndoRecord) -> MonoResult<()> {
            Ok(())
        }
    }

    #[test]
    fn double_commit_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.monodb")).unwrap();
        let lm = LockManager::new();
        let txm = TransactionManager::new(Arc::new(lm));
        let txn = txm.begin(Isolation::Serializable, Duration::from_secs(1));
        txn.commit(&txm.lock_manager, &mut pager).unwrap();
        txn.commit(&txm.lock_manager, &mut pager).unwrap();
    }

    #[test]
    fn double_abort_is_idempotent() {
        let txm = TransactionManager::new(Arc::new(LockManager::new()));
        let txn = txm.begin(Isolation::Serializable, Duration::from_secs(1));
        let sink = NoopSink;
        txn.abort(&txm.lock_manager, &sink).unwrap();
        txn.abort(&txm.lock_manager, &sink).unwrap();
    }

    #[test]
    fn commit_after_abort_fails() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.monodb")).unwrap();
        let txm = TransactionManager::new(Arc::new(LockManager::new()));
        let txn = txm.begin(Isolation::Serializable, Duration::from_secs(1));
        let sink = NoopSink;
        txn.abort(&txm.lock_manager, &sink).unwrap();
        assert!(matches!(txn.commit(&txm.lock_manager, &mut pager), Err(MonoError::TransactionAborted)));
    }

    #[test]
    fn abort_after_commit_fails() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.monodb")).unwrap();
        let txm = TransactionManager::new(Arc::new(LockManager::new()));
        let txn = txm.begin(Isolation::Serializable, Duration::from_secs(1));
        txn.commit(&txm.lock_manager, &mut pager).unwrap();
        let sink = NoopSink;
        assert!(matches!(txn.abort(&txm.lock_manager, &sink), Err(MonoError::TransactionAborted)));
    }
}
