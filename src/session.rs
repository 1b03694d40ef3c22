//! Session and transaction-context tracking (§4.11): a logical session id
//! (`lsid`) maps to at most one in-flight transaction, keyed by
//! `txnNumber`. Starting a new transaction on a session that still has a
//! prior one active implicitly aborts the prior one, per MongoDB's
//! multi-document transaction semantics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bson::{Document, Value};
use crate::errors::{MonoError, MonoResult};
use crate::limits::SESSION_TIMEOUT;
use crate::txn::Txn;

/// Parsed session/transaction fields lifted off an incoming command body.
#[derive(Debug, Default, Clone)]
pub struct CommandContext {
    pub lsid: Option<Vec<u8>>,
    pub txn_number: Option<i64>,
    pub start_transaction: bool,
    pub autocommit: bool,
    pub read_concern: Option<Document>,
    pub write_concern: Option<Document>,
}

/// Extracts `lsid`/`txnNumber`/`startTransaction`/`autocommit`/
/// `readConcern`/`writeConcern` from a command document. `lsid` is read
/// from the conventional `{id: <binary>}` shape.
#[must_use]
pub fn extract_command_context(command: &Document) -> CommandContext {
    let lsid = match command.get("lsid") {
        Some(Value::Document(d)) => match d.get("id") {
            Some(Value::Binary(_, bytes)) => Some(bytes.clone()),
            Some(Value::String(s)) => Some(s.as_bytes().to_vec()),
            _ => None,
        },
        _ => None,
    };
    let txn_number = match command.get("txnNumber") {
        Some(Value::Int64(n)) => Some(*n),
        Some(Value::Int32(n)) => Some(i64::from(*n)),
        _ => None,
    };
    let start_transaction = matches!(command.get("startTransaction"), Some(Value::Boolean(true)));
    let autocommit = !matches!(command.get("autocommit"), Some(Value::Boolean(false)));
    let read_concern = match command.get("readConcern") {
        Some(Value::Document(d)) => Some(d.clone()),
        _ => None,
    };
    let write_concern = match command.get("writeConcern") {
        Some(Value::Document(d)) => Some(d.clone()),
        _ => None,
    };
    CommandContext { lsid, txn_number, start_transaction, autocommit, read_concern, write_concern }
}

struct ActiveTxn {
    txn_number: i64,
    txn: Arc<Txn>,
}

struct Session {
    last_active: Instant,
    active_txn: Option<ActiveTxn>,
    highest_txn_number: Option<i64>,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<Vec<u8>, Session>>,
    timeout: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()), timeout: SESSION_TIMEOUT }
    }

    /// Marks `lsid` active, creating the session entry if this is its
    /// first command.
    pub fn touch(&self, lsid: &[u8]) {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(lsid.to_vec())
            .or_insert_with(|| Session { last_active: Instant::now(), active_txn: None, highest_txn_number: None })
            .last_active = Instant::now();
    }

    /// Associates `txn` as the session's active transaction, rejecting a
    /// `txnNumber` that is not strictly greater than the last one this
    /// session used. If a different transaction was already active on
    /// this session, it is returned so the caller can abort it before
    /// proceeding — starting a transaction implicitly ends whichever one
    /// preceded it.
    pub fn start_transaction(&self, lsid: &[u8], txn_number: i64, txn: Arc<Txn>) -> MonoResult<Option<Arc<Txn>>> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(lsid.to_vec())
            .or_insert_with(|| Session { last_active: Instant::now(), active_txn: None, highest_txn_number: None });
        if session.highest_txn_number.is_some_and(|highest| txn_number <= highest) {
            return Err(MonoError::InvalidArgument(format!(
                "txnNumber {txn_number} must be strictly greater than the last used value"
            )));
        }
        session.last_active = Instant::now();
        session.highest_txn_number = Some(txn_number);
        let previous = session.active_txn.take().map(|a| a.txn);
        session.active_txn = Some(ActiveTxn { txn_number, txn });
        Ok(previous)
    }

    /// Returns the session's active transaction if its number matches.
    #[must_use]
    pub fn active_transaction(&self, lsid: &[u8], txn_number: i64) -> Option<Arc<Txn>> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(lsid)?;
        session.last_active = Instant::now();
        session.active_txn.as_ref().filter(|a| a.txn_number == txn_number).map(|a| a.txn.clone())
    }

    /// Clears the session's active transaction (commit/abort completed).
    pub fn clear_transaction(&self, lsid: &[u8]) {
        if let Some(session) = self.sessions.lock().get_mut(lsid) {
            session.active_txn = None;
        }
    }

    pub fn end_session(&self, lsid: &[u8]) {
        self.sessions.lock().remove(lsid);
    }

    pub fn end_all(&self) {
        self.sessions.lock().clear();
    }

    /// Evicts sessions idle past the timeout, returning any transactions
    /// they left active so the caller can abort them.
    pub fn sweep_expired(&self) -> Vec<Arc<Txn>> {
        let mut sessions = self.sessions.lock();
        let now = Instant::now();
        let timeout = self.timeout;
        let mut orphaned = Vec::new();
        sessions.retain(|_, session| {
            let expired = now.duration_since(session.last_active) > timeout;
            if expired {
                if let Some(active) = session.active_txn.take() {
                    orphaned.push(active.txn);
                }
            }
            !expired
        });
        orphaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockManager;
    use crate::txn::{Isolation, TransactionManager};
    use std::time::Duration as StdDuration;

    #[test]
    fn starting_a_new_transaction_returns_the_prior_one() {
        let txm = TransactionManager::new(Arc::new(LockManager::new()));
        let sm = SessionManager::new();
        let lsid = vec![1, 2, 3];
        let txn1 = txm.begin(Isolation::Serializable, StdDuration::from_secs(1));
        assert!(sm.start_transaction(&lsid, 1, txn1.clone()).unwrap().is_none());
        let txn2 = txm.begin(Isolation::Serializable, StdDuration::from_secs(1));
        let previous = sm.start_transaction(&lsid, 2, txn2).unwrap();
        assert_eq!(previous.unwrap().id, txn1.id);
    }

    #[test]
    fn txn_number_must_strictly_increase() {
        let txm = TransactionManager::new(Arc::new(LockManager::new()));
        let sm = SessionManager::new();
        let lsid = vec![4];
        let txn1 = txm.begin(Isolation::Serializable, StdDuration::from_secs(1));
        sm.start_transaction(&lsid, 5, txn1).unwrap();
        let txn2 = txm.begin(Isolation::Serializable, StdDuration::from_secs(1));
        assert!(sm.start_transaction(&lsid, 5, txn2).is_err());
    }

    #[test]
    fn active_transaction_requires_matching_txn_number() {
        let txm = TransactionManager::new(Arc::new(LockManager::new()));
        let sm = SessionManager::new();
        let lsid = vec![9];
        let txn = txm.begin(Isolation::Serializable, StdDuration::from_secs(1));
        sm.start_transaction(&lsid, 5, txn).unwrap();
        assert!(sm.active_transaction(&lsid, 5).is_some());
        assert!(sm.active_transaction(&lsid, 6).is_none());
    }

    #[test]
    fn extract_command_context_reads_fields() {
        let mut lsid_doc = Document::new();
        lsid_doc.insert("id", Value::Binary(0, vec![1, 2, 3]));
        let mut command = Document::new();
        command.insert("lsid", Value::Document(lsid_doc));
        command.insert("txnNumber", Value::Int64(4));
        command.insert("startTransaction", Value::Boolean(true));
        let ctx = extract_command_context(&command);
        assert_eq!(ctx.lsid, Some(vec![1, 2, 3]));
        assert_eq!(ctx.txn_number, Some(4));
        assert!(ctx.start_transaction);
        assert!(ctx.autocommit);
    }
}
