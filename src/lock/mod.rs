//! The lock manager: shared/exclusive locks per resource, FIFO waiters,
//! and wait-for-graph deadlock detection (§4.7).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::errors::{MonoError, MonoResult};

pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct Waiter {
    txn: TxnId,
    mode: LockMode,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Entry {
    exclusive: Option<TxnId>,
    shared: HashSet<TxnId>,
    waiters: VecDeque<Waiter>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty() && self.waiters.is_empty()
    }

    fn compatible(&self, txn: TxnId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive.is_none() || self.exclusive == Some(txn),
            LockMode::Exclusive => {
                (self.exclusive.is_none() || self.exclusive == Some(txn))
                    && (self.shared.is_empty() || (self.shared.len() == 1 && self.shared.contains(&txn)))
            }
        }
    }

    fn grant(&mut self, txn: TxnId, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.shared.insert(txn);
            }
            LockMode::Exclusive => {
                self.exclusive = Some(txn);
            }
        }
    }

    fn holders(&self, excluding: TxnId) -> Vec<TxnId> {
        let mut holders: Vec<TxnId> = self.shared.iter().copied().filter(|t| *t != excluding).collect();
        if let Some(ex) = self.exclusive {
            if ex != excluding {
                holders.push(ex);
            }
        }
        holders
    }
}

/// Default acquire timeout, per §5.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct LockManager {
    table: Mutex<HashMap<String, Entry>>,
    wait_for: Mutex<HashMap<TxnId, HashSet<TxnId>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self { table: Mutex::new(HashMap::new()), wait_for: Mutex::new(HashMap::new()) }
    }

    /// Acquires `mode` on `resource` for `txn`, waiting up to `timeout`.
    /// On a detected deadlock or an expired timeout, the waiter is
    /// removed and an error is returned; the pending wakeup is dropped
    /// so it never fires against a reused waiter.
    pub async fn acquire(&self, resource: &str, mode: LockMode, txn: TxnId, timeout: Duration) -> MonoResult<()> {
        loop {
            let notify = {
                let mut table = self.table.lock();
                let entry = table.entry(resource.to_string()).or_default();
                if entry.compatible(txn, mode) {
                    entry.grant(txn, mode);
                    self.clear_wait_for(txn);
                    return Ok(());
                }

                let holders = entry.holders(txn);
                if self.would_deadlock(txn, &holders) {
                    warn!("lock: deadlock detected for txn {txn} on resource {resource}");
                    return Err(MonoError::OperationFailed("deadlock detected".into()));
                }
                self.add_wait_for(txn, &holders);

                let notify = Arc::new(Notify::new());
                entry.waiters.push_back(Waiter { txn, mode, notify: notify.clone() });
                notify
            };

            if tokio::time::timeout(timeout, notify.notified()).await.is_err() {
                self.remove_waiter(resource, txn);
                self.clear_wait_for(txn);
                return Err(MonoError::OperationFailed("lock acquisition timeout".into()));
            }
            // Woken by a release; loop back and re-check compatibility.
        }
    }

    /// Releases every lock `txn` holds on `resource`, granting as many
    /// FIFO-ordered waiters as are now compatible.
    pub fn release(&self, resource: &str, txn: TxnId) {
        let mut table = self.table.lock();
        let Some(entry) = table.get_mut(resource) else { return };
        if entry.exclusive == Some(txn) {
            entry.exclusive = None;
        }
        entry.shared.remove(&txn);

        while let Some(front) = entry.waiters.front() {
            if !entry.compatible(front.txn, front.mode) {
                break;
            }
            let waiter = entry.waiters.pop_front().expect("checked front above");
            entry.grant(waiter.txn, waiter.mode);
            self.clear_wait_for(waiter.txn);
            waiter.notify.notify_one();
            debug!("lock: granted {:?} on {resource} to txn {}", waiter.mode, waiter.txn);
            if waiter.mode == LockMode::Exclusive {
                break;
            }
        }

        if entry.is_empty() {
            table.remove(resource);
        }
    }

    /// Releases every lock `txn` holds across all resources (used by
    /// commit/abort).
    pub fn release_all(&self, txn: TxnId) {
        let resources: Vec<String> = {
            let table = self.table.lock();
            table
                .iter()
                .filter(|(_, e)| e.exclusive == Some(txn) || e.shared.contains(&txn))
                .map(|(k, _)| k.clone())
                .collect()
        };
        for resource in resources {
            self.release(&resource, txn);
        }
    }

    fn remove_waiter(&self, resource: &str, txn: TxnId) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(resource) {
            entry.waiters.retain(|w| w.txn != txn);
            if entry.is_empty() {
                table.remove(resource);
            }
        }
    }

    fn add_wait_for(&self, txn: TxnId, holders: &[TxnId]) {
        let mut wait_for = self.wait_for.lock();
        let edges = wait_for.entry(txn).or_default();
        for holder in holders {
            edges.insert(*holder);
        }
    }

    fn clear_wait_for(&self, txn: TxnId) {
        self.wait_for.lock().remove(&txn);
    }

    /// DFS cycle check: would adding edges `txn -> holders` create a
    /// cycle in the wait-for graph?
    fn would_deadlock(&self, txn: TxnId, holders: &[TxnId]) -> bool {
        if holders.is_empty() {
            return false;
        }
        let wait_for = self.wait_for.lock();
        let mut stack: Vec<TxnId> = holders.to_vec();
        let mut visited: HashSet<TxnId> = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == txn {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(next) = wait_for.get(&node) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_locks_are_concurrently_grantable() {
        let lm = LockManager::new();
        lm.acquire("r", LockMode::Shared, 1, Duration::from_secs(1)).await.unwrap();
        lm.acquire("r", LockMode::Shared, 2, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn exclusive_excludes_other_holders() {
        let lm = LockManager::new();
        lm.acquire("r", LockMode::Exclusive, 1, Duration::from_secs(1)).await.unwrap();
        let err = lm.acquire("r", LockMode::Exclusive, 2, Duration::from_millis(50)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn release_wakes_waiting_acquirer() {
        let lm = Arc::new(LockManager::new());
        lm.acquire("r", LockMode::Exclusive, 1, Duration::from_secs(1)).await.unwrap();
        let lm2 = lm.clone();
        let waiter = tokio::spawn(async move { lm2.acquire("r", LockMode::Exclusive, 2, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        lm.release("r", 1);
        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn deadlock_between_two_transactions_is_detected() {
        let lm = Arc::new(LockManager::new());
        lm.acquire("r1", LockMode::Exclusive, 1, Duration::from_secs(1)).await.unwrap();
        lm.acquire("r2", LockMode::Exclusive, 2, Duration::from_secs(1)).await.unwrap();

        let lm2 = lm.clone();
        let t1_waits = tokio::spawn(async move { lm2.acquire("r2", LockMode::Exclusive, 1, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = lm.acquire("r1", LockMode::Exclusive, 2, Duration::from_millis(200)).await;
        assert!(result.is_err());
        lm.release("r2", 2);
        let _ = t1_waits.await;
    }
}
