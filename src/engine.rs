//! The engine: the single owner of the pager and catalog, wrapping every
//! collection in its own serial write queue (§4.9a, §5).
//!
//! `with_collection` is the only path that mutates a collection's catalog
//! entry: it holds the pager lock and that collection's lock for the
//! duration of the closure, then re-persists the catalog page through the
//! same WAL-first `write_page` path any other mutation uses. Locking for
//! multi-statement transactions (acquiring a resource via
//! [`crate::lock::LockManager`]) is the command layer's responsibility —
//! it runs on the async runtime this struct does not assume — so every
//! method here is synchronous and only concerns itself with applying the
//! mutation and, when a transaction is supplied, recording how to undo it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::aggregation::{self, ForeignLookup};
use crate::bson::compare::compare;
use crate::bson::{Document, Value};
use crate::catalog::{Catalog, CollectionEntry, IndexEntry};
use crate::collection::{Collection, UpdateOutcome};
use crate::errors::{MonoError, MonoResult};
use crate::keystring::KeyField;
use crate::lock::LockManager;
use crate::storage::page::{Page, PageType};
use crate::storage::pager::{Pager, NO_PAGE};
use crate::limits::PAGE_PAYLOAD_SIZE;
use crate::session::SessionManager;
use crate::cursor::CursorManager;
use crate::txn::{Isolation, TransactionManager, Txn, UndoOp, UndoRecord, UndoSink};

pub struct Engine {
    pager: Mutex<Pager>,
    catalog_page_id: Mutex<u32>,
    collections: RwLock<HashMap<String, Arc<Mutex<Collection>>>>,
    pub lock_manager: Arc<LockManager>,
    pub txn_manager: Arc<TransactionManager>,
    pub sessions: SessionManager,
    pub cursors: CursorManager,
}

impl Engine {
    pub fn open(path: impl AsRef<Path>) -> MonoResult<Self> {
        let mut pager = Pager::open(path)?;
        let catalog_page_id = pager.catalog_page_id();
        let catalog = read_catalog(&mut pager, catalog_page_id)?;
        catalog.validate()?;

        let mut collections = HashMap::with_capacity(catalog.collections.len());
        for entry in catalog.collections {
            collections.insert(entry.name.clone(), Arc::new(Mutex::new(Collection::from_entry(entry))));
        }

        let lock_manager = Arc::new(LockManager::new());
        let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));

        Ok(Self {
            pager: Mutex::new(pager),
            catalog_page_id: Mutex::new(catalog_page_id),
            collections: RwLock::new(collections),
            lock_manager,
            txn_manager,
            sessions: SessionManager::new(),
            cursors: CursorManager::new(),
        })
    }

    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.pager.lock().page_count()
    }

    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.pager.lock().data_path().to_path_buf()
    }

    pub fn flush(&self) -> MonoResult<()> {
        self.pager.lock().flush()
    }

    #[must_use]
    pub fn collection_exists(&self, ns: &str) -> bool {
        self.collections.read().contains_key(ns)
    }

    #[must_use]
    pub fn list_collection_names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    pub fn list_indexes(&self, ns: &str) -> MonoResult<Vec<IndexEntry>> {
        let coll = self.collections.read().get(ns).cloned().ok_or_else(|| MonoError::NamespaceNotFound(ns.to_string()))?;
        Ok(coll.lock().entry.indexes.clone())
    }

    /// Rebuilds a catalog snapshot from the live in-memory collection
    /// state and re-runs the same consistency check `open` ran against
    /// the on-disk catalog at startup (§9), catching drift introduced
    /// since then rather than re-affirming what was already checked once.
    pub fn validate_catalog(&self) -> MonoResult<()> {
        let entries = {
            let colls = self.collections.read();
            colls.values().map(|arc| arc.lock().entry.clone()).collect()
        };
        Catalog { collections: entries }.validate()
    }

    /// Locks the pager and the named collection for the closure's
    /// duration, then persists the catalog with that collection's
    /// post-mutation entry folded in. `txn_id`, when given, tags every
    /// page write the closure (and the catalog persist that follows it)
    /// makes so recovery can gate redoing them on that transaction's
    /// commit (§4.8); `None` marks them ambient writes recovery always
    /// redoes.
    fn with_collection<F, R>(&self, ns: &str, txn_id: Option<u64>, f: F) -> MonoResult<R>
    where
        F: FnOnce(&mut Collection, &mut Pager) -> MonoResult<R>,
    {
        let coll_arc =
            self.collections.read().get(ns).cloned().ok_or_else(|| MonoError::NamespaceNotFound(ns.to_string()))?;
        let mut pager = self.pager.lock();
        pager.set_current_txn(txn_id);
        let mut coll = coll_arc.lock();
        let result = f(&mut coll, &mut pager)?;
        let updated_entry = coll.entry.clone();
        drop(coll);
        self.persist_catalog_with_update(&mut pager, ns, updated_entry)?;
        Ok(result)
    }

    fn persist_catalog_with_update(&self, pager: &mut Pager, changed_name: &str, changed_entry: CollectionEntry) -> MonoResult<()> {
        let entries = {
            let colls = self.collections.read();
            colls
                .iter()
                .map(|(name, arc)| if name == changed_name { changed_entry.clone() } else { arc.lock().entry.clone() })
                .collect()
        };
        self.write_catalog_entries(pager, entries)
    }

    fn persist_catalog_full(&self, pager: &mut Pager) -> MonoResult<()> {
        let entries = {
            let colls = self.collections.read();
            colls.values().map(|arc| arc.lock().entry.clone()).collect()
        };
        self.write_catalog_entries(pager, entries)
    }

    fn write_catalog_entries(&self, pager: &mut Pager, entries: Vec<CollectionEntry>) -> MonoResult<()> {
        let catalog = Catalog { collections: entries };
        let bytes = catalog.encode();
        let mut head = self.catalog_page_id.lock();
        let new_head = write_catalog(pager, *head, &bytes)?;
        if new_head != *head {
            pager.set_catalog_page_id(new_head)?;
            *head = new_head;
        }
        Ok(())
    }

    pub fn create_collection(&self, name: &str) -> MonoResult<()> {
        if self.collections.read().contains_key(name) {
            return Err(MonoError::OperationFailed(format!("collection already exists: {name}")));
        }
        let mut pager = self.pager.lock();
        pager.set_current_txn(None);
        let collection = Collection::create(&mut pager, name)?;
        let entry = collection.entry.clone();
        self.collections.write().insert(name.to_string(), Arc::new(Mutex::new(collection)));
        self.persist_catalog_with_update(&mut pager, name, entry)
    }

    pub fn drop_collection(&self, name: &str) -> MonoResult<()> {
        let mut pager = self.pager.lock();
        pager.set_current_txn(None);
        if self.collections.write().remove(name).is_none() {
            return Err(MonoError::NamespaceNotFound(name.to_string()));
        }
        self.persist_catalog_full(&mut pager)
    }

    pub fn create_index(&self, ns: &str, key: Vec<KeyField>, unique: bool, name: String) -> MonoResult<()> {
        self.with_collection(ns, None, |coll, pager| coll.create_index(pager, key, unique, name))
    }

    pub fn drop_index(&self, ns: &str, name: &str) -> MonoResult<()> {
        self.with_collection(ns, None, |coll, _pager| coll.drop_index(name))
    }

    pub fn insert_one(&self, ns: &str, doc: Document, txn: Option<&Arc<Txn>>) -> MonoResult<Document> {
        self.with_collection(ns, txn.map(|t| t.id), |coll, pager| {
            let (_, inserted) = coll.insert_one(pager, doc)?;
            if let Some(txn) = txn {
                txn.append_undo(UndoRecord {
                    op: UndoOp::Insert,
                    collection: ns.to_string(),
                    doc_id: inserted.get("_id").cloned().unwrap_or(Value::Null),
                    old_doc: None,
                });
            }
            Ok(inserted)
        })
    }

    /// Inserts each document independently, per the batch-insert partial
    /// failure semantics in `Collection::insert_many`.
    pub fn insert_many(
        &self,
        ns: &str,
        docs: Vec<Document>,
        txn: Option<&Arc<Txn>>,
    ) -> MonoResult<(Vec<Document>, Vec<(usize, MonoError)>)> {
        self.with_collection(ns, txn.map(|t| t.id), |coll, pager| {
            let (ok, errs) = coll.insert_many(pager, docs);
            if let Some(txn) = txn {
                for (_, doc) in &ok {
                    txn.append_undo(UndoRecord {
                        op: UndoOp::Insert,
                        collection: ns.to_string(),
                        doc_id: doc.get("_id").cloned().unwrap_or(Value::Null),
                        old_doc: None,
                    });
                }
            }
            Ok((ok.into_iter().map(|(_, d)| d).collect(), errs))
        })
    }

    pub fn find(&self, ns: &str, query: &Document, sort: Option<&Document>, skip: usize, limit: Option<usize>) -> MonoResult<Vec<Document>> {
        self.with_collection(ns, None, |coll, pager| {
            let mut docs: Vec<Document> = coll.find(pager, query)?.into_iter().map(|(_, d)| d).collect();
            if let Some(sort) = sort {
                docs = aggregation::stages::stage_sort(docs, sort);
            }
            docs = aggregation::stages::stage_skip(docs, skip);
            if let Some(limit) = limit {
                docs = aggregation::stages::stage_limit(docs, limit);
            }
            Ok(docs)
        })
    }

    pub fn count(&self, ns: &str, query: &Document) -> MonoResult<usize> {
        self.with_collection(ns, None, |coll, pager| coll.count(pager, query))
    }

    pub fn distinct(&self, ns: &str, field: &str, query: &Document) -> MonoResult<Vec<Value>> {
        self.with_collection(ns, None, |coll, pager| coll.distinct(pager, field, query))
    }

    pub fn update_many(
        &self,
        ns: &str,
        query: &Document,
        update_doc: &Document,
        upsert: bool,
        txn: Option<&Arc<Txn>>,
    ) -> MonoResult<UpdateOutcome> {
        self.with_collection(ns, txn.map(|t| t.id), |coll, pager| {
            let before = coll.find(pager, query)?;
            let outcome = coll.update_many(pager, query, update_doc, upsert)?;
            if let Some(txn) = txn {
                for (_, old_doc) in before {
                    txn.append_undo(UndoRecord {
                        op: UndoOp::Update,
                        collection: ns.to_string(),
                        doc_id: old_doc.get("_id").cloned().unwrap_or(Value::Null),
                        old_doc: Some(old_doc),
                    });
                }
                if let Some(id) = &outcome.upserted_id {
                    txn.append_undo(UndoRecord { op: UndoOp::Insert, collection: ns.to_string(), doc_id: id.clone(), old_doc: None });
                }
            }
            Ok(outcome)
        })
    }

    pub fn replace_one(&self, ns: &str, query: &Document, replacement: Document, txn: Option<&Arc<Txn>>) -> MonoResult<UpdateOutcome> {
        self.with_collection(ns, txn.map(|t| t.id), |coll, pager| {
            let before = coll.find(pager, query)?;
            let outcome = coll.replace_one(pager, query, replacement)?;
            if outcome.modified == 1 {
                if let (Some(txn), Some((_, old_doc))) = (txn, before.into_iter().next()) {
                    txn.append_undo(UndoRecord {
                        op: UndoOp::Update,
                        collection: ns.to_string(),
                        doc_id: old_doc.get("_id").cloned().unwrap_or(Value::Null),
                        old_doc: Some(old_doc),
                    });
                }
            }
            Ok(outcome)
        })
    }

    pub fn delete_many(&self, ns: &str, query: &Document, txn: Option<&Arc<Txn>>) -> MonoResult<usize> {
        self.with_collection(ns, txn.map(|t| t.id), |coll, pager| {
            let before = coll.find(pager, query)?;
            let deleted = coll.delete_many(pager, query)?;
            if let Some(txn) = txn {
                for (_, old_doc) in before {
                    txn.append_undo(UndoRecord {
                        op: UndoOp::Delete,
                        collection: ns.to_string(),
                        doc_id: old_doc.get("_id").cloned().unwrap_or(Value::Null),
                        old_doc: Some(old_doc),
                    });
                }
            }
            Ok(deleted)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn find_and_modify(
        &self,
        ns: &str,
        query: &Document,
        sort: Option<&Document>,
        update_doc: Option<&Document>,
        remove: bool,
        upsert: bool,
        new_image: bool,
        txn: Option<&Arc<Txn>>,
    ) -> MonoResult<Option<Document>> {
        self.with_collection(ns, txn.map(|t| t.id), |coll, pager| {
            let matches = coll.find(pager, query)?;
            let had_match = !matches.is_empty();
            let before = pick_target(matches, sort);
            // Always ask for the post-image internally so an upsert-insert's
            // id is available for undo bookkeeping regardless of what the
            // caller wants returned.
            let result = coll.find_and_modify(pager, query, sort, update_doc, remove, upsert, true)?;

            if let Some(txn) = txn {
                if remove {
                    if let Some(old_doc) = &result {
                        txn.append_undo(UndoRecord {
                            op: UndoOp::Delete,
                            collection: ns.to_string(),
                            doc_id: old_doc.get("_id").cloned().unwrap_or(Value::Null),
                            old_doc: Some(old_doc.clone()),
                        });
                    }
                } else if had_match {
                    if let Some(old_doc) = before.clone() {
                        txn.append_undo(UndoRecord {
                            op: UndoOp::Update,
                            collection: ns.to_string(),
                            doc_id: old_doc.get("_id").cloned().unwrap_or(Value::Null),
                            old_doc: Some(old_doc),
                        });
                    }
                } else if let Some(new_doc) = &result {
                    txn.append_undo(UndoRecord {
                        op: UndoOp::Insert,
                        collection: ns.to_string(),
                        doc_id: new_doc.get("_id").cloned().unwrap_or(Value::Null),
                        old_doc: None,
                    });
                }
            }

            Ok(if remove {
                result
            } else if had_match {
                if new_image { result } else { before }
            } else if new_image {
                result
            } else {
                None
            })
        })
    }

    pub fn begin_transaction(&self, timeout: Duration) -> Arc<Txn> {
        self.txn_manager.begin(Isolation::Serializable, timeout)
    }

    pub fn commit_transaction(&self, txn: &Arc<Txn>) -> MonoResult<()> {
        {
            let mut pager = self.pager.lock();
            txn.commit(&self.lock_manager, &mut pager)?;
        }
        self.txn_manager.forget(txn.id);
        Ok(())
    }

    pub fn abort_transaction(&self, txn: &Arc<Txn>) -> MonoResult<()> {
        txn.abort(&self.lock_manager, self)?;
        self.txn_manager.forget(txn.id);
        Ok(())
    }

    pub fn aggregate(&self, ns: &str, pipeline: &[Document]) -> MonoResult<Vec<Document>> {
        let docs = self.with_collection(ns, None, |coll, pager| {
            Ok::<_, MonoError>(coll.find(pager, &Document::new())?.into_iter().map(|(_, d)| d).collect::<Vec<_>>())
        })?;
        aggregation::run_pipeline(docs, pipeline, self)
    }
}

impl UndoSink for Engine {
    /// Replays one undo record by applying its logical inverse through
    /// the same `with_collection` path any live mutation uses, so the
    /// catalog stays consistent with whatever page movement the reversal
    /// causes.
    fn apply_undo(&self, record: &UndoRecord) -> MonoResult<()> {
        self.with_collection(&record.collection, None, |coll, pager| {
            let mut id_query = Document::new();
            id_query.insert("_id", record.doc_id.clone());
            match record.op {
                UndoOp::Insert => {
                    coll.delete_many(pager, &id_query)?;
                }
                UndoOp::Delete => {
                    if let Some(old) = &record.old_doc {
                        coll.insert_one(pager, old.clone())?;
                    }
                }
                UndoOp::Update => {
                    if let Some(old) = &record.old_doc {
                        coll.replace_one(pager, &id_query, old.clone())?;
                    }
                }
            }
            Ok(())
        })
    }
}

impl ForeignLookup for Engine {
    fn fetch_all(&self, collection: &str) -> MonoResult<Vec<Document>> {
        self.find(collection, &Document::new(), None, 0, None)
    }
}

fn is_descending(dir: &Value) -> bool {
    dir.as_f64().is_some_and(|n| n < 0.0)
}

fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare(x, y),
    }
}

/// Mirrors `Collection::find_and_modify`'s internal tie-break sort so the
/// engine can observe the same pre-mutation document it will act on.
fn pick_target(mut matches: Vec<(crate::storage::slotted::RecordId, Document)>, sort: Option<&Document>) -> Option<Document> {
    if let Some(sort) = sort {
        matches.sort_by(|a, b| {
            for (field, dir) in sort.iter() {
                let ord = compare_optional(a.1.get_path(field), b.1.get_path(field));
                let ord = if is_descending(dir) { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
    matches.into_iter().next().map(|(_, d)| d)
}

const CATALOG_LEN_PREFIX: usize = 4;

/// Writes `bytes` as a chain of `Catalog`-typed pages starting from
/// `head_page_id` (or a fresh chain if `NO_PAGE`), reusing existing pages
/// in the chain before allocating new ones and freeing any left over.
/// Returns the (possibly unchanged) head page id.
fn write_catalog(pager: &mut Pager, head_page_id: u32, bytes: &[u8]) -> MonoResult<u32> {
    let mut existing = Vec::new();
    let mut page_id = head_page_id;
    while page_id != NO_PAGE {
        let page = pager.read_page(page_id)?;
        existing.push(page_id);
        page_id = page.next_page_id;
    }

    let first_cap = PAGE_PAYLOAD_SIZE - CATALOG_LEN_PREFIX;
    let mut chunks: Vec<&[u8]> = Vec::new();
    if bytes.len() <= first_cap {
        chunks.push(bytes);
    } else {
        chunks.push(&bytes[..first_cap]);
        let mut rest = &bytes[first_cap..];
        while !rest.is_empty() {
            let take = rest.len().min(PAGE_PAYLOAD_SIZE);
            chunks.push(&rest[..take]);
            rest = &rest[take..];
        }
    }

    let mut pages = existing;
    while pages.len() < chunks.len() {
        pages.push(pager.allocate_page(PageType::Catalog)?.page_id);
    }
    let extra: Vec<u32> = pages.split_off(chunks.len());
    for pid in extra {
        pager.free_page(pid)?;
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let mut page = Page::new(pages[i], PageType::Catalog);
        if i == 0 {
            page.payload[0..CATALOG_LEN_PREFIX].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
            page.payload[CATALOG_LEN_PREFIX..CATALOG_LEN_PREFIX + chunk.len()].copy_from_slice(chunk);
        } else {
            page.payload[..chunk.len()].copy_from_slice(chunk);
        }
        page.next_page_id = if i + 1 < pages.len() { pages[i + 1] } else { NO_PAGE };
        pager.write_page(&mut page)?;
    }

    Ok(pages[0])
}

fn read_catalog(pager: &mut Pager, head_page_id: u32) -> MonoResult<Catalog> {
    if head_page_id == NO_PAGE {
        return Ok(Catalog::new());
    }
    let mut bytes = Vec::new();
    let mut total_len = None;
    let mut page_id = head_page_id;
    while page_id != NO_PAGE {
        let page = pager.read_page(page_id)?;
        if let Some(len) = total_len {
            let remaining: usize = len - bytes.len();
            let take = remaining.min(PAGE_PAYLOAD_SIZE);
            bytes.extend_from_slice(&page.payload[..take]);
        } else {
            let len = u32::from_le_bytes(page.payload[0..CATALOG_LEN_PREFIX].try_into().unwrap()) as usize;
            total_len = Some(len);
            let cap = (PAGE_PAYLOAD_SIZE - CATALOG_LEN_PREFIX).min(len);
            bytes.extend_from_slice(&page.payload[CATALOG_LEN_PREFIX..CATALOG_LEN_PREFIX + cap]);
        }
        page_id = page.next_page_id;
    }
    Catalog::decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path().join("t.monodb")).unwrap();
        (dir, engine)
    }

    fn doc(pairs: &[(&str, Value)]) -> Document {
        let mut d = Document::new();
        for (k, v) in pairs {
            d.insert(*k, v.clone());
        }
        d
    }

    #[test]
    fn create_insert_and_find_round_trip() {
        let (_dir, engine) = open_engine();
        engine.create_collection("accounts").unwrap();
        engine.insert_one("accounts", doc(&[("name", Value::String("Alice".into()))]), None).unwrap();
        let found = engine.find("accounts", &Document::new(), None, 0, None).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn unique_index_duplicate_key_is_rejected() {
        let (_dir, engine) = open_engine();
        engine.create_collection("users").unwrap();
        engine
            .create_index("users", vec![KeyField { path: "email".into(), descending: false }], true, "email_1".into())
            .unwrap();
        engine.insert_one("users", doc(&[("email", Value::String("a@x".into()))]), None).unwrap();
        let err = engine.insert_one("users", doc(&[("email", Value::String("a@x".into()))]), None);
        assert!(matches!(err, Err(MonoError::DuplicateKey { .. })));
    }

    #[test]
    fn aborting_a_transaction_rolls_back_its_writes() {
        let (_dir, engine) = open_engine();
        engine.create_collection("ledger").unwrap();
        engine.insert_one("ledger", doc(&[("acct", Value::String("A".into())), ("balance", Value::Int32(100))]), None).unwrap();

        let txn = engine.begin_transaction(Duration::from_secs(5));
        let mut q = Document::new();
        q.insert("acct", Value::String("A".into()));
        let mut dec = Document::new();
        dec.insert("balance", Value::Int32(-30));
        let mut update_doc = Document::new();
        update_doc.insert("$inc", Value::Document(dec));
        engine.update_many("ledger", &q, &update_doc, false, Some(&txn)).unwrap();

        let mid = engine.find("ledger", &q, None, 0, None).unwrap();
        assert_eq!(mid[0].get("balance"), Some(&Value::Int32(70)));

        engine.abort_transaction(&txn).unwrap();

        let after = engine.find("ledger", &q, None, 0, None).unwrap();
        assert_eq!(after[0].get("balance"), Some(&Value::Int32(100)));
    }

    #[test]
    fn committing_a_transaction_keeps_its_writes() {
        let (_dir, engine) = open_engine();
        engine.create_collection("ledger").unwrap();
        let txn = engine.begin_transaction(Duration::from_secs(5));
        engine.insert_one("ledger", doc(&[("n", Value::Int32(1))]), Some(&txn)).unwrap();
        engine.commit_transaction(&txn).unwrap();
        assert_eq!(engine.find("ledger", &Document::new(), None, 0, None).unwrap().len(), 1);
    }

    #[test]
    fn catalog_and_data_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.monodb");
        {
            let engine = Engine::open(&path).unwrap();
            engine.create_collection("users").unwrap();
            engine
                .create_index("users", vec![KeyField { path: "email".into(), descending: false }], true, "email_1".into())
                .unwrap();
            engine.insert_one("users", doc(&[("email", Value::String("a@x".into()))]), None).unwrap();
            engine.flush().unwrap();
        }
        let engine = Engine::open(&path).unwrap();
        assert_eq!(engine.list_collection_names(), vec!["users".to_string()]);
        assert_eq!(engine.list_indexes("users").unwrap().len(), 1);
        let found = engine.find("users", &Document::new(), None, 0, None).unwrap();
        assert_eq!(found.len(), 1);
        // the unique index constraint must still be live after reopen
        let err = engine.insert_one("users", doc(&[("email", Value::String("a@x".into()))]), None);
        assert!(matches!(err, Err(MonoError::DuplicateKey { .. })));
    }

    #[test]
    fn aggregate_runs_the_pipeline_over_the_collection() {
        let (_dir, engine) = open_engine();
        engine.create_collection("sales").unwrap();
        for (region, amount) in [("A", 10), ("B", 5), ("A", 3)] {
            engine
                .insert_one("sales", doc(&[("region", Value::String(region.into())), ("amount", Value::Int32(amount))]), None)
                .unwrap();
        }
        let mut sum_op = Document::new();
        sum_op.insert("$sum", Value::String("$amount".into()));
        let mut group_spec = Document::new();
        group_spec.insert("_id", Value::String("$region".into()));
        group_spec.insert("total", Value::Document(sum_op));
        let mut group_stage = Document::new();
        group_stage.insert("$group", Value::Document(group_spec));

        let out = engine.aggregate("sales", &[group_stage]).unwrap();
        assert_eq!(out.len(), 2);
    }
}
