//! Collection CRUD and the heap/index maintenance that backs it (§4.9).
//!
//! A `Collection` owns a catalog entry by value: callers (the engine) are
//! responsible for persisting the catalog page after a structural change
//! (`create`/`createIndex`/`dropIndex`, or a heap append that grows the
//! tail page) changes `entry`. Atomicity of "mutate page + mutate index"
//! as one logical step is enforced one layer up, by wrapping each
//! `Collection` in its own `parking_lot::Mutex` — the per-collection
//! serial write queue described in §5.

use std::cmp::Ordering;

use crate::bson::compare::compare;
use crate::bson::{decode_document, encode_document, Document, ObjectId, Value};
use crate::btree::BTree;
use crate::catalog::{CollectionEntry, IndexEntry};
use crate::errors::{MonoError, MonoResult};
use crate::keystring::{self, KeyField};
use crate::limits::{MAX_DOCUMENT_SIZE, MAX_NESTING_DEPTH};
use crate::storage::page::PageType;
use crate::storage::pager::{Pager, NO_PAGE};
use crate::storage::slotted::{RecordId, SlottedPage};

use super::filter;
use super::update::apply_update;

pub struct Collection {
    pub entry: CollectionEntry,
}

#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub matched: usize,
    pub modified: usize,
    pub upserted_id: Option<Value>,
}

impl Collection {
    #[must_use]
    pub fn from_entry(entry: CollectionEntry) -> Self {
        Self { entry }
    }

    /// Allocates the heap's first data page and returns a fresh, empty
    /// collection. The caller persists the returned `entry` into the
    /// catalog.
    pub fn create(pager: &mut Pager, name: impl Into<String>) -> MonoResult<Self> {
        let page = pager.allocate_page(PageType::Data)?;
        let entry = CollectionEntry { name: name.into(), root_page_id: page.page_id, head_page_id: page.page_id, indexes: Vec::new() };
        Ok(Self { entry })
    }

    pub fn create_index(&mut self, pager: &mut Pager, key: Vec<KeyField>, unique: bool, name: String) -> MonoResult<()> {
        if self.entry.indexes.iter().any(|i| i.name == name) {
            return Err(MonoError::OperationFailed(format!("index already exists: {name}")));
        }
        let mut tree = BTree::new();
        for (rid, doc) in self.scan_all(pager)? {
            let key_bytes = keystring::encode_composite(&doc, &key);
            tree.insert(pager, &key_bytes, rid, unique).map_err(|_| MonoError::DuplicateKey {
                ns: self.entry.name.clone(),
                index: name.clone(),
                key_value: describe_key_value(&doc, &key),
            })?;
        }
        self.entry.indexes.push(IndexEntry { name, key, unique, root_page_id: tree.root_page_id });
        Ok(())
    }

    pub fn drop_index(&mut self, name: &str) -> MonoResult<()> {
        let before = self.entry.indexes.len();
        self.entry.indexes.retain(|i| i.name != name);
        if self.entry.indexes.len() == before {
            return Err(MonoError::IndexNotFound(name.to_string()));
        }
        Ok(())
    }

    fn scan_all(&self, pager: &mut Pager) -> MonoResult<Vec<(RecordId, Document)>> {
        let mut out = Vec::new();
        let mut page_id = self.entry.head_page_id;
        while page_id != NO_PAGE {
            let mut page = pager.read_page(page_id)?;
            let next = page.next_page_id;
            let sp = SlottedPage::new(&mut page);
            for (slot, bytes) in sp.iter_live() {
                out.push((RecordId { page_id, slot_index: slot }, decode_document(bytes)?));
            }
            page_id = next;
        }
        Ok(out)
    }

    fn append_record(&mut self, pager: &mut Pager, bytes: &[u8]) -> MonoResult<RecordId> {
        let mut tail = pager.read_page(self.entry.root_page_id)?;
        {
            let mut sp = SlottedPage::new(&mut tail);
            if let Ok(slot) = sp.insert_record(bytes) {
                drop(sp);
                pager.write_page(&mut tail)?;
                return Ok(RecordId { page_id: self.entry.root_page_id, slot_index: slot });
            }
        }
        let mut new_page = pager.allocate_page(PageType::Data)?;
        let new_id = new_page.page_id;
        tail.next_page_id = new_id;
        pager.write_page(&mut tail)?;
        let slot = {
            let mut sp = SlottedPage::new(&mut new_page);
            sp.insert_record(bytes)?
        };
        pager.write_page(&mut new_page)?;
        self.entry.root_page_id = new_id;
        Ok(RecordId { page_id: new_id, slot_index: slot })
    }

    fn replace_record(&mut self, pager: &mut Pager, rid: RecordId, bytes: &[u8]) -> MonoResult<()> {
        let mut page = pager.read_page(rid.page_id)?;
        {
            let mut sp = SlottedPage::new(&mut page);
            sp.update_record(rid.slot_index, bytes)?;
        }
        pager.write_page(&mut page)
    }

    fn tombstone_record(&mut self, pager: &mut Pager, rid: RecordId) -> MonoResult<()> {
        let mut page = pager.read_page(rid.page_id)?;
        {
            let mut sp = SlottedPage::new(&mut page);
            sp.delete_record(rid.slot_index)?;
        }
        pager.write_page(&mut page)
    }

    fn index_insert(&mut self, pager: &mut Pager, doc: &Document, rid: RecordId) -> MonoResult<()> {
        let mut applied = Vec::new();
        for i in 0..self.entry.indexes.len() {
            let idx = self.entry.indexes[i].clone();
            let key = keystring::encode_composite(doc, &idx.key);
            let mut tree = BTree::from_root(idx.root_page_id);
            match tree.insert(pager, &key, rid, idx.unique) {
                Ok(()) => {
                    self.entry.indexes[i].root_page_id = tree.root_page_id;
                    applied.push(i);
                }
                Err(_) => {
                    for j in applied {
                        let key_j = keystring::encode_composite(doc, &self.entry.indexes[j].key);
                        let mut t = BTree::from_root(self.entry.indexes[j].root_page_id);
                        let _ = t.delete(pager, &key_j, rid);
                        self.entry.indexes[j].root_page_id = t.root_page_id;
                    }
                    return Err(MonoError::DuplicateKey {
                        ns: self.entry.name.clone(),
                        index: idx.name.clone(),
                        key_value: describe_key_value(doc, &idx.key),
                    });
                }
            }
        }
        Ok(())
    }

    fn index_remove(&mut self, pager: &mut Pager, doc: &Document, rid: RecordId) -> MonoResult<()> {
        for i in 0..self.entry.indexes.len() {
            let key = keystring::encode_composite(doc, &self.entry.indexes[i].key);
            let mut tree = BTree::from_root(self.entry.indexes[i].root_page_id);
            tree.delete(pager, &key, rid)?;
            self.entry.indexes[i].root_page_id = tree.root_page_id;
        }
        Ok(())
    }

    /// Removes an index entry's old key and inserts its new key only for
    /// indexes where the composed key actually changed (§4.9).
    fn index_update(&mut self, pager: &mut Pager, old_doc: &Document, new_doc: &Document, rid: RecordId) -> MonoResult<()> {
        let changed: Vec<(usize, Vec<u8>, Vec<u8>)> = (0..self.entry.indexes.len())
            .filter_map(|i| {
                let old_key = keystring::encode_composite(old_doc, &self.entry.indexes[i].key);
                let new_key = keystring::encode_composite(new_doc, &self.entry.indexes[i].key);
                (old_key != new_key).then_some((i, old_key, new_key))
            })
            .collect();

        for (i, old_key, _) in &changed {
            let mut tree = BTree::from_root(self.entry.indexes[*i].root_page_id);
            tree.delete(pager, old_key, rid)?;
            self.entry.indexes[*i].root_page_id = tree.root_page_id;
        }

        let mut applied = Vec::new();
        for (pos, (i, _, new_key)) in changed.iter().enumerate() {
            let idx = self.entry.indexes[*i].clone();
            let mut tree = BTree::from_root(idx.root_page_id);
            match tree.insert(pager, new_key, rid, idx.unique) {
                Ok(()) => {
                    self.entry.indexes[*i].root_page_id = tree.root_page_id;
                    applied.push(pos);
                }
                Err(_) => {
                    for p in &applied {
                        let (j, _, new_key_j) = &changed[*p];
                        let mut t = BTree::from_root(self.entry.indexes[*j].root_page_id);
                        let _ = t.delete(pager, new_key_j, rid);
                        self.entry.indexes[*j].root_page_id = t.root_page_id;
                    }
                    for (j, old_key_j, _) in &changed {
                        let mut t = BTree::from_root(self.entry.indexes[*j].root_page_id);
                        let _ = t.insert(pager, old_key_j, rid, self.entry.indexes[*j].unique);
                        self.entry.indexes[*j].root_page_id = t.root_page_id;
                    }
                    return Err(MonoError::DuplicateKey {
                        ns: self.entry.name.clone(),
                        index: idx.name.clone(),
                        key_value: describe_key_value(new_doc, &idx.key),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_for_insert(doc: &Document) -> MonoResult<()> {
        if doc.keys().any(|k| k.starts_with('$')) {
            return Err(MonoError::InvalidFieldName("top-level field names must not start with '$'".into()));
        }
        if doc.depth() > MAX_NESTING_DEPTH {
            return Err(MonoError::NestingTooDeep { depth: doc.depth(), limit: MAX_NESTING_DEPTH });
        }
        let size = encode_document(doc).len();
        if size > MAX_DOCUMENT_SIZE {
            return Err(MonoError::DocumentTooLarge { size, limit: MAX_DOCUMENT_SIZE });
        }
        Ok(())
    }

    fn with_generated_id(doc: Document) -> Document {
        if doc.contains_key("_id") {
            return doc;
        }
        let mut with_id = Document::with_capacity(doc.len() + 1);
        with_id.insert("_id", Value::ObjectId(ObjectId::new()));
        for (k, v) in doc.iter() {
            with_id.insert(k, v.clone());
        }
        with_id
    }

    pub fn insert_one(&mut self, pager: &mut Pager, doc: Document) -> MonoResult<(RecordId, Document)> {
        let doc = Self::with_generated_id(doc);
        Self::validate_for_insert(&doc)?;
        let bytes = encode_document(&doc);
        let rid = self.append_record(pager, &bytes)?;
        if let Err(e) = self.index_insert(pager, &doc, rid) {
            self.tombstone_record(pager, rid)?;
            return Err(e);
        }
        Ok((rid, doc))
    }

    /// Inserts each document independently; a failure on one document
    /// does not prevent the rest from being committed (§7's batch-insert
    /// partial-failure semantics).
    pub fn insert_many(&mut self, pager: &mut Pager, docs: Vec<Document>) -> (Vec<(RecordId, Document)>, Vec<(usize, MonoError)>) {
        let mut ok = Vec::with_capacity(docs.len());
        let mut errs = Vec::new();
        for (i, doc) in docs.into_iter().enumerate() {
            match self.insert_one(pager, doc) {
                Ok(pair) => ok.push(pair),
                Err(e) => errs.push((i, e)),
            }
        }
        (ok, errs)
    }

    pub fn find(&self, pager: &mut Pager, query: &Document) -> MonoResult<Vec<(RecordId, Document)>> {
        Ok(self.scan_all(pager)?.into_iter().filter(|(_, doc)| filter::matches(doc, query)).collect())
    }

    pub fn count(&self, pager: &mut Pager, query: &Document) -> MonoResult<usize> {
        Ok(self.find(pager, query)?.len())
    }

    pub fn distinct(&self, pager: &mut Pager, field: &str, query: &Document) -> MonoResult<Vec<Value>> {
        let mut out: Vec<Value> = Vec::new();
        for (_, doc) in self.find(pager, query)? {
            if let Some(v) = doc.get_path(field) {
                if !out.iter().any(|existing| compare(existing, v) == Ordering::Equal) {
                    out.push(v.clone());
                }
            }
        }
        Ok(out)
    }

    pub fn update_many(
        &mut self,
        pager: &mut Pager,
        query: &Document,
        update_doc: &Document,
        upsert: bool,
    ) -> MonoResult<UpdateOutcome> {
        let matches = self.find(pager, query)?;
        if matches.is_empty() {
            if !upsert {
                return Ok(UpdateOutcome::default());
            }
            let base = synthesize_upsert_doc(query);
            let mut synthesized = base;
            apply_update(&mut synthesized, update_doc, true)?;
            let (_, inserted) = self.insert_one(pager, synthesized)?;
            let id = inserted.get("_id").cloned();
            return Ok(UpdateOutcome { matched: 0, modified: 1, upserted_id: id });
        }

        let matched = matches.len();
        let mut modified = 0;
        for (rid, old_doc) in matches {
            let mut new_doc = old_doc.clone();
            apply_update(&mut new_doc, update_doc, false)?;
            if new_doc == old_doc {
                continue;
            }
            let bytes = encode_document(&new_doc);
            self.replace_record(pager, rid, &bytes)?;
            self.index_update(pager, &old_doc, &new_doc, rid)?;
            modified += 1;
        }
        Ok(UpdateOutcome { matched, modified, upserted_id: None })
    }

    pub fn replace_one(&mut self, pager: &mut Pager, query: &Document, replacement: Document) -> MonoResult<UpdateOutcome> {
        let matches = self.find(pager, query)?;
        let Some((rid, old_doc)) = matches.into_iter().next() else {
            return Ok(UpdateOutcome::default());
        };
        let mut new_doc = replacement;
        if let Some(id) = old_doc.get("_id") {
            new_doc.insert("_id", id.clone());
        }
        Self::validate_for_insert(&new_doc)?;
        let bytes = encode_document(&new_doc);
        self.replace_record(pager, rid, &bytes)?;
        self.index_update(pager, &old_doc, &new_doc, rid)?;
        Ok(UpdateOutcome { matched: 1, modified: 1, upserted_id: None })
    }

    pub fn delete_many(&mut self, pager: &mut Pager, query: &Document) -> MonoResult<usize> {
        let matches = self.find(pager, query)?;
        let count = matches.len();
        for (rid, doc) in matches {
            self.tombstone_record(pager, rid)?;
            self.index_remove(pager, &doc, rid)?;
        }
        Ok(count)
    }

    /// `sort` breaks ties among multiple matches; `new_image` selects
    /// whether the pre- or post-mutation document is returned.
    pub fn find_and_modify(
        &mut self,
        pager: &mut Pager,
        query: &Document,
        sort: Option<&Document>,
        update_doc: Option<&Document>,
        remove: bool,
        upsert: bool,
        new_image: bool,
    ) -> MonoResult<Option<Document>> {
        let mut matches = self.find(pager, query)?;
        if let Some(sort) = sort {
            sort_documents(&mut matches, sort);
        }

        let Some((rid, old_doc)) = matches.into_iter().next() else {
            if remove || update_doc.is_none() || !upsert {
                return Ok(None);
            }
            let base = synthesize_upsert_doc(query);
            let mut synthesized = base;
            apply_update(&mut synthesized, update_doc.expect("checked above"), true)?;
            let (_, inserted) = self.insert_one(pager, synthesized)?;
            return Ok(new_image.then_some(inserted));
        };

        if remove {
            self.tombstone_record(pager, rid)?;
            self.index_remove(pager, &old_doc, rid)?;
            return Ok(Some(old_doc));
        }

        let update_doc = update_doc.ok_or_else(|| MonoError::InvalidArgument("findAndModify requires update or remove".into()))?;
        let mut new_doc = old_doc.clone();
        apply_update(&mut new_doc, update_doc, false)?;
        let bytes = encode_document(&new_doc);
        self.replace_record(pager, rid, &bytes)?;
        self.index_update(pager, &old_doc, &new_doc, rid)?;
        Ok(Some(if new_image { new_doc } else { old_doc }))
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

fn sort_documents(docs: &mut [(RecordId, Document)], sort: &Document) {
    docs.sort_by(|a, b| {
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

/// Builds an upsert seed document from a filter's literal equality
/// constraints, skipping logical/comparison operator clauses (§4.9).
fn synthesize_upsert_doc(query: &Document) -> Document {
    let mut doc = Document::new();
    for (key, val) in query.iter() {
        if key.starts_with('$') {
            continue;
        }
        if let Value::Document(d) = val {
            if d.iter().next().is_some_and(|(op, _)| op.starts_with('$')) {
                continue;
            }
        }
        doc.set_path(key, val.clone());
    }
    doc
}

fn describe_key_value(doc: &Document, spec: &[KeyField]) -> String {
    let parts: Vec<String> =
        spec.iter().map(|f| format!("{}: {}", f.path, format_value(doc.get_path(&f.path)))).collect();
    format!("{{ {} }}", parts.join(", "))
}

fn format_value(v: Option<&Value>) -> String {
    match v {
        None => "null".to_string(),
        Some(Value::String(s)) => format!("\"{s}\""),
        Some(Value::Int32(i)) => i.to_string(),
        Some(Value::Int64(i)) => i.to_string(),
        Some(Value::Double(d)) => d.to_string(),
        Some(Value::Boolean(b)) => b.to_string(),
        Some(other) => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystring::KeyField;
    use tempfile::tempdir;

    fn open_pager() -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("t.monodb")).unwrap();
        (dir, pager)
    }

    fn doc(pairs: &[(&str, Value)]) -> Document {
        let mut d = Document::new();
        for (k, v) in pairs {
            d.insert(*k, v.clone());
        }
        d
    }

    #[test]
    fn insert_generates_id_and_find_returns_it() {
        let (_dir, mut pager) = open_pager();
        let mut coll = Collection::create(&mut pager, "users").unwrap();
        coll.insert_one(&mut pager, doc(&[("name", Value::String("Alice".into())), ("age", Value::Int32(25))])).unwrap();
        let mut q = Document::new();
        let mut gt = Document::new();
        gt.insert("$gt", Value::Int32(20));
        q.insert("age", Value::Document(gt));
        let results = coll.find(&mut pager, &q).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.contains_key("_id"));
    }

    #[test]
    fn unique_index_rejects_second_insert_with_same_key() {
        let (_dir, mut pager) = open_pager();
        let mut coll = Collection::create(&mut pager, "users").unwrap();
        coll.create_index(&mut pager, vec![KeyField { path: "email".into(), descending: false }], true, "email_1".into()).unwrap();
        coll.insert_one(&mut pager, doc(&[("email", Value::String("a@x".into()))])).unwrap();
        let err = coll.insert_one(&mut pager, doc(&[("email", Value::String("a@x".into()))]));
        assert!(matches!(err, Err(MonoError::DuplicateKey { .. })));
        // the rejected insert must not have left a dangling data record
        assert_eq!(coll.find(&mut pager, &Document::new()).unwrap().len(), 1);
    }

    #[test]
    fn update_in_place_changes_matching_fields() {
        let (_dir, mut pager) = open_pager();
        let mut coll = Collection::create(&mut pager, "users").unwrap();
        coll.insert_one(&mut pager, doc(&[("n", Value::Int32(1))])).unwrap();
        let mut inc_fields = Document::new();
        inc_fields.insert("n", Value::Int32(1));
        let mut update_doc = Document::new();
        update_doc.insert("$inc", Value::Document(inc_fields));
        let outcome = coll.update_many(&mut pager, &Document::new(), &update_doc, false).unwrap();
        assert_eq!(outcome.modified, 1);
        let results = coll.find(&mut pager, &Document::new()).unwrap();
        assert_eq!(results[0].1.get("n"), Some(&Value::Int32(2)));
    }

    #[test]
    fn upsert_synthesizes_document_from_filter() {
        let (_dir, mut pager) = open_pager();
        let mut coll = Collection::create(&mut pager, "users").unwrap();
        let mut q = Document::new();
        q.insert("sku", Value::String("abc".into()));
        let mut set_fields = Document::new();
        set_fields.insert("qty", Value::Int32(5));
        let mut update_doc = Document::new();
        update_doc.insert("$set", Value::Document(set_fields));
        let outcome = coll.update_many(&mut pager, &q, &update_doc, true).unwrap();
        assert!(outcome.upserted_id.is_some());
        let results = coll.find(&mut pager, &Document::new()).unwrap();
        assert_eq!(results[0].1.get("sku"), Some(&Value::String("abc".into())));
        assert_eq!(results[0].1.get("qty"), Some(&Value::Int32(5)));
    }

    #[test]
    fn delete_removes_document_and_index_entry() {
        let (_dir, mut pager) = open_pager();
        let mut coll = Collection::create(&mut pager, "users").unwrap();
        coll.create_index(&mut pager, vec![KeyField { path: "email".into(), descending: false }], true, "email_1".into()).unwrap();
        coll.insert_one(&mut pager, doc(&[("email", Value::String("a@x".into()))])).unwrap();
        let mut q = Document::new();
        q.insert("email", Value::String("a@x".into()));
        let deleted = coll.delete_many(&mut pager, &q).unwrap();
        assert_eq!(deleted, 1);
        assert!(coll.find(&mut pager, &Document::new()).unwrap().is_empty());
        // the key is free again
        coll.insert_one(&mut pager, doc(&[("email", Value::String("a@x".into()))])).unwrap();
    }

    #[test]
    fn find_and_modify_honors_sort_and_new_flag() {
        let (_dir, mut pager) = open_pager();
        let mut coll = Collection::create(&mut pager, "users").unwrap();
        coll.insert_one(&mut pager, doc(&[("n", Value::Int32(3))])).unwrap();
        coll.insert_one(&mut pager, doc(&[("n", Value::Int32(1))])).unwrap();
        let mut sort = Document::new();
        sort.insert("n", Value::Int32(1));
        let mut set_fields = Document::new();
        set_fields.insert("touched", Value::Boolean(true));
        let mut update_doc = Document::new();
        update_doc.insert("$set", Value::Document(set_fields));
        let result =
            coll.find_and_modify(&mut pager, &Document::new(), Some(&sort), Some(&update_doc), false, false, true).unwrap();
        assert_eq!(result.unwrap().get("n"), Some(&Value::Int32(1)));
    }
}
