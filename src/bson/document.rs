//! `Document` — an order-preserving BSON key/value sequence. Insertion
//! order is preserved and equality is order-sensitive, per §3.

use super::value::Value;

#[derive(Debug, Clone, Default)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self { entries: Vec::with_capacity(cap) }
    }

    /// Inserts or replaces a key, preserving its original position on
    /// replace and appending on first insertion (MongoDB document
    /// semantics; `$set`/`$rename` rely on this to keep stable field order).
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.push((key, value));
        None
    }

    /// Appends a key unconditionally, even if it duplicates an existing
    /// key. Used only by the decoder, which must preserve whatever was on
    /// the wire rather than de-duplicate it.
    pub(crate) fn push_raw(&mut self, key: String, value: Value) {
        self.entries.push((key, value));
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Removes a key, shifting later entries left (preserves order of the
    /// remaining fields, matching `$unset` semantics).
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Resolves a dotted path (`a.b.c`) through nested documents only
    /// (array indices are not traversed here; filter/update evaluation
    /// handles array fan-out separately per §4.9).
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut cur = self.get(first)?;
        for part in parts {
            match cur {
                Value::Document(d) => cur = d.get(part)?,
                _ => return None,
            }
        }
        Some(cur)
    }

    /// Sets a dotted path, creating intermediate documents as needed, per
    /// §4.9's update-operator contract.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let parts: Vec<&str> = path.split('.').collect();
        Self::set_path_rec(self, &parts, value);
    }

    fn set_path_rec(doc: &mut Self, parts: &[&str], value: Value) {
        let Some((head, rest)) = parts.split_first() else { return };
        if rest.is_empty() {
            doc.insert((*head).to_string(), value);
            return;
        }
        match doc.get_mut(head) {
            Some(Value::Document(inner)) => Self::set_path_rec(inner, rest, value),
            _ => {
                let mut inner = Self::new();
                Self::set_path_rec(&mut inner, rest, value);
                doc.insert((*head).to_string(), Value::Document(inner));
            }
        }
    }

    /// Removes a dotted path if present.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        let parts: Vec<&str> = path.split('.').collect();
        Self::remove_path_rec(self, &parts)
    }

    fn remove_path_rec(doc: &mut Self, parts: &[&str]) -> Option<Value> {
        let (head, rest) = parts.split_first()?;
        if rest.is_empty() {
            return doc.remove(head);
        }
        match doc.get_mut(head) {
            Some(Value::Document(inner)) => Self::remove_path_rec(inner, rest),
            _ => None,
        }
    }

    /// Maximum nesting depth across documents and arrays, used to enforce
    /// the 100-level limit on insert (§4.9).
    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.entries.iter().map(|(_, v)| value_depth(v)).max().unwrap_or(0)
    }
}

fn value_depth(v: &Value) -> usize {
    match v {
        Value::Document(d) => d.depth(),
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().zip(other.entries.iter()).all(|(a, b)| a.0 == b.0 && a.1 == b.1)
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut doc = Self::new();
        for (k, v) in iter {
            doc.push_raw(k, v);
        }
        doc
    }
}
