//! Expression resolution and single-stage execution (§4.10). Every stage
//! implements `execute(docs) -> docs`; `mod.rs` left-folds the pipeline
//! over these functions.

use crate::bson::compare::compare;
use crate::bson::{Document, Value};
use crate::collection::filter;
use crate::errors::{MonoError, MonoResult};
use std::cmp::Ordering;

/// Resolves an aggregation expression against the current document.
/// `"$field.path"` addresses a document field; a single-key document whose
/// key starts with `$` is an operator call; anything else is a literal,
/// resolved recursively through nested documents/arrays.
pub fn resolve_expr(doc: &Document, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
            doc.get_path(&s[1..]).cloned().unwrap_or(Value::Null)
        }
        Value::Document(d) if d.len() == 1 && d.iter().next().is_some_and(|(k, _)| k.starts_with('$')) => {
            let (op, arg) = d.iter().next().unwrap();
            eval_operator(doc, op, arg)
        }
        Value::Document(d) => {
            let mut out = Document::with_capacity(d.len());
            for (k, v) in d.iter() {
                out.insert(k, resolve_expr(doc, v));
            }
            Value::Document(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_expr(doc, v)).collect()),
        other => other.clone(),
    }
}

fn resolve_array_arg(doc: &Document, arg: &Value) -> Vec<Value> {
    match resolve_expr(doc, arg) {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn numeric_fold(doc: &Document, arg: &Value, identity: f64, f: impl Fn(f64, f64) -> f64) -> Value {
    let items = resolve_array_arg(doc, arg);
    let mut acc = identity;
    let mut first = true;
    for item in &items {
        let Some(n) = item.as_f64() else { return Value::Null };
        acc = if first { n } else { f(acc, n) };
        first = false;
    }
    Value::Double(acc)
}

fn eval_operator(doc: &Document, op: &str, arg: &Value) -> Value {
    match op {
        "$literal" => arg.clone(),
        "$add" => numeric_fold(doc, arg, 0.0, |a, b| a + b),
        "$multiply" => numeric_fold(doc, arg, 1.0, |a, b| a * b),
        "$subtract" => match resolve_array_arg(doc, arg).as_slice() {
            [a, b] => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => Value::Double(a - b),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        "$divide" => match resolve_array_arg(doc, arg).as_slice() {
            [a, b] => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) if b != 0.0 => Value::Double(a / b),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        "$mod" => match resolve_array_arg(doc, arg).as_slice() {
            [a, b] => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) if b != 0.0 => Value::Double(a % b),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        "$concat" => {
            let items = resolve_array_arg(doc, arg);
            let mut out = String::new();
            for item in &items {
                match item {
                    Value::String(s) => out.push_str(s),
                    Value::Null => return Value::Null,
                    other => out.push_str(&format!("{other:?}")),
                }
            }
            Value::String(out)
        }
        "$toUpper" => match resolve_expr(doc, arg) {
            Value::String(s) => Value::String(s.to_uppercase()),
            _ => Value::Null,
        },
        "$toLower" => match resolve_expr(doc, arg) {
            Value::String(s) => Value::String(s.to_lowercase()),
            _ => Value::Null,
        },
        "$trim" => match resolve_expr(doc, arg) {
            Value::String(s) => Value::String(s.trim().to_string()),
            _ => Value::Null,
        },
        "$size" => match resolve_expr(doc, arg) {
            Value::Array(items) => Value::Int32(items.len() as i32),
            _ => Value::Null,
        },
        "$ifNull" => match resolve_array_arg(doc, arg).as_slice() {
            [a, b, ..] => if matches!(a, Value::Null) { b.clone() } else { a.clone() },
            _ => Value::Null,
        },
        "$cond" => eval_cond(doc, arg),
        "$eq" => bool_compare(doc, arg, |o| o == Ordering::Equal),
        "$ne" => bool_compare(doc, arg, |o| o != Ordering::Equal),
        "$gt" => bool_compare(doc, arg, |o| o == Ordering::Greater),
        "$gte" => bool_compare(doc, arg, |o| o != Ordering::Less),
        "$lt" => bool_compare(doc, arg, |o| o == Ordering::Less),
        "$lte" => bool_compare(doc, arg, |o| o != Ordering::Greater),
        "$and" => Value::Boolean(resolve_array_arg(doc, arg).iter().all(truthy)),
        "$or" => Value::Boolean(resolve_array_arg(doc, arg).iter().any(truthy)),
        "$not" => match resolve_array_arg(doc, arg).as_slice() {
            [a] => Value::Boolean(!truthy(a)),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn bool_compare(doc: &Document, arg: &Value, pred: impl Fn(Ordering) -> bool) -> Value {
    match resolve_array_arg(doc, arg).as_slice() {
        [a, b] => Value::Boolean(pred(compare(a, b))),
        _ => Value::Null,
    }
}

fn truthy(v: &Value) -> bool {
    !matches!(v, Value::Null | Value::Boolean(false))
}

fn eval_cond(doc: &Document, arg: &Value) -> Value {
    let (cond, then, else_) = match arg {
        Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
        Value::Document(d) => {
            let cond = d.get("if");
            let then = d.get("then");
            let else_ = d.get("else");
            match (cond, then, else_) {
                (Some(c), Some(t), Some(e)) => {
                    return if truthy(&resolve_expr(doc, c)) { resolve_expr(doc, t) } else { resolve_expr(doc, e) };
                }
                _ => return Value::Null,
            }
        }
        _ => return Value::Null,
    };
    if truthy(&resolve_expr(doc, cond)) { resolve_expr(doc, then) } else { resolve_expr(doc, else_) }
}

pub fn stage_match(docs: Vec<Document>, filter_doc: &Document) -> Vec<Document> {
    docs.into_iter().filter(|d| filter::matches(d, filter_doc)).collect()
}

pub fn stage_project(docs: Vec<Document>, spec: &Document) -> MonoResult<Vec<Document>> {
    let exclusion = spec.iter().all(|(k, v)| k == "_id" || matches!(v, Value::Int32(0) | Value::Boolean(false)));
    let suppress_id = matches!(spec.get("_id"), Some(Value::Int32(0)) | Some(Value::Boolean(false)));
    docs.into_iter()
        .map(|doc| {
            if exclusion && spec.iter().any(|(k, _)| k != "_id") {
                let mut out = doc.clone();
                for (k, _) in spec.iter() {
                    if k != "_id" {
                        out.remove_path(k);
                    }
                }
                if suppress_id {
                    out.remove("_id");
                }
                Ok(out)
            } else {
                let mut out = Document::new();
                if !suppress_id {
                    if let Some(id) = doc.get("_id") {
                        out.insert("_id", id.clone());
                    }
                }
                for (k, v) in spec.iter() {
                    if k == "_id" {
                        continue;
                    }
                    match v {
                        Value::Int32(1) | Value::Boolean(true) => {
                            if let Some(existing) = doc.get_path(k) {
                                out.set_path(k, existing.clone());
                            }
                        }
                        Value::Int32(0) | Value::Boolean(false) => {}
                        expr => out.set_path(k, resolve_expr(&doc, expr)),
                    }
                }
                Ok(out)
            }
        })
        .collect()
}

pub fn stage_add_fields(docs: Vec<Document>, spec: &Document) -> Vec<Document> {
    docs.into_iter()
        .map(|mut doc| {
            for (k, expr) in spec.iter() {
                let resolved = resolve_expr(&doc, expr);
                doc.set_path(k, resolved);
            }
            doc
        })
        .collect()
}

pub fn stage_unset(docs: Vec<Document>, fields: &[String]) -> Vec<Document> {
    docs.into_iter()
        .map(|mut doc| {
            for f in fields {
                doc.remove_path(f);
            }
            doc
        })
        .collect()
}

pub fn stage_replace_root(docs: Vec<Document>, expr: &Value) -> MonoResult<Vec<Document>> {
    docs.into_iter()
        .map(|doc| match resolve_expr(&doc, expr) {
            Value::Document(new_root) => Ok(new_root),
            _ => Err(MonoError::InvalidArgument("$replaceRoot expression must resolve to a document".into())),
        })
        .collect()
}

pub fn stage_unwind(docs: Vec<Document>, path: &str, preserve_empty: bool, include_index: Option<&str>) -> Vec<Document> {
    let mut out = Vec::new();
    for doc in docs {
        match doc.get_path(path) {
            Some(Value::Array(items)) if !items.is_empty() => {
                for (i, item) in items.iter().enumerate() {
                    let mut copy = doc.clone();
                    copy.set_path(path, item.clone());
                    if let Some(idx_field) = include_index {
                        copy.set_path(idx_field, Value::Int32(i as i32));
                    }
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | None => {
                if preserve_empty {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    out
}

pub fn stage_sort(mut docs: Vec<Document>, spec: &Document) -> Vec<Document> {
    docs.sort_by(|a, b| {
        for (field, dir) in spec.iter() {
            let descending = matches!(dir, Value::Int32(-1)) || dir.as_f64().is_some_and(|n| n < 0.0);
            let ord = compare_optional(a.get_path(field), b.get_path(field));
            let ord = if descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    docs
}

fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare(a, b),
    }
}

pub fn stage_skip(docs: Vec<Document>, n: usize) -> Vec<Document> {
    docs.into_iter().skip(n).collect()
}

pub fn stage_limit(docs: Vec<Document>, n: usize) -> Vec<Document> {
    docs.into_iter().take(n).collect()
}

pub fn stage_count(docs: Vec<Document>, field: &str) -> Vec<Document> {
    let mut out = Document::new();
    out.insert(field, Value::Int32(docs.len() as i32));
    vec![out]
}

struct GroupBucket {
    id: Value,
    doc: Document,
    sums: std::collections::HashMap<String, f64>,
    counts: std::collections::HashMap<String, usize>,
}

/// `$group` over `_id` plus the accumulators named in the spec: `$sum`,
/// `$avg`, `$min`, `$max`, `$first`, `$last`, `$count`, `$push`, `$addToSet`.
pub fn stage_group(docs: Vec<Document>, spec: &Document) -> MonoResult<Vec<Document>> {
    let id_expr = spec.get("_id").ok_or_else(|| MonoError::InvalidArgument("$group requires _id".into()))?;
    let accumulators: Vec<(&str, &str, &Value)> = spec
        .iter()
        .filter(|(k, _)| *k != "_id")
        .map(|(k, v)| match v {
            Value::Document(d) if d.len() == 1 => {
                let (op, arg) = d.iter().next().unwrap();
                (k, op, arg)
            }
            _ => (k, "$last", v),
        })
        .collect();

    let mut buckets: Vec<GroupBucket> = Vec::new();
    for doc in &docs {
        let id = resolve_expr(doc, id_expr);
        let bucket = match buckets.iter_mut().find(|b| compare(&b.id, &id) == Ordering::Equal) {
            Some(b) => b,
            None => {
                let mut out_doc = Document::new();
                out_doc.insert("_id", id.clone());
                buckets.push(GroupBucket {
                    id: id.clone(),
                    doc: out_doc,
                    sums: std::collections::HashMap::new(),
                    counts: std::collections::HashMap::new(),
                });
                buckets.last_mut().unwrap()
            }
        };
        for (out_field, op, arg) in &accumulators {
            apply_accumulator(bucket, out_field, op, arg, doc);
        }
    }
    Ok(buckets.into_iter().map(|b| b.doc).collect())
}

fn apply_accumulator(bucket: &mut GroupBucket, out_field: &str, op: &str, arg: &Value, doc: &Document) {
    let resolved = resolve_expr(doc, arg);
    match op {
        "$sum" => {
            let delta = resolved.as_f64().unwrap_or(0.0);
            let acc = bucket.sums.entry(out_field.to_string()).or_insert(0.0);
            *acc += delta;
            bucket.doc.set_path(out_field, numeric_result(*acc));
        }
        "$avg" => {
            let delta = resolved.as_f64().unwrap_or(0.0);
            let sum = bucket.sums.entry(out_field.to_string()).or_insert(0.0);
            *sum += delta;
            let count = bucket.counts.entry(out_field.to_string()).or_insert(0);
            *count += 1;
            bucket.doc.set_path(out_field, Value::Double(*sum / *count as f64));
        }
        "$min" => match bucket.doc.get_path(out_field) {
            Some(existing) if compare(existing, &resolved) != Ordering::Greater => {}
            _ => bucket.doc.set_path(out_field, resolved),
        },
        "$max" => match bucket.doc.get_path(out_field) {
            Some(existing) if compare(existing, &resolved) != Ordering::Less => {}
            _ => bucket.doc.set_path(out_field, resolved),
        },
        "$first" => {
            if bucket.doc.get_path(out_field).is_none() {
                bucket.doc.set_path(out_field, resolved);
            }
        }
        "$last" => bucket.doc.set_path(out_field, resolved),
        "$count" => {
            let count = bucket.counts.entry(out_field.to_string()).or_insert(0);
            *count += 1;
            bucket.doc.set_path(out_field, Value::Int32(*count as i32));
        }
        "$push" => {
            let mut arr = match bucket.doc.get_path(out_field) {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            arr.push(resolved);
            bucket.doc.set_path(out_field, Value::Array(arr));
        }
        "$addToSet" => {
            let mut arr = match bucket.doc.get_path(out_field) {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            if !arr.iter().any(|v| compare(v, &resolved) == Ordering::Equal) {
                arr.push(resolved);
            }
            bucket.doc.set_path(out_field, Value::Array(arr));
        }
        _ => {}
    }
}

fn numeric_result(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < f64::from(i32::MAX) { Value::Int32(v as i32) } else { Value::Double(v) }
}

/// `$lookup`'s equality join: every document in `foreign` whose
/// `foreign_field` equals this document's `local_field` is collected into
/// an array stored at `as_field`. `foreign` is fetched once by the caller.
pub fn stage_lookup(docs: Vec<Document>, local_field: &str, foreign: &[Document], foreign_field: &str, as_field: &str) -> Vec<Document> {
    docs.into_iter()
        .map(|mut doc| {
            let local = doc.get_path(local_field).cloned();
            let matched: Vec<Value> = foreign
                .iter()
                .filter(|f| match (&local, f.get_path(foreign_field)) {
                    (Some(l), Some(r)) => compare(l, r) == Ordering::Equal,
                    _ => false,
                })
                .map(|f| Value::Document(f.clone()))
                .collect();
            doc.set_path(as_field, Value::Array(matched));
            doc
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_from(pairs: &[(&str, Value)]) -> Document {
        let mut d = Document::new();
        for (k, v) in pairs {
            d.insert(*k, v.clone());
        }
        d
    }

    #[test]
    fn group_sum_and_sort_and_limit_matches_literal_scenario() {
        let docs = vec![
            doc_from(&[("status", Value::String("active".into())), ("region", Value::String("A".into())), ("amount", Value::Int32(10))]),
            doc_from(&[("status", Value::String("active".into())), ("region", Value::String("B".into())), ("amount", Value::Int32(5))]),
            doc_from(&[("status", Value::String("active".into())), ("region", Value::String("A".into())), ("amount", Value::Int32(3))]),
            doc_from(&[("status", Value::String("inactive".into())), ("region", Value::String("A".into())), ("amount", Value::Int32(100))]),
        ];

        let mut match_filter = Document::new();
        match_filter.insert("status", Value::String("active".into()));
        let matched = stage_match(docs, &match_filter);

        let mut group_spec = Document::new();
        group_spec.insert("_id", Value::String("$region".into()));
        let mut sum_op = Document::new();
        sum_op.insert("$sum", Value::String("$amount".into()));
        let mut total = Document::new();
        total.insert("total", Value::Document(sum_op));
        for (k, v) in total.iter() {
            group_spec.insert(k, v.clone());
        }
        let grouped = stage_group(matched, &group_spec).unwrap();

        let mut sort_spec = Document::new();
        sort_spec.insert("total", Value::Int32(-1));
        let sorted = stage_sort(grouped, &sort_spec);
        let limited = stage_limit(sorted, 2);

        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].get("_id"), Some(&Value::String("A".into())));
        assert_eq!(limited[0].get("total"), Some(&Value::Int32(13)));
        assert_eq!(limited[1].get("_id"), Some(&Value::String("B".into())));
        assert_eq!(limited[1].get("total"), Some(&Value::Int32(5)));
    }

    #[test]
    fn unwind_fans_out_array_elements() {
        let doc = doc_from(&[("tags", Value::Array(vec![Value::String("a".into()), Value::String("b".into())]))]);
        let out = stage_unwind(vec![doc], "tags", false, None);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("tags"), Some(&Value::String("a".into())));
    }

    #[test]
    fn project_inclusion_keeps_id_by_default() {
        let mut doc = Document::new();
        doc.insert("_id", Value::Int32(1));
        doc.insert("a", Value::Int32(2));
        doc.insert("b", Value::Int32(3));
        let mut spec = Document::new();
        spec.insert("a", Value::Int32(1));
        let out = stage_project(vec![doc], &spec).unwrap();
        assert_eq!(out[0].get("_id"), Some(&Value::Int32(1)));
        assert_eq!(out[0].get("a"), Some(&Value::Int32(2)));
        assert_eq!(out[0].get("b"), None);
    }
}
