//! Filter-document evaluation (§4.9): `$and/$or/$nor` compose logically
//! at the top level; every other top-level field addresses a dotted
//! document path, matched either by equality or by an operator
//! sub-document. Array fields match if any element matches.

use crate::bson::compare::compare;
use crate::bson::{Document, Value};
use std::cmp::Ordering;

/// Evaluates a filter document against `doc`. Multiple top-level fields
/// are implicitly ANDed.
#[must_use]
pub fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, val)| match key {
        "$and" => as_array(val).is_some_and(|subs| subs.iter().all(|s| sub_matches(doc, s))),
        "$or" => as_array(val).is_some_and(|subs| subs.iter().any(|s| sub_matches(doc, s))),
        "$nor" => as_array(val).is_some_and(|subs| !subs.iter().any(|s| sub_matches(doc, s))),
        _ => match_value(doc.get_path(key), val),
    })
}

fn sub_matches(doc: &Document, v: &Value) -> bool {
    match v {
        Value::Document(d) => matches(doc, d),
        _ => false,
    }
}

fn as_array(v: &Value) -> Option<&Vec<Value>> {
    match v {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

fn is_operator_document(d: &Document) -> bool {
    d.iter().next().is_some_and(|(k, _)| k.starts_with('$'))
}

/// Matches a single resolved value (which may be absent) against an
/// `expected` clause: either an operator sub-document or a plain value
/// for equality.
fn match_value(raw: Option<&Value>, expected: &Value) -> bool {
    match expected {
        Value::Document(d) if is_operator_document(d) => eval_operators(raw, d),
        _ => values_equal_with_array_fanout(raw, expected),
    }
}

fn values_equal_with_array_fanout(raw: Option<&Value>, expected: &Value) -> bool {
    let Some(v) = raw else { return matches!(expected, Value::Null) };
    if compare(v, expected) == Ordering::Equal {
        return true;
    }
    if let Value::Array(items) = v {
        return items.iter().any(|item| compare(item, expected) == Ordering::Equal);
    }
    false
}

fn eval_operators(raw: Option<&Value>, ops: &Document) -> bool {
    ops.iter().all(|(op, val)| eval_one_operator(raw, op, val))
}

fn any_element_or_self(raw: Option<&Value>, pred: impl Fn(&Value) -> bool) -> bool {
    let Some(v) = raw else { return false };
    if pred(v) {
        return true;
    }
    if let Value::Array(items) = v {
        return items.iter().any(|it| pred(it));
    }
    false
}

fn eval_one_operator(raw: Option<&Value>, op: &str, val: &Value) -> bool {
    match op {
        "$eq" => values_equal_with_array_fanout(raw, val),
        "$ne" => !values_equal_with_array_fanout(raw, val),
        "$gt" => any_element_or_self(raw, |v| compare(v, val) == Ordering::Greater),
        "$gte" => any_element_or_self(raw, |v| compare(v, val) != Ordering::Less),
        "$lt" => any_element_or_self(raw, |v| compare(v, val) == Ordering::Less),
        "$lte" => any_element_or_self(raw, |v| compare(v, val) != Ordering::Greater),
        "$in" => as_array(val).is_some_and(|opts| opts.iter().any(|o| values_equal_with_array_fanout(raw, o))),
        "$nin" => as_array(val).is_none_or(|opts| !opts.iter().any(|o| values_equal_with_array_fanout(raw, o))),
        "$exists" => raw.is_some() == matches!(val, Value::Boolean(true)),
        "$type" => raw.is_some_and(|v| type_name(v) == expected_type_name(val)),
        "$mod" => eval_mod(raw, val),
        "$size" => match raw {
            Some(Value::Array(items)) => val.as_f64().is_some_and(|n| items.len() as f64 == n),
            _ => false,
        },
        "$all" => eval_all(raw, val),
        "$elemMatch" => eval_elem_match(raw, val),
        "$regex" => eval_regex(raw, val, None),
        "$not" => !match_value(raw, val),
        _ => false,
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Double(_) => "double",
        Value::String(_) => "string",
        Value::Document(_) => "object",
        Value::Array(_) => "array",
        Value::Binary(_, _) => "binData",
        Value::ObjectId(_) => "objectId",
        Value::Boolean(_) => "bool",
        Value::DateTime(_) => "date",
        Value::Null => "null",
        Value::Regex { .. } => "regex",
        Value::Int32(_) => "int",
        Value::Int64(_) => "long",
        Value::Timestamp { .. } => "timestamp",
        Value::Decimal128(_) => "decimal",
        Value::MinKey => "minKey",
        Value::MaxKey => "maxKey",
    }
}

fn expected_type_name(val: &Value) -> String {
    match val {
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

fn eval_mod(raw: Option<&Value>, val: &Value) -> bool {
    let Value::Array(pair) = val else { return false };
    let [divisor, remainder] = pair.as_slice() else { return false };
    let (Some(d), Some(r)) = (divisor.as_f64(), remainder.as_f64()) else { return false };
    raw.and_then(Value::as_f64).is_some_and(|n| d != 0.0 && (n as i64) % (d as i64) == r as i64)
}

fn eval_all(raw: Option<&Value>, val: &Value) -> bool {
    let (Some(Value::Array(haystack)), Some(needles)) = (raw, as_array(val)) else { return false };
    needles.iter().all(|n| haystack.iter().any(|h| compare(h, n) == Ordering::Equal))
}

fn eval_elem_match(raw: Option<&Value>, val: &Value) -> bool {
    let (Some(Value::Array(items)), Value::Document(sub)) = (raw, val) else { return false };
    if is_operator_document(sub) {
        items.iter().any(|item| eval_operators(Some(item), sub))
    } else {
        items.iter().any(|item| match item {
            Value::Document(d) => matches(d, sub),
            _ => false,
        })
    }
}

#[cfg(feature = "regex")]
fn eval_regex(raw: Option<&Value>, pattern: &Value, options: Option<&str>) -> bool {
    let Some(Value::String(s)) = raw else { return false };
    let Value::String(pat) = pattern else { return false };
    let mut builder = regex::RegexBuilder::new(pat);
    if let Some(opts) = options {
        builder.case_insensitive(opts.contains('i'));
        builder.multi_line(opts.contains('m'));
        builder.dot_matches_new_line(opts.contains('s'));
    }
    builder.build().is_ok_and(|re| re.is_match(s))
}

#[cfg(not(feature = "regex"))]
fn eval_regex(_raw: Option<&Value>, _pattern: &Value, _options: Option<&str>) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::ObjectId;

    fn doc_with(key: &str, v: Value) -> Document {
        let mut d = Document::new();
        d.insert(key, v);
        d
    }

    #[test]
    fn equality_matches_plain_value() {
        let doc = doc_with("age", Value::Int32(25));
        let mut filter = Document::new();
        filter.insert("age", Value::Int32(25));
        assert!(matches(&doc, &filter));
    }

    #[test]
    fn gt_operator_against_int32() {
        let doc = doc_with("age", Value::Int32(25));
        let mut op = Document::new();
        op.insert("$gt", Value::Int32(20));
        let mut filter = Document::new();
        filter.insert("age", Value::Document(op));
        assert!(matches(&doc, &filter));
    }

    #[test]
    fn array_field_matches_any_element() {
        let doc = doc_with("tags", Value::Array(vec![Value::String("a".into()), Value::String("b".into())]));
        let mut filter = Document::new();
        filter.insert("tags", Value::String("b".into()));
        assert!(matches(&doc, &filter));
    }

    #[test]
    fn and_or_nor_compose() {
        let doc = doc_with("status", Value::String("active".into()));
        let mut sub1 = Document::new();
        sub1.insert("status", Value::String("active".into()));
        let mut sub2 = Document::new();
        sub2.insert("status", Value::String("inactive".into()));
        let mut and_filter = Document::new();
        and_filter.insert("$and", Value::Array(vec![Value::Document(sub1.clone())]));
        assert!(matches(&doc, &and_filter));

        let mut nor_filter = Document::new();
        nor_filter.insert("$nor", Value::Array(vec![Value::Document(sub2)]));
        assert!(matches(&doc, &nor_filter));
    }

    #[test]
    fn exists_and_type_operators() {
        let doc = doc_with("id", Value::ObjectId(ObjectId::new()));
        let mut exists_op = Document::new();
        exists_op.insert("$exists", Value::Boolean(true));
        let mut f1 = Document::new();
        f1.insert("id", Value::Document(exists_op));
        assert!(matches(&doc, &f1));

        let mut type_op = Document::new();
        type_op.insert("$type", Value::String("objectId".into()));
        let mut f2 = Document::new();
        f2.insert("id", Value::Document(type_op));
        assert!(matches(&doc, &f2));
    }

    #[test]
    fn elem_match_requires_single_element_to_satisfy_all() {
        let mut item1 = Document::new();
        item1.insert("a", Value::Int32(1));
        item1.insert("b", Value::Int32(2));
        let mut item2 = Document::new();
        item2.insert("a", Value::Int32(5));
        item2.insert("b", Value::Int32(5));
        let doc = doc_with("items", Value::Array(vec![Value::Document(item1), Value::Document(item2)]));

        let mut sub = Document::new();
        sub.insert("a", Value::Int32(5));
        sub.insert("b", Value::Int32(5));
        let mut elem_op = Document::new();
        elem_op.insert("$elemMatch", Value::Document(sub));
        let mut filter = Document::new();
        filter.insert("items", Value::Document(elem_op));
        assert!(matches(&doc, &filter));
    }
}
