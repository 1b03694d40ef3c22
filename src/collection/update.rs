//! Update-operator application (§4.9): field operators mutate scalar
//! values, array operators mutate array fields, and dotted paths create
//! intermediate documents as needed.

use crate::bson::compare::compare;
use crate::bson::{Document, Value};
use crate::errors::{MonoError, MonoResult};
use std::cmp::Ordering;

/// Applies an update document's operators to `doc` in place.
/// `$setOnInsert` only takes effect when `is_insert` is set, since it is
/// meaningful only for the synthesized document of an upsert.
pub fn apply_update(doc: &mut Document, update: &Document, is_insert: bool) -> MonoResult<()> {
    for (op, arg) in update.iter() {
        let Value::Document(fields) = arg else {
            return Err(MonoError::InvalidArgument(format!("update operator {op} expects a document")));
        };
        match op {
            "$set" => {
                for (path, val) in fields.iter() {
                    doc.set_path(path, val.clone());
                }
            }
            "$setOnInsert" => {
                if is_insert {
                    for (path, val) in fields.iter() {
                        doc.set_path(path, val.clone());
                    }
                }
            }
            "$unset" => {
                for (path, _) in fields.iter() {
                    doc.remove_path(path);
                }
            }
            "$inc" => {
                for (path, delta) in fields.iter() {
                    numeric_op(doc, path, delta, |a, b| a + b)?;
                }
            }
            "$mul" => {
                for (path, factor) in fields.iter() {
                    numeric_op(doc, path, factor, |a, b| a * b)?;
                }
            }
            "$min" => {
                for (path, candidate) in fields.iter() {
                    extremum_op(doc, path, candidate, Ordering::Less)?;
                }
            }
            "$max" => {
                for (path, candidate) in fields.iter() {
                    extremum_op(doc, path, candidate, Ordering::Greater)?;
                }
            }
            "$rename" => {
                for (from, to) in fields.iter() {
                    let Value::String(to_path) = to else {
                        return Err(MonoError::InvalidArgument("$rename target must be a string".into()));
                    };
                    if let Some(v) = doc.remove_path(from) {
                        doc.set_path(to_path, v);
                    }
                }
            }
            "$currentDate" => {
                for (path, spec) in fields.iter() {
                    let now_ms = current_time_ms();
                    let is_timestamp = matches!(spec, Value::Document(d) if matches!(d.get("$type"), Some(Value::String(s)) if s == "timestamp"));
                    if is_timestamp {
                        doc.set_path(path, Value::Timestamp { seconds: (now_ms / 1000) as u32, ordinal: 1 });
                    } else {
                        doc.set_path(path, Value::DateTime(now_ms));
                    }
                }
            }
            "$push" => {
                for (path, spec) in fields.iter() {
                    push_op(doc, path, spec)?;
                }
            }
            "$pop" => {
                for (path, dir) in fields.iter() {
                    pop_op(doc, path, dir)?;
                }
            }
            "$pull" => {
                for (path, cond) in fields.iter() {
                    pull_op(doc, path, cond)?;
                }
            }
            "$pullAll" => {
                for (path, values) in fields.iter() {
                    pull_all_op(doc, path, values)?;
                }
            }
            "$addToSet" => {
                for (path, spec) in fields.iter() {
                    add_to_set_op(doc, path, spec)?;
                }
            }
            other => return Err(MonoError::InvalidArgument(format!("unknown update operator {other}"))),
        }
    }
    Ok(())
}

fn current_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn numeric_op(doc: &mut Document, path: &str, operand: &Value, f: impl Fn(f64, f64) -> f64) -> MonoResult<()> {
    let operand_f = operand.as_f64().ok_or_else(|| MonoError::InvalidArgument("expected a numeric operand".into()))?;
    let existing = doc.get_path(path);
    let current = existing.and_then(Value::as_f64).unwrap_or(0.0);
    let result = f(current, operand_f);
    let both_int32 = matches!(existing, Some(Value::Int32(_)) | None) && matches!(operand, Value::Int32(_));
    let value =
        if both_int32 && result.fract() == 0.0 && result.abs() < f64::from(i32::MAX) { Value::Int32(result as i32) } else { Value::Double(result) };
    doc.set_path(path, value);
    Ok(())
}

fn extremum_op(doc: &mut Document, path: &str, candidate: &Value, keep_if: Ordering) -> MonoResult<()> {
    match doc.get_path(path) {
        Some(existing) if compare(existing, candidate) != keep_if => {}
        _ => doc.set_path(path, candidate.clone()),
    }
    Ok(())
}

fn as_array_mut<'d>(doc: &'d mut Document, path: &str) -> MonoResult<&'d mut Vec<Value>> {
    if doc.get_path(path).is_none() {
        doc.set_path(path, Value::Array(Vec::new()));
    }
    match doc.get_path(path) {
        Some(Value::Array(_)) => {}
        Some(_) => return Err(MonoError::InvalidArgument(format!("{path} is not an array"))),
        None => unreachable!(),
    }
    // Re-resolve mutably via a dotted path walk, since `get_path` only
    // borrows immutably.
    get_path_mut(doc, path).ok_or_else(|| MonoError::InternalError("array path vanished".into())).and_then(|v| {
        if let Value::Array(items) = v {
            Ok(items)
        } else {
            Err(MonoError::InvalidArgument(format!("{path} is not an array")))
        }
    })
}

fn get_path_mut<'d>(doc: &'d mut Document, path: &str) -> Option<&'d mut Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut cur = doc.get_mut(first)?;
    for part in parts {
        match cur {
            Value::Document(d) => cur = d.get_mut(part)?,
            _ => return None,
        }
    }
    Some(cur)
}

fn push_op(doc: &mut Document, path: &str, spec: &Value) -> MonoResult<()> {
    let to_push: Vec<Value> = match spec {
        Value::Document(d) if d.contains_key("$each") => match d.get("$each") {
            Some(Value::Array(items)) => items.clone(),
            _ => return Err(MonoError::InvalidArgument("$each expects an array".into())),
        },
        other => vec![other.clone()],
    };
    let arr = as_array_mut(doc, path)?;
    arr.extend(to_push);
    Ok(())
}

fn pop_op(doc: &mut Document, path: &str, dir: &Value) -> MonoResult<()> {
    let arr = as_array_mut(doc, path)?;
    match dir.as_f64() {
        Some(n) if n < 0.0 => {
            if !arr.is_empty() {
                arr.remove(0);
            }
        }
        Some(_) => {
            arr.pop();
        }
        None => return Err(MonoError::InvalidArgument("$pop expects 1 or -1".into())),
    }
    Ok(())
}

fn pull_op(doc: &mut Document, path: &str, cond: &Value) -> MonoResult<()> {
    let arr = as_array_mut(doc, path)?;
    arr.retain(|item| !matches_pull_condition(item, cond));
    Ok(())
}

fn matches_pull_condition(item: &Value, cond: &Value) -> bool {
    match cond {
        Value::Document(d) if d.iter().next().is_some_and(|(k, _)| k.starts_with('$')) => {
            // Operator sub-document: reuse filter evaluation by wrapping
            // the candidate item in a throwaway field.
            let mut wrapper = Document::new();
            wrapper.insert("v", item.clone());
            let mut wrapped_cond = Document::new();
            wrapped_cond.insert("v", Value::Document(d.clone()));
            super::filter::matches(&wrapper, &wrapped_cond)
        }
        Value::Document(d) => match item {
            Value::Document(id) => super::filter::matches(id, d),
            _ => false,
        },
        other => compare(item, other) == Ordering::Equal,
    }
}

fn pull_all_op(doc: &mut Document, path: &str, values: &Value) -> MonoResult<()> {
    let Value::Array(targets) = values else {
        return Err(MonoError::InvalidArgument("$pullAll expects an array".into()));
    };
    let arr = as_array_mut(doc, path)?;
    arr.retain(|item| !targets.iter().any(|t| compare(item, t) == Ordering::Equal));
    Ok(())
}

fn add_to_set_op(doc: &mut Document, path: &str, spec: &Value) -> MonoResult<()> {
    let to_add: Vec<Value> = match spec {
        Value::Document(d) if d.contains_key("$each") => match d.get("$each") {
            Some(Value::Array(items)) => items.clone(),
            _ => return Err(MonoError::InvalidArgument("$each expects an array".into())),
        },
        other => vec![other.clone()],
    };
    let arr = as_array_mut(doc, path)?;
    for candidate in to_add {
        if !arr.iter().any(|existing| compare(existing, &candidate) == Ordering::Equal) {
            arr.push(candidate);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_unset() {
        let mut doc = Document::new();
        doc.insert("a", Value::Int32(1));
        let mut fields = Document::new();
        fields.insert("b", Value::Int32(2));
        let mut update = Document::new();
        update.insert("$set", Value::Document(fields));
        apply_update(&mut doc, &update, false).unwrap();
        assert_eq!(doc.get("b"), Some(&Value::Int32(2)));

        let mut unset_fields = Document::new();
        unset_fields.insert("a", Value::Int32(1));
        let mut unset = Document::new();
        unset.insert("$unset", Value::Document(unset_fields));
        apply_update(&mut doc, &unset, false).unwrap();
        assert_eq!(doc.get("a"), None);
    }

    #[test]
    fn inc_accumulates_and_keeps_integer_type() {
        let mut doc = Document::new();
        doc.insert("n", Value::Int32(5));
        let mut fields = Document::new();
        fields.insert("n", Value::Int32(3));
        let mut update = Document::new();
        update.insert("$inc", Value::Document(fields));
        apply_update(&mut doc, &update, false).unwrap();
        assert_eq!(doc.get("n"), Some(&Value::Int32(8)));
    }

    #[test]
    fn push_each_and_pop() {
        let mut doc = Document::new();
        let mut each = Document::new();
        each.insert("$each", Value::Array(vec![Value::Int32(1), Value::Int32(2)]));
        let mut fields = Document::new();
        fields.insert("arr", Value::Document(each));
        let mut update = Document::new();
        update.insert("$push", Value::Document(fields));
        apply_update(&mut doc, &update, false).unwrap();
        assert_eq!(doc.get("arr"), Some(&Value::Array(vec![Value::Int32(1), Value::Int32(2)])));

        let mut pop_fields = Document::new();
        pop_fields.insert("arr", Value::Int32(1));
        let mut pop_update = Document::new();
        pop_update.insert("$pop", Value::Document(pop_fields));
        apply_update(&mut doc, &pop_update, false).unwrap();
        assert_eq!(doc.get("arr"), Some(&Value::Array(vec![Value::Int32(1)])));
    }

    #[test]
    fn add_to_set_is_idempotent() {
        let mut doc = Document::new();
        doc.insert("tags", Value::Array(vec![Value::String("a".into())]));
        let mut fields = Document::new();
        fields.insert("tags", Value::String("a".into()));
        let mut update = Document::new();
        update.insert("$addToSet", Value::Document(fields));
        apply_update(&mut doc, &update, false).unwrap();
        assert_eq!(doc.get("tags"), Some(&Value::Array(vec![Value::String("a".into())])));
    }

    #[test]
    fn set_on_insert_only_applies_when_inserting() {
        let mut doc = Document::new();
        let mut fields = Document::new();
        fields.insert("createdBy", Value::String("system".into()));
        let mut update = Document::new();
        update.insert("$setOnInsert", Value::Document(fields));
        apply_update(&mut doc, &update, false).unwrap();
        assert_eq!(doc.get("createdBy"), None);
        apply_update(&mut doc, &update, true).unwrap();
        assert_eq!(doc.get("createdBy"), Some(&Value::String("system".into())));
    }
}
