//! The aggregation pipeline (§4.10): a list of stage documents, each
//! `execute([doc]) -> [doc]`, composed as a left-fold over the input set.
//! `$out/$merge/$facet/$bucket/$graphLookup/$geoNear` are not implemented.

pub mod stages;

use crate::bson::{Document, Value};
use crate::errors::{MonoError, MonoResult};

/// Resolves a foreign collection's full document set for `$lookup`,
/// supplied by the caller so this module stays independent of storage.
pub trait ForeignLookup {
    fn fetch_all(&self, collection: &str) -> MonoResult<Vec<Document>>;
}

/// Runs `pipeline` over `docs`, left-folding each stage in order.
pub fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document], lookup: &dyn ForeignLookup) -> MonoResult<Vec<Document>> {
    for stage in pipeline {
        let (name, spec) = stage
            .iter()
            .next()
            .ok_or_else(|| MonoError::InvalidArgument("empty pipeline stage".into()))?;
        docs = execute_stage(docs, name, spec, lookup)?;
    }
    Ok(docs)
}

fn execute_stage(docs: Vec<Document>, name: &str, spec: &Value, lookup: &dyn ForeignLookup) -> MonoResult<Vec<Document>> {
    match name {
        "$match" => match spec {
            Value::Document(filter_doc) => Ok(stages::stage_match(docs, filter_doc)),
            _ => Err(bad("$match", "a document")),
        },
        "$project" => match spec {
            Value::Document(proj) => stages::stage_project(docs, proj),
            _ => Err(bad("$project", "a document")),
        },
        "$addFields" | "$set" => match spec {
            Value::Document(fields) => Ok(stages::stage_add_fields(docs, fields)),
            _ => Err(bad(name, "a document")),
        },
        "$unset" => {
            let fields = match spec {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(s.clone()),
                        _ => Err(bad("$unset", "a string or array of strings")),
                    })
                    .collect::<MonoResult<Vec<_>>>()?,
                _ => return Err(bad("$unset", "a string or array of strings")),
            };
            Ok(stages::stage_unset(docs, &fields))
        }
        "$replaceRoot" => match spec {
            Value::Document(d) => {
                let expr = d.get("newRoot").ok_or_else(|| MonoError::InvalidArgument("$replaceRoot requires newRoot".into()))?;
                stages::stage_replace_root(docs, expr)
            }
            _ => Err(bad("$replaceRoot", "a document")),
        },
        "$replaceWith" => stages::stage_replace_root(docs, spec),
        "$unwind" => {
            let (path, preserve_empty, include_index) = parse_unwind_spec(spec)?;
            Ok(stages::stage_unwind(docs, &path, preserve_empty, include_index.as_deref()))
        }
        "$sort" => match spec {
            Value::Document(sort_spec) => Ok(stages::stage_sort(docs, sort_spec)),
            _ => Err(bad("$sort", "a document")),
        },
        "$skip" => Ok(stages::stage_skip(docs, as_usize(spec, "$skip")?)),
        "$limit" => Ok(stages::stage_limit(docs, as_usize(spec, "$limit")?)),
        "$count" => match spec {
            Value::String(field) => Ok(stages::stage_count(docs, field)),
            _ => Err(bad("$count", "a string")),
        },
        "$group" => match spec {
            Value::Document(group_spec) => stages::stage_group(docs, group_spec),
            _ => Err(bad("$group", "a document")),
        },
        "$lookup" => {
            let Value::Document(d) = spec else { return Err(bad("$lookup", "a document")) };
            let from = as_string(d, "from")?;
            let local_field = as_string(d, "localField")?;
            let foreign_field = as_string(d, "foreignField")?;
            let as_field = as_string(d, "as")?;
            let foreign = lookup.fetch_all(&from)?;
            Ok(stages::stage_lookup(docs, &local_field, &foreign, &foreign_field, &as_field))
        }
        "$out" | "$merge" | "$facet" | "$bucket" | "$graphLookup" | "$geoNear" => {
            Err(MonoError::InvalidArgument(format!("aggregation stage {name} is not supported")))
        }
        other => Err(MonoError::InvalidArgument(format!("unknown aggregation stage {other}"))),
    }
}

fn bad(stage: &str, expected: &str) -> MonoError {
    MonoError::InvalidArgument(format!("{stage} expects {expected}"))
}

fn as_usize(v: &Value, stage: &str) -> MonoResult<usize> {
    v.as_f64().map(|n| n as usize).ok_or_else(|| bad(stage, "a number"))
}

fn as_string(d: &Document, key: &str) -> MonoResult<String> {
    match d.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(MonoError::InvalidArgument(format!("$lookup requires a string {key}"))),
    }
}

fn parse_unwind_spec(spec: &Value) -> MonoResult<(String, bool, Option<String>)> {
    match spec {
        Value::String(s) => Ok((s.trim_start_matches('$').to_string(), false, None)),
        Value::Document(d) => {
            let path = match d.get("path") {
                Some(Value::String(s)) => s.trim_start_matches('$').to_string(),
                _ => return Err(bad("$unwind", "a path field")),
            };
            let preserve = matches!(d.get("preserveNullAndEmptyArrays"), Some(Value::Boolean(true)));
            let include_index = match d.get("includeArrayIndex") {
                Some(Value::String(s)) => Some(s.clone()),
                _ => None,
            };
            Ok((path, preserve, include_index))
        }
        _ => Err(bad("$unwind", "a string or document")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoLookup;
    impl ForeignLookup for NoLookup {
        fn fetch_all(&self, _collection: &str) -> MonoResult<Vec<Document>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn full_pipeline_matches_literal_scenario() {
        let mut docs = Vec::new();
        for (status, region, amount) in [("active", "A", 10), ("active", "B", 5), ("active", "A", 3), ("inactive", "A", 100)] {
            let mut d = Document::new();
            d.insert("status", Value::String(status.into()));
            d.insert("region", Value::String(region.into()));
            d.insert("amount", Value::Int32(amount));
            docs.push(d);
        }

        let mut match_filter = Document::new();
        match_filter.insert("status", Value::String("active".into()));
        let mut match_stage = Document::new();
        match_stage.insert("$match", Value::Document(match_filter));

        let mut sum_op = Document::new();
        sum_op.insert("$sum", Value::String("$amount".into()));
        let mut group_spec = Document::new();
        group_spec.insert("_id", Value::String("$region".into()));
        group_spec.insert("total", Value::Document(sum_op));
        let mut group_stage = Document::new();
        group_stage.insert("$group", Value::Document(group_spec));

        let mut sort_spec = Document::new();
        sort_spec.insert("total", Value::Int32(-1));
        let mut sort_stage = Document::new();
        sort_stage.insert("$sort", Value::Document(sort_spec));

        let mut limit_stage = Document::new();
        limit_stage.insert("$limit", Value::Int32(2));

        let pipeline = vec![match_stage, group_stage, sort_stage, limit_stage];
        let out = run_pipeline(docs, &pipeline, &NoLookup).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("_id"), Some(&Value::String("A".into())));
        assert_eq!(out[0].get("total"), Some(&Value::Int32(13)));
        assert_eq!(out[1].get("_id"), Some(&Value::String("B".into())));
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let mut stage = Document::new();
        stage.insert("$bogus", Value::Document(Document::new()));
        let err = run_pipeline(Vec::new(), &[stage], &NoLookup).unwrap_err();
        assert!(matches!(err, MonoError::InvalidArgument(_)));
    }

    #[test]
    fn non_goal_stages_are_rejected_explicitly() {
        let mut stage = Document::new();
        stage.insert("$facet", Value::Document(Document::new()));
        let err = run_pipeline(Vec::new(), &[stage], &NoLookup).unwrap_err();
        assert!(matches!(err, MonoError::InvalidArgument(_)));
    }
}
