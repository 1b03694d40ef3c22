//! Cross-type BSON comparison, per §3: values compare first by
//! [`type_rank`], then by type-specific rules. Numeric types (double,
//! int32, int64, decimal128) share a rank and unify via widening, except
//! where that widening would lose precision.

use std::cmp::Ordering;

use super::value::{type_rank, Value};

/// Total order over BSON values matching MongoDB's comparison semantics.
#[must_use]
pub fn compare(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Double(_) | Value::Int32(_) | Value::Int64(_) | Value::Decimal128(_), _) => compare_numeric(a, b),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Document(x), Value::Document(y)) => compare_documents(x, y),
        (Value::Array(x), Value::Array(y)) => compare_arrays(x, y),
        (Value::Binary(st_a, b_a), Value::Binary(st_b, b_b)) => {
            b_a.len().cmp(&b_b.len()).then_with(|| st_a.cmp(st_b)).then_with(|| b_a.cmp(b_b))
        }
        (Value::ObjectId(x), Value::ObjectId(y)) => x.0.cmp(&y.0),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        (Value::Timestamp { seconds: sa, ordinal: oa }, Value::Timestamp { seconds: sb, ordinal: ob }) => {
            sa.cmp(sb).then_with(|| oa.cmp(ob))
        }
        (Value::Regex { pattern: pa, options: oa }, Value::Regex { pattern: pb, options: ob }) => {
            pa.cmp(pb).then_with(|| oa.cmp(ob))
        }
        // Null, MinKey, MaxKey share a rank with only themselves and are
        // always equal to another instance of the same type.
        _ => Ordering::Equal,
    }
}

/// Numeric comparison unifying double/int32/int64/decimal128. Exact
/// decimal128-vs-decimal128 and exact int-vs-int pairs compare bit-exact;
/// an int compared against a double truncates the double to its integer
/// part rather than widening the int through `f64`, since widening loses
/// precision at magnitudes beyond 2^53 where the comparator must stay
/// exact (§3/§4.1).
fn compare_numeric(a: &Value, b: &Value) -> Ordering {
    if let (Value::Decimal128(x), Value::Decimal128(y)) = (a, b) {
        if x == y {
            return Ordering::Equal;
        }
        return x.to_f64().partial_cmp(&y.to_f64()).unwrap_or(Ordering::Equal);
    }
    if let (Value::Int64(x), Value::Int64(y)) = (a, b) {
        return x.cmp(y);
    }
    if let (Value::Int32(x), Value::Int32(y)) = (a, b) {
        return x.cmp(y);
    }
    match (as_exact_i64(a), as_exact_i64(b)) {
        (Some(xi), Some(yi)) => xi.cmp(&yi),
        (Some(xi), None) => compare_int_and_double(xi, b.as_f64().unwrap_or(f64::NAN)),
        (None, Some(yi)) => compare_int_and_double(yi, a.as_f64().unwrap_or(f64::NAN)).reverse(),
        (None, None) => {
            let (xf, yf) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
        }
    }
}

fn as_exact_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Int32(i) => Some(i64::from(*i)),
        Value::Int64(i) => Some(*i),
        _ => None,
    }
}

/// Compares an exact integer against a double by truncating the double
/// toward zero and comparing in the integer domain; ties break on the
/// double's leftover fractional part. Never widens `i` to `f64`, so it
/// stays exact past 2^53 where that widening would round.
fn compare_int_and_double(i: i64, d: f64) -> Ordering {
    if d.is_nan() {
        return Ordering::Equal;
    }
    let truncated = d.trunc();
    if truncated > i64::MAX as f64 {
        return Ordering::Less;
    }
    if truncated < i64::MIN as f64 {
        return Ordering::Greater;
    }
    let ti = truncated as i64;
    match i.cmp(&ti) {
        Ordering::Equal => {
            let frac = d - truncated;
            if frac > 0.0 {
                Ordering::Less
            } else if frac < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

fn compare_documents(a: &super::Document, b: &super::Document) -> Ordering {
    let mut ia = a.iter();
    let mut ib = b.iter();
    loop {
        match (ia.next(), ib.next()) {
            (Some((ka, va)), Some((kb, vb))) => {
                let ord = ka.cmp(kb).then_with(|| compare(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

fn compare_arrays(a: &[Value], b: &[Value]) -> Ordering {
    let mut ia = a.iter();
    let mut ib = b.iter();
    loop {
        match (ia.next(), ib.next()) {
            (Some(va), Some(vb)) => {
                let ord = compare(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::Document;

    #[test]
    fn numeric_cross_type_equal() {
        assert_eq!(compare(&Value::Int32(5), &Value::Double(5.0)), Ordering::Equal);
        assert_eq!(compare(&Value::Int64(5), &Value::Double(5.0)), Ordering::Equal);
    }

    #[test]
    fn type_rank_orders_before_value() {
        assert_eq!(compare(&Value::Null, &Value::Int32(0)), Ordering::Less);
        assert_eq!(compare(&Value::String("a".into()), &Value::Document(Document::new())), Ordering::Less);
    }

    #[test]
    fn large_integers_compare_exactly() {
        let big = (1i64 << 60) + 1;
        assert_eq!(compare(&Value::Int64(big), &Value::Int64(big - 1)), Ordering::Greater);
    }

    #[test]
    fn large_integer_against_double_truncates_instead_of_widening() {
        let big = (1i64 << 60) + 1;
        // (1<<60)+1 and 1.0*2^60 round to the same f64; widening `big`
        // to f64 would wrongly report Equal.
        assert_eq!(compare(&Value::Int64(big), &Value::Double((1u64 << 60) as f64)), Ordering::Greater);
        assert_eq!(compare(&Value::Double((1u64 << 60) as f64), &Value::Int64(big)), Ordering::Less);
    }

    #[test]
    fn documents_compare_field_by_field() {
        let mut a = Document::new();
        a.insert("x", Value::Int32(1));
        let mut b = Document::new();
        b.insert("x", Value::Int32(2));
        assert_eq!(compare(&Value::Document(a), &Value::Document(b)), Ordering::Less);
    }
}
