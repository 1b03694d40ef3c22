//! KeyString — an order-preserving binary encoding of composite index
//! keys, per §4.5. `memcmp` over two encoded buffers agrees in sign with
//! [`crate::bson::compare`] over the original values (for same-length
//! composite keys built from the same index spec).
//!
//! Each field is encoded as `type-tag ‖ value-bytes`, with `value-bytes`
//! bitwise-inverted in place when that field's sort direction is
//! descending. The type tag itself is never inverted, so cross-type
//! ordering (driven by the tag) is direction-independent; only
//! same-type ordering flips.

use crate::bson::value::type_rank;
use crate::bson::{Document, Value};

/// One field of a composite index specification: a dotted path plus a
/// sort direction (`true` = descending).
#[derive(Debug, Clone)]
pub struct KeyField {
    pub path: String,
    pub descending: bool,
}

/// Encodes a document's values for the given index spec into a single
/// memcmp-comparable buffer.
#[must_use]
pub fn encode_composite(doc: &Document, spec: &[KeyField]) -> Vec<u8> {
    let mut out = Vec::new();
    for field in spec {
        let value = doc.get_path(&field.path).cloned().unwrap_or(Value::Null);
        encode_field(&mut out, &value, field.descending);
    }
    out
}

/// Encodes a single already-resolved value as one KeyString field.
pub fn encode_field(out: &mut Vec<u8>, value: &Value, descending: bool) {
    out.push(type_rank(value));
    let start = out.len();
    encode_value_bytes(out, value);
    if descending {
        for b in &mut out[start..] {
            *b = !*b;
        }
    }
}

fn encode_value_bytes(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::MinKey | Value::MaxKey | Value::Null => {}
        Value::Double(_) | Value::Int32(_) | Value::Int64(_) | Value::Decimal128(_) => {
            encode_numeric(out, value);
        }
        Value::String(s) => encode_string_like(out, s),
        Value::Document(d) => encode_document_like(out, d.iter()),
        Value::Array(items) => {
            let pairs: Vec<(String, Value)> =
                items.iter().enumerate().map(|(i, v)| (i.to_string(), v.clone())).collect();
            encode_document_like(out, pairs.iter().map(|(k, v)| (k.as_str(), v)));
        }
        Value::Binary(_, bytes) => {
            let len = bytes.len() as u32;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(bytes);
        }
        Value::ObjectId(oid) => out.extend_from_slice(&oid.0),
        Value::Boolean(b) => out.push(if *b { 0x02 } else { 0x01 }),
        Value::DateTime(ms) => out.extend_from_slice(&sortable_i64(*ms)),
        Value::Regex { pattern, options } => {
            encode_string_like(out, pattern);
            encode_string_like(out, options);
        }
        Value::Timestamp { seconds, ordinal } => {
            out.extend_from_slice(&seconds.to_be_bytes());
            out.extend_from_slice(&ordinal.to_be_bytes());
        }
    }
}

/// Order-preserving transform for a signed 64-bit integer: XORing the
/// sign bit turns two's-complement ordering into unsigned big-endian
/// byte ordering.
fn sortable_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

/// Order-preserving transform for an IEEE-754 double: flip the sign bit
/// for non-negative values, invert every bit for negative ones.
fn sortable_f64(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let out = if v.is_sign_negative() { !bits } else { bits | 0x8000_0000_0000_0000 };
    out.to_be_bytes()
}

/// Numeric KeyString encoding. `Int32`/`Int64` use the exact
/// order-preserving integer transform (promoting `Int32` to `i64` first,
/// so the two encode identically at equal value), matching
/// [`crate::bson::compare`]'s exact `Int64`-vs-`Int64`/`Int32`-vs-`Int32`
/// branches bit-for-bit even past 2^53. `Double`/`Decimal128` fall back to
/// the sortable-double transform, which only agrees with the comparator's
/// int-vs-double truncation rule within the range an `f64` represents
/// exactly — the same limit the comparator itself carries for that pair.
fn encode_numeric(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Int32(i) => out.extend_from_slice(&sortable_i64(i64::from(*i))),
        Value::Int64(i) => out.extend_from_slice(&sortable_i64(*i)),
        _ => {
            let widened = value.as_f64().unwrap_or(0.0);
            out.extend_from_slice(&sortable_f64(widened));
        }
    }
}

/// Strings and regex components are escape-encoded: an embedded 0x00
/// byte is escaped as `0x00 0xFF` so a real terminator is the only place
/// `0x00 0x00` occurs.
fn encode_string_like(out: &mut Vec<u8>, s: &str) {
    for b in s.as_bytes() {
        if *b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(*b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

fn encode_document_like<'a>(out: &mut Vec<u8>, entries: impl Iterator<Item = (&'a str, &'a Value)>) {
    for (k, v) in entries {
        encode_string_like(out, k);
        out.push(type_rank(v));
        encode_value_bytes(out, v);
    }
    out.push(0x00);
    out.push(0x00);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(path: &str, descending: bool) -> KeyField {
        KeyField { path: path.to_string(), descending }
    }

    #[test]
    fn ascending_numeric_order_matches_compare() {
        let mut a = Document::new();
        a.insert("n", Value::Int32(3));
        let mut b = Document::new();
        b.insert("n", Value::Int32(7));
        let spec = vec![field("n", false)];
        let ea = encode_composite(&a, &spec);
        let eb = encode_composite(&b, &spec);
        assert!(ea < eb);
    }

    #[test]
    fn descending_inverts_only_within_type() {
        let mut a = Document::new();
        a.insert("n", Value::Int32(3));
        let mut b = Document::new();
        b.insert("n", Value::Int32(7));
        let spec = vec![field("n", true)];
        let ea = encode_composite(&a, &spec);
        let eb = encode_composite(&b, &spec);
        assert!(ea > eb);
    }

    #[test]
    fn string_with_embedded_nul_does_not_confuse_terminator() {
        let mut out = Vec::new();
        encode_field(&mut out, &Value::String("a\0b".to_string()), false);
        // tag byte + escaped 'a' + (0x00,0xFF) + 'b' + terminator (0x00,0x00)
        assert_eq!(out.last_chunk::<2>(), Some(&[0x00, 0x00]));
    }

    #[test]
    fn cross_type_rank_dominates_value_bytes() {
        let mut docs = Document::new();
        docs.insert("n", Value::Null);
        let mut ints = Document::new();
        ints.insert("n", Value::Int32(i32::MIN));
        let spec = vec![field("n", false)];
        assert!(encode_composite(&docs, &spec) < encode_composite(&ints, &spec));
    }

    #[test]
    fn composite_key_orders_by_first_field_then_second() {
        let spec = vec![field("a", false), field("b", false)];
        let mut d1 = Document::new();
        d1.insert("a", Value::Int32(1));
        d1.insert("b", Value::Int32(9));
        let mut d2 = Document::new();
        d2.insert("a", Value::Int32(2));
        d2.insert("b", Value::Int32(0));
        assert!(encode_composite(&d1, &spec) < encode_composite(&d2, &spec));
    }

    #[test]
    fn large_int64_values_encode_distinctly_despite_rounding_to_the_same_double() {
        let big = (1i64 << 60) + 1;
        let mut a = Document::new();
        a.insert("n", Value::Int64(big - 1));
        let mut b = Document::new();
        b.insert("n", Value::Int64(big));
        let spec = vec![field("n", false)];
        let ea = encode_composite(&a, &spec);
        let eb = encode_composite(&b, &spec);
        assert_ne!(ea, eb);
        assert!(ea < eb);
    }
}
