//! Bit-exact BSON encoding, per §4.1: `type-byte ‖ cname ‖ value-bytes`,
//! with documents/arrays length-prefixed and strings NUL-terminated.

use super::document::Document;
use super::value::{Decimal128, ObjectId, Value};

fn write_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0x00);
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = (bytes.len() + 1) as i32;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    out.push(0x00);
}

/// Encodes a top-level document to its BSON byte representation.
#[must_use]
pub fn encode_document(doc: &Document) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in doc.iter() {
        encode_element(&mut body, name, value);
    }
    finish_container(body)
}

fn finish_container(mut body: Vec<u8>) -> Vec<u8> {
    body.push(0x00);
    let total_len = (body.len() + 4) as i32;
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&total_len.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

fn encode_array(items: &[Value]) -> Vec<u8> {
    let mut body = Vec::new();
    for (i, value) in items.iter().enumerate() {
        encode_element(&mut body, &i.to_string(), value);
    }
    finish_container(body)
}

fn encode_element(out: &mut Vec<u8>, name: &str, value: &Value) {
    out.push(value.type_tag());
    write_cstring(out, name);
    encode_value(out, value);
}

fn encode_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Double(d) => out.extend_from_slice(&d.to_le_bytes()),
        Value::String(s) => write_string(out, s),
        Value::Document(d) => out.extend_from_slice(&encode_document(d)),
        Value::Array(items) => out.extend_from_slice(&encode_array(items)),
        Value::Binary(subtype, bytes) => {
            let len = bytes.len() as i32;
            out.extend_from_slice(&len.to_le_bytes());
            out.push(*subtype);
            out.extend_from_slice(bytes);
        }
        Value::ObjectId(oid) => out.extend_from_slice(&oid.0),
        Value::Boolean(b) => out.push(u8::from(*b)),
        Value::DateTime(ms) => out.extend_from_slice(&ms.to_le_bytes()),
        Value::Null | Value::MinKey | Value::MaxKey => {}
        Value::Regex { pattern, options } => {
            write_cstring(out, pattern);
            write_cstring(out, options);
        }
        Value::Int32(i) => out.extend_from_slice(&i.to_le_bytes()),
        Value::Timestamp { seconds, ordinal } => {
            out.extend_from_slice(&ordinal.to_le_bytes());
            out.extend_from_slice(&seconds.to_le_bytes());
        }
        Value::Int64(i) => out.extend_from_slice(&i.to_le_bytes()),
        Value::Decimal128(d) => out.extend_from_slice(&d.to_bits()),
    }
}

impl ObjectId {
    #[must_use]
    pub fn encode(self) -> [u8; 12] {
        self.0
    }
}

impl Decimal128 {
    #[must_use]
    pub fn encode(self) -> [u8; 16] {
        self.to_bits()
    }
}
