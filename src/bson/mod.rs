//! A hand-rolled BSON codec: bit-exact with the real wire format so that
//! documents, keys, and comparisons behave the way MongoDB clients expect.

pub mod compare;
pub mod decode;
pub mod document;
pub mod encode;
pub mod value;

pub use compare::compare;
pub use decode::decode_document;
pub use document::Document;
pub use encode::encode_document;
pub use value::{BinarySubtype, Decimal128, ObjectId, Value};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_scalar_fields() {
        let mut doc = Document::new();
        doc.insert("a", Value::Int32(7));
        doc.insert("b", Value::String("hello".into()));
        doc.insert("c", Value::Boolean(true));
        doc.insert("d", Value::Null);
        doc.insert("e", Value::Double(1.5));
        doc.insert("f", Value::Int64(9_223_372_036_854_775_807));
        let bytes = encode_document(&doc);
        let decoded = decode_document(&bytes).expect("decode");
        assert_eq!(doc, decoded);
    }

    #[test]
    fn round_trip_nested_document_and_array() {
        let mut inner = Document::new();
        inner.insert("x", Value::Int32(1));
        let mut doc = Document::new();
        doc.insert("nested", Value::Document(inner));
        doc.insert("arr", Value::Array(vec![Value::Int32(1), Value::Int32(2), Value::String("three".into())]));
        let bytes = encode_document(&doc);
        let decoded = decode_document(&bytes).expect("decode");
        assert_eq!(doc, decoded);
    }

    #[test]
    fn round_trip_object_id_and_decimal128() {
        let oid = ObjectId::new();
        let dec = Decimal128 { negative: false, exponent: -2, coefficient: 12345 };
        let mut doc = Document::new();
        doc.insert("oid", Value::ObjectId(oid));
        doc.insert("amount", Value::Decimal128(dec));
        let bytes = encode_document(&doc);
        let decoded = decode_document(&bytes).expect("decode");
        assert_eq!(doc, decoded);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let mut doc = Document::new();
        doc.insert("a", Value::Int32(1));
        let bytes = encode_document(&doc);
        let truncated = &bytes[..bytes.len() - 2];
        assert!(decode_document(truncated).is_err());
    }

    #[test]
    fn decode_rejects_missing_terminator() {
        let mut doc = Document::new();
        doc.insert("a", Value::Int32(1));
        let mut bytes = encode_document(&doc);
        let last = bytes.len() - 1;
        bytes[last] = 0xFF;
        assert!(decode_document(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_unknown_type_tag() {
        let mut doc = Document::new();
        doc.insert("a", Value::Int32(1));
        let mut bytes = encode_document(&doc);
        bytes[4] = 0xEE;
        assert!(decode_document(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_non_utf8_string() {
        let mut bytes = Vec::new();
        // total_len placeholder, filled below
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.push(value::TAG_STRING);
        bytes.extend_from_slice(b"k\0");
        let invalid = [0xFFu8, 0x00];
        let len = (invalid.len() + 1) as i32;
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(&invalid);
        bytes.push(0x00);
        bytes.push(0x00);
        let total = bytes.len() as i32;
        bytes[0..4].copy_from_slice(&total.to_le_bytes());
        assert!(decode_document(&bytes).is_err());
    }
}
