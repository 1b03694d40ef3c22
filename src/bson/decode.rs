//! BSON decoding with strict validation, per §4.1: truncated input, invalid
//! type tags, missing terminators, and non-UTF-8 names/values are all
//! rejected rather than silently coerced.

use super::document::Document;
use super::value::*;
use crate::errors::{MonoError, MonoResult};

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> MonoResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| truncated())?;
        if end > self.buf.len() {
            return Err(truncated());
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn i32(&mut self) -> MonoResult<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().map_err(|_| truncated())?))
    }

    fn i64(&mut self) -> MonoResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().map_err(|_| truncated())?))
    }

    fn u32(&mut self) -> MonoResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().map_err(|_| truncated())?))
    }

    fn f64(&mut self) -> MonoResult<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().map_err(|_| truncated())?))
    }

    fn byte(&mut self) -> MonoResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn cstring(&mut self) -> MonoResult<String> {
        let start = self.pos;
        loop {
            if self.pos >= self.buf.len() {
                return Err(truncated());
            }
            if self.buf[self.pos] == 0x00 {
                let bytes = &self.buf[start..self.pos];
                self.pos += 1;
                return String::from_utf8(bytes.to_vec())
                    .map_err(|_| MonoError::ProtocolError("non-UTF-8 BSON name".into()));
            }
            self.pos += 1;
        }
    }

    fn string(&mut self) -> MonoResult<String> {
        let len = self.i32()?;
        if len < 1 {
            return Err(MonoError::ProtocolError("invalid BSON string length".into()));
        }
        let bytes = self.take(len as usize)?;
        let (body, term) = bytes.split_at(bytes.len() - 1);
        if term != [0x00] {
            return Err(MonoError::ProtocolError("missing BSON string terminator".into()));
        }
        String::from_utf8(body.to_vec()).map_err(|_| MonoError::ProtocolError("non-UTF-8 BSON string".into()))
    }
}

fn truncated() -> MonoError {
    MonoError::ProtocolError("truncated BSON input".into())
}

/// Decodes a top-level BSON document. Rejects truncated input, invalid type
/// tags, missing terminators, and non-UTF-8 names/strings.
pub fn decode_document(bytes: &[u8]) -> MonoResult<Document> {
    let mut cursor = Cursor::new(bytes);
    let doc = decode_container(&mut cursor)?;
    if cursor.pos != bytes.len() {
        return Err(MonoError::ProtocolError("trailing bytes after BSON document".into()));
    }
    Ok(doc)
}

fn decode_container(cursor: &mut Cursor<'_>) -> MonoResult<Document> {
    let total_len = cursor.i32()?;
    if total_len < 5 {
        return Err(MonoError::ProtocolError("invalid BSON document length".into()));
    }
    let body_end = cursor.pos.checked_add(total_len as usize - 4).ok_or_else(truncated)?;
    if body_end > cursor.buf.len() {
        return Err(truncated());
    }
    let mut doc = Document::new();
    loop {
        if cursor.pos >= body_end {
            return Err(MonoError::ProtocolError("BSON document missing terminator".into()));
        }
        let tag = cursor.byte()?;
        if tag == 0x00 {
            if cursor.pos != body_end {
                return Err(MonoError::ProtocolError("BSON terminator before declared end".into()));
            }
            return Ok(doc);
        }
        let name = cursor.cstring()?;
        let value = decode_value(cursor, tag)?;
        doc.push_raw(name, value);
    }
}

fn decode_value(cursor: &mut Cursor<'_>, tag: u8) -> MonoResult<Value> {
    match tag {
        TAG_DOUBLE => Ok(Value::Double(cursor.f64()?)),
        TAG_STRING => Ok(Value::String(cursor.string()?)),
        TAG_DOCUMENT => Ok(Value::Document(decode_container(cursor)?)),
        TAG_ARRAY => {
            let arr_doc = decode_container(cursor)?;
            Ok(Value::Array(arr_doc.iter().map(|(_, v)| v.clone()).collect()))
        }
        TAG_BINARY => {
            let len = cursor.i32()?;
            if len < 0 {
                return Err(MonoError::ProtocolError("invalid BSON binary length".into()));
            }
            let subtype = cursor.byte()?;
            let bytes = cursor.take(len as usize)?;
            Ok(Value::Binary(subtype, bytes.to_vec()))
        }
        TAG_OBJECT_ID => {
            let bytes = cursor.take(12)?;
            let mut arr = [0u8; 12];
            arr.copy_from_slice(bytes);
            Ok(Value::ObjectId(ObjectId::from_bytes(arr)))
        }
        TAG_BOOLEAN => match cursor.byte()? {
            0x00 => Ok(Value::Boolean(false)),
            0x01 => Ok(Value::Boolean(true)),
            _ => Err(MonoError::ProtocolError("invalid BSON boolean byte".into())),
        },
        TAG_DATETIME => Ok(Value::DateTime(cursor.i64()?)),
        TAG_NULL => Ok(Value::Null),
        TAG_REGEX => {
            let pattern = cursor.cstring()?;
            let options = cursor.cstring()?;
            Ok(Value::Regex { pattern, options })
        }
        TAG_INT32 => Ok(Value::Int32(cursor.i32()?)),
        TAG_TIMESTAMP => {
            let ordinal = cursor.u32()?;
            let seconds = cursor.u32()?;
            Ok(Value::Timestamp { seconds, ordinal })
        }
        TAG_INT64 => Ok(Value::Int64(cursor.i64()?)),
        TAG_DECIMAL128 => {
            let bytes = cursor.take(16)?;
            let mut arr = [0u8; 16];
            arr.copy_from_slice(bytes);
            Ok(Value::Decimal128(Decimal128::from_bits(arr)))
        }
        TAG_MIN_KEY => Ok(Value::MinKey),
        TAG_MAX_KEY => Ok(Value::MaxKey),
        other => Err(MonoError::ProtocolError(format!("unknown BSON type tag 0x{other:02x}"))),
    }
}
