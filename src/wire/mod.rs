//! Wire-protocol framing (§4.12), interface only: parsing and encoding
//! the byte layout a TCP listener would speak, with no listener wired
//! up here. A host embedding this crate owns the socket and hands
//! complete frames to [`parse_request`] / [`encode_reply`].

use crc32c::crc32c_append;

use crate::bson::{decode_document, encode_document, Document};
use crate::errors::{MonoError, MonoResult};

pub const HEADER_LEN: usize = 16;

pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_COMPRESSED: i32 = 2012;
pub const OP_MSG: i32 = 2013;

const FLAG_CHECKSUM_PRESENT: u32 = 1 << 0;
const FLAG_MORE_TO_COME: u32 = 1 << 1;
const KNOWN_REQUIRED_FLAGS: u32 = FLAG_CHECKSUM_PRESENT | FLAG_MORE_TO_COME;
const REQUIRED_FLAG_MASK: u32 = 0x0000_ffff;

const SECTION_KIND_BODY: u8 = 0;
const SECTION_KIND_DOCUMENT_SEQUENCE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    fn parse(bytes: &[u8]) -> MonoResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(MonoError::ProtocolError("message header truncated".into()));
        }
        let word = |i: usize| i32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
        Ok(Self { message_length: word(0), request_id: word(4), response_to: word(8), op_code: word(12) })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_length.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&self.op_code.to_le_bytes());
    }
}

/// A fully parsed incoming request: the command document plus any
/// document-sequence sections merged in as arrays under their
/// identifier, per §4.12's `OP_MSG` section-kind-1 rule.
#[derive(Debug, Clone)]
pub struct Request {
    pub header: MessageHeader,
    pub command: Document,
}

/// Parses one complete frame (`bytes.len()` must equal the header's
/// `message_length`). Returns a structured [`MonoError::ProtocolError`]
/// on any malformed input rather than panicking — the caller is
/// expected to reply with that error's envelope, not drop the
/// connection (per §7).
pub fn parse_request(bytes: &[u8]) -> MonoResult<Request> {
    let header = MessageHeader::parse(bytes)?;
    if header.message_length as usize != bytes.len() {
        return Err(MonoError::ProtocolError("message length does not match frame size".into()));
    }
    match header.op_code {
        OP_MSG => parse_op_msg(header, &bytes[HEADER_LEN..]),
        OP_QUERY => parse_op_query(header, &bytes[HEADER_LEN..]),
        OP_COMPRESSED => Err(MonoError::ProtocolError("OP_COMPRESSED is not supported".into())),
        other => Err(MonoError::ProtocolError(format!("unsupported opcode {other}"))),
    }
}

fn parse_op_msg(header: MessageHeader, mut body: &[u8]) -> MonoResult<Request> {
    if body.len() < 4 {
        return Err(MonoError::ProtocolError("OP_MSG body truncated".into()));
    }
    let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());
    if flags & REQUIRED_FLAG_MASK & !KNOWN_REQUIRED_FLAGS != 0 {
        return Err(MonoError::ProtocolError("unknown required flag bit set".into()));
    }
    body = &body[4..];

    if flags & FLAG_CHECKSUM_PRESENT != 0 {
        if body.len() < 4 {
            return Err(MonoError::ProtocolError("OP_MSG checksum truncated".into()));
        }
        let (sections, checksum_bytes) = body.split_at(body.len() - 4);
        let expected = u32::from_le_bytes(checksum_bytes.try_into().unwrap());
        let mut crc = crc32c_append(0, &header_bytes(&header));
        crc = crc32c_append(crc, &flags.to_le_bytes());
        crc = crc32c_append(crc, sections);
        if crc != expected {
            return Err(MonoError::ProtocolError("OP_MSG checksum mismatch".into()));
        }
        body = sections;
    }

    let mut command: Option<Document> = None;
    let mut sequences: Vec<(String, Vec<Document>)> = Vec::new();
    let mut cursor = body;
    while !cursor.is_empty() {
        let kind = cursor[0];
        cursor = &cursor[1..];
        match kind {
            SECTION_KIND_BODY => {
                let (doc, rest) = take_document(cursor)?;
                command = Some(doc);
                cursor = rest;
            }
            SECTION_KIND_DOCUMENT_SEQUENCE => {
                if cursor.len() < 4 {
                    return Err(MonoError::ProtocolError("document sequence section truncated".into()));
                }
                let size = i32::from_le_bytes(cursor[0..4].try_into().unwrap());
                if size < 4 || size as usize > cursor.len() {
                    return Err(MonoError::ProtocolError("document sequence section size invalid".into()));
                }
                let (section, rest) = cursor.split_at(size as usize);
                cursor = rest;
                let mut inner = &section[4..];
                let (identifier, after_id) = take_cstring(inner)?;
                inner = after_id;
                let mut docs = Vec::new();
                while !inner.is_empty() {
                    let (doc, rest) = take_document(inner)?;
                    docs.push(doc);
                    inner = rest;
                }
                sequences.push((identifier, docs));
            }
            other => return Err(MonoError::ProtocolError(format!("unknown OP_MSG section kind {other}"))),
        }
    }

    let mut command = command.ok_or_else(|| MonoError::ProtocolError("OP_MSG has no kind-0 section".into()))?;
    for (identifier, docs) in sequences {
        command.insert(identifier, crate::bson::Value::Array(docs.into_iter().map(crate::bson::Value::Document).collect()));
    }
    Ok(Request { header, command })
}

/// `OP_QUERY` is only accepted for the legacy `$cmd` handshake: skip
/// flags/fullCollectionName/numberToSkip/numberToReturn and decode the
/// single trailing BSON document as the command.
fn parse_op_query(header: MessageHeader, body: &[u8]) -> MonoResult<Request> {
    if body.len() < 4 {
        return Err(MonoError::ProtocolError("OP_QUERY body truncated".into()));
    }
    let (_, after_name) = take_cstring(&body[4..])?;
    if after_name.len() < 8 {
        return Err(MonoError::ProtocolError("OP_QUERY body truncated".into()));
    }
    let (command, _rest) = take_document(&after_name[8..])?;
    Ok(Request { header, command })
}

fn take_document(bytes: &[u8]) -> MonoResult<(Document, &[u8])> {
    if bytes.len() < 4 {
        return Err(MonoError::ProtocolError("document truncated".into()));
    }
    let len = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if len < 5 || len as usize > bytes.len() {
        return Err(MonoError::ProtocolError("document length invalid".into()));
    }
    let (doc_bytes, rest) = bytes.split_at(len as usize);
    let doc = decode_document(doc_bytes)?;
    Ok((doc, rest))
}

fn take_cstring(bytes: &[u8]) -> MonoResult<(String, &[u8])> {
    let nul = bytes.iter().position(|&b| b == 0).ok_or_else(|| MonoError::ProtocolError("cstring missing terminator".into()))?;
    let s = std::str::from_utf8(&bytes[..nul]).map_err(|_| MonoError::ProtocolError("cstring is not valid UTF-8".into()))?;
    Ok((s.to_string(), &bytes[nul + 1..]))
}

fn header_bytes(header: &MessageHeader) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&header.message_length.to_le_bytes());
    out[4..8].copy_from_slice(&header.request_id.to_le_bytes());
    out[8..12].copy_from_slice(&header.response_to.to_le_bytes());
    out[12..16].copy_from_slice(&header.op_code.to_le_bytes());
    out
}

/// Encodes `reply` as a kind-0 `OP_MSG` response to `request_id`, the
/// shape every client gets regardless of the request's opcode — per
/// §4.12 only legacy `OP_QUERY` handshakes get an `OP_REPLY` back.
#[must_use]
pub fn encode_msg_reply(request_id: i32, reply: &Document) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // flags
    body.push(SECTION_KIND_BODY);
    body.extend_from_slice(&encode_document(reply));

    let message_length = (HEADER_LEN + body.len()) as i32;
    let header = MessageHeader { message_length, request_id: next_request_id(), response_to: request_id, op_code: OP_MSG };
    let mut out = Vec::with_capacity(message_length as usize);
    header.write(&mut out);
    out.extend_from_slice(&body);
    out
}

/// Encodes `reply` as a legacy `OP_REPLY`, for hosts that still speak
/// `OP_QUERY` against `*.$cmd`.
#[must_use]
pub fn encode_legacy_reply(request_id: i32, reply: &Document) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes()); // responseFlags
    body.extend_from_slice(&0i64.to_le_bytes()); // cursorId
    body.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
    body.extend_from_slice(&1i32.to_le_bytes()); // numberReturned
    body.extend_from_slice(&encode_document(reply));

    let message_length = (HEADER_LEN + body.len()) as i32;
    let header = MessageHeader { message_length, request_id: next_request_id(), response_to: request_id, op_code: OP_REPLY };
    let mut out = Vec::with_capacity(message_length as usize);
    header.write(&mut out);
    out.extend_from_slice(&body);
    out
}

fn next_request_id() -> i32 {
    use std::sync::atomic::{AtomicI32, Ordering};
    static COUNTER: AtomicI32 = AtomicI32::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::Value;

    fn frame(op_code: i32, body: Vec<u8>) -> Vec<u8> {
        let message_length = (HEADER_LEN + body.len()) as i32;
        let header = MessageHeader { message_length, request_id: 42, response_to: 0, op_code };
        let mut out = Vec::new();
        header.write(&mut out);
        out.extend_from_slice(&body);
        out
    }

    fn op_msg_body(flags: u32, command: &Document) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&flags.to_le_bytes());
        body.push(SECTION_KIND_BODY);
        body.extend_from_slice(&encode_document(command));
        body
    }

    #[test]
    fn parses_a_kind_zero_op_msg_command() {
        let mut ping = Document::new();
        ping.insert("ping", Value::Int32(1));
        let bytes = frame(OP_MSG, op_msg_body(0, &ping));

        let request = parse_request(&bytes).unwrap();
        assert_eq!(request.header.op_code, OP_MSG);
        assert_eq!(request.command.get("ping"), Some(&Value::Int32(1)));
    }

    #[test]
    fn merges_a_document_sequence_section_as_an_array_field() {
        let mut insert = Document::new();
        insert.insert("insert", Value::String("widgets".into()));
        let mut doc_a = Document::new();
        doc_a.insert("name", Value::String("a".into()));
        let mut doc_b = Document::new();
        doc_b.insert("name", Value::String("b".into()));

        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(SECTION_KIND_BODY);
        body.extend_from_slice(&encode_document(&insert));

        let mut sequence = Vec::new();
        sequence.extend_from_slice(b"documents");
        sequence.push(0);
        sequence.extend_from_slice(&encode_document(&doc_a));
        sequence.extend_from_slice(&encode_document(&doc_b));
        let size = (4 + sequence.len()) as i32;
        body.push(SECTION_KIND_DOCUMENT_SEQUENCE);
        body.extend_from_slice(&size.to_le_bytes());
        body.extend_from_slice(&sequence);

        let bytes = frame(OP_MSG, body);
        let request = parse_request(&bytes).unwrap();
        let Some(Value::Array(docs)) = request.command.get("documents") else { panic!("missing documents array") };
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn rejects_an_unknown_required_flag_bit() {
        let mut ping = Document::new();
        ping.insert("ping", Value::Int32(1));
        let bytes = frame(OP_MSG, op_msg_body(1 << 3, &ping));

        let err = parse_request(&bytes).unwrap_err();
        assert_eq!(err.code(), 17);
        assert_eq!(err.code_name(), "ProtocolError");
    }

    #[test]
    fn accepts_more_to_come_and_checksum_present_flags() {
        let mut ping = Document::new();
        ping.insert("ping", Value::Int32(1));

        let header_placeholder = MessageHeader { message_length: 0, request_id: 42, response_to: 0, op_code: OP_MSG };
        let mut sections = Vec::new();
        sections.push(SECTION_KIND_BODY);
        sections.extend_from_slice(&encode_document(&ping));
        let flags = FLAG_CHECKSUM_PRESENT | FLAG_MORE_TO_COME;

        let message_length = (HEADER_LEN + 4 + sections.len() + 4) as i32;
        let mut real_header = header_placeholder;
        real_header.message_length = message_length;

        let mut crc = crc32c_append(0, &header_bytes(&real_header));
        crc = crc32c_append(crc, &flags.to_le_bytes());
        crc = crc32c_append(crc, &sections);
        let checksum = crc;

        let mut body = Vec::new();
        body.extend_from_slice(&flags.to_le_bytes());
        body.extend_from_slice(&sections);
        body.extend_from_slice(&checksum.to_le_bytes());

        let mut bytes = Vec::new();
        real_header.write(&mut bytes);
        bytes.extend_from_slice(&body);

        let request = parse_request(&bytes).unwrap();
        assert_eq!(request.command.get("ping"), Some(&Value::Int32(1)));
    }

    #[test]
    fn encoded_reply_round_trips_through_parse_request() {
        let mut reply = Document::new();
        reply.insert("ok", Value::Double(1.0));
        let encoded = encode_msg_reply(7, &reply);
        let parsed = parse_request(&encoded).unwrap();
        assert_eq!(parsed.header.response_to, 7);
        assert_eq!(parsed.command.get("ok"), Some(&Value::Double(1.0)));
    }
}
