//! Message encoders. Request encoders exist so tests (and the interactive
//! binary's peers) can speak the protocol from the client side; reply
//! encoders produce the OP_REPLY and OP_MSG messages the server sends.
//! Returns include the full 16-byte header.

use super::{MessageHeader, OP_DELETE, OP_GET_MORE, OP_INSERT, OP_KILL_CURSORS, OP_MSG, OP_QUERY, OP_REPLY, OP_UPDATE};
use crate::error::{Error, Result};
use bson::Document;

fn message(op_code: i32, request_id: i32, response_to: i32, body: &[u8]) -> Vec<u8> {
    let header = MessageHeader {
        message_length: 16 + body.len() as i32,
        request_id,
        response_to,
        op_code,
    };
    let mut out = Vec::with_capacity(16 + body.len());
    out.extend_from_slice(&header.pack());
    out.extend_from_slice(body);
    out
}

fn doc_bytes(doc: &Document) -> Vec<u8> {
    bson::to_vec(doc).expect("bson encode")
}

fn push_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

pub fn encode_op_query(
    request_id: i32,
    namespace: &str,
    flags: u32,
    num_to_skip: i32,
    num_to_return: i32,
    query: &Document,
    fields: Option<&Document>,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&flags.to_le_bytes());
    push_cstring(&mut body, namespace);
    body.extend_from_slice(&num_to_skip.to_le_bytes());
    body.extend_from_slice(&num_to_return.to_le_bytes());
    body.extend_from_slice(&doc_bytes(query));
    if let Some(fields) = fields {
        body.extend_from_slice(&doc_bytes(fields));
    }
    message(OP_QUERY, request_id, 0, &body)
}

pub fn encode_op_insert(request_id: i32, namespace: &str, flags: u32, docs: &[Document]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&flags.to_le_bytes());
    push_cstring(&mut body, namespace);
    for doc in docs {
        body.extend_from_slice(&doc_bytes(doc));
    }
    message(OP_INSERT, request_id, 0, &body)
}

pub fn encode_op_update(
    request_id: i32,
    namespace: &str,
    flags: u32,
    selector: &Document,
    update: &Document,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes()); // reserved
    push_cstring(&mut body, namespace);
    body.extend_from_slice(&flags.to_le_bytes());
    body.extend_from_slice(&doc_bytes(selector));
    body.extend_from_slice(&doc_bytes(update));
    message(OP_UPDATE, request_id, 0, &body)
}

pub fn encode_op_delete(
    request_id: i32,
    namespace: &str,
    flags: u32,
    selector: &Document,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes()); // reserved
    push_cstring(&mut body, namespace);
    body.extend_from_slice(&flags.to_le_bytes());
    body.extend_from_slice(&doc_bytes(selector));
    message(OP_DELETE, request_id, 0, &body)
}

pub fn encode_op_get_more(
    request_id: i32,
    namespace: &str,
    num_to_return: i32,
    cursor_id: i64,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes()); // reserved
    push_cstring(&mut body, namespace);
    body.extend_from_slice(&num_to_return.to_le_bytes());
    body.extend_from_slice(&cursor_id.to_le_bytes());
    message(OP_GET_MORE, request_id, 0, &body)
}

pub fn encode_op_kill_cursors(request_id: i32, cursor_ids: &[i64]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes()); // reserved
    body.extend_from_slice(&(cursor_ids.len() as i32).to_le_bytes());
    for id in cursor_ids {
        body.extend_from_slice(&id.to_le_bytes());
    }
    message(OP_KILL_CURSORS, request_id, 0, &body)
}

/// Encode a client-side OP_MSG with a single kind-0 section.
pub fn encode_op_msg(request_id: i32, doc: &Document, flags: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&flags.to_le_bytes());
    body.push(0u8); // section kind 0
    body.extend_from_slice(&doc_bytes(doc));
    message(OP_MSG, request_id, 0, &body)
}

/// Encode a client-side OP_MSG with a kind-0 body and one kind-1 document
/// sequence, the way drivers ship bulk writes.
pub fn encode_op_msg_with_sequence(
    request_id: i32,
    body_doc: &Document,
    identifier: &str,
    docs: &[Document],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(0u8);
    body.extend_from_slice(&doc_bytes(body_doc));
    body.push(1u8);
    let mut seq = Vec::new();
    for doc in docs {
        seq.extend_from_slice(&doc_bytes(doc));
    }
    // The section size counts from the size field itself.
    let section_size = 4 + identifier.len() + 1 + seq.len();
    body.extend_from_slice(&(section_size as i32).to_le_bytes());
    push_cstring(&mut body, identifier);
    body.extend_from_slice(&seq);
    message(OP_MSG, request_id, 0, &body)
}

/// Encode an OP_MSG reply: flag bits, then a kind-0 section with one document.
pub fn encode_op_msg_reply(
    request_id: i32,
    response_to: i32,
    doc: &Document,
    flags: u32,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&flags.to_le_bytes());
    body.push(0u8);
    body.extend_from_slice(&doc_bytes(doc));
    message(OP_MSG, request_id, response_to, &body)
}

/// Encode an OP_REPLY with the provided documents.
pub fn encode_op_reply(
    request_id: i32,
    response_to: i32,
    flags: u32,
    cursor_id: i64,
    starting_from: i32,
    docs: &[Document],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&flags.to_le_bytes());
    body.extend_from_slice(&cursor_id.to_le_bytes());
    body.extend_from_slice(&starting_from.to_le_bytes());
    body.extend_from_slice(&(docs.len() as i32).to_le_bytes());
    for doc in docs {
        body.extend_from_slice(&doc_bytes(doc));
    }
    message(OP_REPLY, request_id, response_to, &body)
}

/// Decode an OP_REPLY body into (flags, cursor_id, starting_from, docs).
/// This is the client side of the codec, used by tests reading legacy replies.
pub fn decode_op_reply(body: &[u8]) -> Result<(u32, i64, i32, Vec<Document>)> {
    if body.len() < 20 {
        return Err(Error::Malformed("OP_REPLY too short".into()));
    }
    let flags = super::read_u32(body, 0).unwrap_or(0);
    let cursor_id = super::read_i64(body, 4).unwrap_or(0);
    let starting_from = super::read_i32(body, 12).unwrap_or(0);
    let number_returned = super::read_i32(body, 16).unwrap_or(0);
    let mut docs = Vec::with_capacity(number_returned.max(0) as usize);
    let mut pos = 20usize;
    for _ in 0..number_returned {
        let dlen = super::read_i32(body, pos)
            .ok_or_else(|| Error::Malformed("OP_REPLY truncated document".into()))?
            as usize;
        if dlen < 5 || pos + dlen > body.len() {
            return Err(Error::Malformed("OP_REPLY document overrun".into()));
        }
        let doc = Document::from_reader(&mut std::io::Cursor::new(&body[pos..pos + dlen]))?;
        docs.push(doc);
        pos += dlen;
    }
    Ok((flags, cursor_id, starting_from, docs))
}
