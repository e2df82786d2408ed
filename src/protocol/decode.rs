//! Body decoders. Each takes the message body (everything after the 16-byte
//! header) and produces a typed request value. BSON document decode itself is
//! delegated to the `bson` crate; these functions only slice and dispatch.

use super::{msg_flags, read_cstring, read_i32, read_i64, read_u32, OP_DELETE, OP_GET_MORE, OP_INSERT, OP_KILL_CURSORS, OP_MSG, OP_QUERY, OP_UPDATE};
use crate::error::{Error, Result};
use bson::{Bson, Document};
use std::fmt;

/// A decoded OP_QUERY body. Namespaces ending in `.$cmd` are classified as
/// commands; a `{"$query": ...}` wrapper is unwrapped and surfaced alongside
/// the raw document.
#[derive(Debug, Clone)]
pub struct OpQuery {
    pub flags: u32,
    pub namespace: String,
    pub num_to_skip: i32,
    pub num_to_return: i32,
    pub query: Document,
    pub fields: Option<Document>,
    pub is_command: bool,
    pub unwrapped: Option<Document>,
}

/// A decoded legacy write: OP_INSERT, OP_UPDATE, or OP_DELETE.
///
/// For inserts `docs` holds the inserted documents; for updates the selector
/// then the update document; for deletes the selector alone.
#[derive(Debug, Clone)]
pub struct OpWrite {
    pub flags: u32,
    pub namespace: String,
    pub docs: Vec<Document>,
}

#[derive(Debug, Clone)]
pub struct OpGetMore {
    pub namespace: String,
    pub num_to_return: i32,
    pub cursor_id: i64,
}

#[derive(Debug, Clone)]
pub struct OpKillCursors {
    pub cursor_ids: Vec<i64>,
}

/// A decoded OP_MSG body.
///
/// `body` is the single kind-0 section document as sent. `merged` is the
/// command view: the body document with each kind-1 sequence appended as an
/// array field under its identifier. When an identifier collides with a body
/// key, the sequence wins and shadows the body value.
#[derive(Debug, Clone)]
pub struct OpMsg {
    pub flags: u32,
    pub body: Document,
    pub sequences: Vec<(String, Vec<Document>)>,
    pub merged: Document,
    pub checksum: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Query(OpQuery),
    Insert(OpWrite),
    Update(OpWrite),
    Delete(OpWrite),
    GetMore(OpGetMore),
    KillCursors(OpKillCursors),
    Msg(OpMsg),
}

impl RequestBody {
    pub fn decode(op_code: i32, body: &[u8]) -> Result<Self> {
        match op_code {
            OP_QUERY => decode_op_query(body).map(RequestBody::Query),
            OP_INSERT => decode_legacy_insert(body).map(RequestBody::Insert),
            OP_UPDATE => decode_op_update(body).map(RequestBody::Update),
            OP_DELETE => decode_op_delete(body).map(RequestBody::Delete),
            OP_GET_MORE => decode_op_get_more(body).map(RequestBody::GetMore),
            OP_KILL_CURSORS => decode_op_kill_cursors(body).map(RequestBody::KillCursors),
            OP_MSG => decode_op_msg(body).map(RequestBody::Msg),
            other => Err(Error::UnknownOpcode(other)),
        }
    }

    /// True for OP_MSG and for OP_QUERY against a `.$cmd` namespace.
    pub fn is_command(&self) -> bool {
        match self {
            RequestBody::Msg(_) => true,
            RequestBody::Query(q) => q.is_command,
            _ => false,
        }
    }

    /// `db.collection` for legacy opcodes, the database alone for commands,
    /// absent for OP_KILL_CURSORS and OP_MSG without `$db`.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            RequestBody::Query(q) if q.is_command => q.namespace.strip_suffix(".$cmd"),
            RequestBody::Query(q) => Some(&q.namespace),
            RequestBody::Insert(w) | RequestBody::Update(w) | RequestBody::Delete(w) => {
                Some(&w.namespace)
            }
            RequestBody::GetMore(g) => Some(&g.namespace),
            RequestBody::KillCursors(_) => None,
            RequestBody::Msg(m) => m.merged.get_str("$db").ok(),
        }
    }

    pub fn flags(&self) -> u32 {
        match self {
            RequestBody::Query(q) => q.flags,
            RequestBody::Insert(w) | RequestBody::Update(w) | RequestBody::Delete(w) => w.flags,
            RequestBody::Msg(m) => m.flags,
            RequestBody::GetMore(_) | RequestBody::KillCursors(_) => 0,
        }
    }

    /// The documents a pattern is matched against: the (unwrapped) query or
    /// command document, the legacy write payload, or nothing for cursor ops.
    pub fn matching_docs(&self) -> Vec<&Document> {
        match self {
            RequestBody::Query(q) => vec![q.unwrapped.as_ref().unwrap_or(&q.query)],
            RequestBody::Insert(w) | RequestBody::Update(w) | RequestBody::Delete(w) => {
                w.docs.iter().collect()
            }
            RequestBody::GetMore(_) | RequestBody::KillCursors(_) => Vec::new(),
            RequestBody::Msg(m) => vec![&m.merged],
        }
    }

    pub fn num_to_skip(&self) -> Option<i32> {
        match self {
            RequestBody::Query(q) => Some(q.num_to_skip),
            _ => None,
        }
    }

    pub fn num_to_return(&self) -> Option<i32> {
        match self {
            RequestBody::Query(q) => Some(q.num_to_return),
            RequestBody::GetMore(g) => Some(g.num_to_return),
            _ => None,
        }
    }

    pub fn cursor_id(&self) -> Option<i64> {
        match self {
            RequestBody::GetMore(g) => Some(g.cursor_id),
            _ => None,
        }
    }

    pub fn cursor_ids(&self) -> Option<&[i64]> {
        match self {
            RequestBody::KillCursors(k) => Some(&k.cursor_ids),
            _ => None,
        }
    }
}

fn malformed(what: &str) -> Error {
    Error::Malformed(what.to_string())
}

fn read_doc(buf: &[u8], pos: usize) -> Result<(Document, usize)> {
    let dlen = read_i32(buf, pos).ok_or_else(|| malformed("truncated document length"))? as usize;
    if dlen < 5 || pos + dlen > buf.len() {
        return Err(malformed("document overruns message"));
    }
    let doc = Document::from_reader(&mut std::io::Cursor::new(&buf[pos..pos + dlen]))?;
    Ok((doc, pos + dlen))
}

fn read_docs_to_end(buf: &[u8], mut pos: usize) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    while pos < buf.len() {
        let (doc, next) = read_doc(buf, pos)?;
        docs.push(doc);
        pos = next;
    }
    Ok(docs)
}

fn decode_op_query(body: &[u8]) -> Result<OpQuery> {
    let flags = read_u32(body, 0).ok_or_else(|| malformed("OP_QUERY too short"))?;
    let (namespace, pos) =
        read_cstring(body, 4).ok_or_else(|| malformed("OP_QUERY namespace"))?;
    let num_to_skip = read_i32(body, pos).ok_or_else(|| malformed("OP_QUERY numToSkip"))?;
    let num_to_return =
        read_i32(body, pos + 4).ok_or_else(|| malformed("OP_QUERY numToReturn"))?;
    let mut docs = read_docs_to_end(body, pos + 8)?;
    if docs.is_empty() || docs.len() > 2 {
        return Err(malformed("OP_QUERY document count"));
    }
    let fields = if docs.len() == 2 { docs.pop() } else { None };
    let query = docs.pop().unwrap_or_default();
    let is_command = namespace.ends_with(".$cmd");
    // Drivers may wrap the command in {"$query": ..., "$readPreference": ...}.
    let unwrapped = match query.get("$query") {
        Some(Bson::Document(inner)) => Some(inner.clone()),
        _ => None,
    };
    Ok(OpQuery {
        flags,
        namespace,
        num_to_skip,
        num_to_return,
        query,
        fields,
        is_command,
        unwrapped,
    })
}

fn decode_legacy_insert(body: &[u8]) -> Result<OpWrite> {
    let flags = read_u32(body, 0).ok_or_else(|| malformed("OP_INSERT too short"))?;
    let (namespace, pos) =
        read_cstring(body, 4).ok_or_else(|| malformed("OP_INSERT namespace"))?;
    let docs = read_docs_to_end(body, pos)?;
    if docs.is_empty() {
        return Err(malformed("OP_INSERT without documents"));
    }
    Ok(OpWrite {
        flags,
        namespace,
        docs,
    })
}

fn decode_op_update(body: &[u8]) -> Result<OpWrite> {
    // Leading 4 bytes are reserved.
    let (namespace, pos) =
        read_cstring(body, 4).ok_or_else(|| malformed("OP_UPDATE namespace"))?;
    let flags = read_u32(body, pos).ok_or_else(|| malformed("OP_UPDATE flags"))?;
    let (selector, pos) = read_doc(body, pos + 4)?;
    let (update, pos) = read_doc(body, pos)?;
    if pos != body.len() {
        return Err(malformed("OP_UPDATE trailing bytes"));
    }
    Ok(OpWrite {
        flags,
        namespace,
        docs: vec![selector, update],
    })
}

fn decode_op_delete(body: &[u8]) -> Result<OpWrite> {
    // Leading 4 bytes are reserved.
    let (namespace, pos) =
        read_cstring(body, 4).ok_or_else(|| malformed("OP_DELETE namespace"))?;
    let flags = read_u32(body, pos).ok_or_else(|| malformed("OP_DELETE flags"))?;
    let (selector, pos) = read_doc(body, pos + 4)?;
    if pos != body.len() {
        return Err(malformed("OP_DELETE trailing bytes"));
    }
    Ok(OpWrite {
        flags,
        namespace,
        docs: vec![selector],
    })
}

fn decode_op_get_more(body: &[u8]) -> Result<OpGetMore> {
    // Leading 4 bytes are reserved.
    let (namespace, pos) =
        read_cstring(body, 4).ok_or_else(|| malformed("OP_GET_MORE namespace"))?;
    let num_to_return =
        read_i32(body, pos).ok_or_else(|| malformed("OP_GET_MORE numToReturn"))?;
    let cursor_id = read_i64(body, pos + 4).ok_or_else(|| malformed("OP_GET_MORE cursorID"))?;
    Ok(OpGetMore {
        namespace,
        num_to_return,
        cursor_id,
    })
}

fn decode_op_kill_cursors(body: &[u8]) -> Result<OpKillCursors> {
    // Leading 4 bytes are reserved.
    let count = read_i32(body, 4).ok_or_else(|| malformed("OP_KILL_CURSORS count"))?;
    if count < 0 || (count as usize) > body.len().saturating_sub(8) / 8 {
        return Err(malformed("OP_KILL_CURSORS cursor count"));
    }
    let mut cursor_ids = Vec::with_capacity(count as usize);
    let mut pos = 8;
    for _ in 0..count {
        let id = read_i64(body, pos).ok_or_else(|| malformed("OP_KILL_CURSORS cursorID"))?;
        cursor_ids.push(id);
        pos += 8;
    }
    Ok(OpKillCursors { cursor_ids })
}

fn decode_op_msg(body: &[u8]) -> Result<OpMsg> {
    let flags = read_u32(body, 0).ok_or_else(|| malformed("OP_MSG too short"))?;
    let checksum_present = flags & msg_flags::CHECKSUM_PRESENT != 0;
    let sections_end = if checksum_present {
        body.len()
            .checked_sub(4)
            .filter(|&e| e >= 4)
            .ok_or_else(|| malformed("OP_MSG shorter than its checksum"))?
    } else {
        body.len()
    };

    let mut body_doc: Option<Document> = None;
    let mut sequences: Vec<(String, Vec<Document>)> = Vec::new();
    let mut pos = 4usize;
    // Sections may arrive in any order: one kind-0 body plus any number of
    // kind-1 sequences.
    while pos < sections_end {
        let kind = body[pos];
        pos += 1;
        match kind {
            0 => {
                if body_doc.is_some() {
                    return Err(malformed("OP_MSG with two body sections"));
                }
                let (doc, next) = read_doc(&body[..sections_end], pos)?;
                body_doc = Some(doc);
                pos = next;
            }
            1 => {
                let size = read_i32(&body[..sections_end], pos)
                    .ok_or_else(|| malformed("OP_MSG sequence size"))? as usize;
                // The size counts from the size field itself.
                let section_end = pos + size;
                if size < 5 || section_end > sections_end {
                    return Err(malformed("OP_MSG sequence overruns message"));
                }
                let (ident, mut dpos) = read_cstring(&body[..section_end], pos + 4)
                    .ok_or_else(|| malformed("OP_MSG sequence identifier"))?;
                let mut docs = Vec::new();
                while dpos < section_end {
                    let (doc, next) = read_doc(&body[..section_end], dpos)?;
                    docs.push(doc);
                    dpos = next;
                }
                sequences.push((ident, docs));
                pos = section_end;
            }
            other => {
                return Err(malformed(&format!("OP_MSG section kind {other}")));
            }
        }
    }
    let body_doc = body_doc.ok_or_else(|| malformed("OP_MSG without a body section"))?;

    let checksum = if checksum_present {
        // CRC-32C over the message; read but not verified.
        read_u32(body, sections_end)
    } else {
        None
    };

    let mut merged = body_doc.clone();
    for (ident, docs) in &sequences {
        let arr: Vec<Bson> = docs.iter().cloned().map(Bson::Document).collect();
        merged.insert(ident.clone(), Bson::Array(arr));
    }

    Ok(OpMsg {
        flags,
        body: body_doc,
        sequences,
        merged,
        checksum,
    })
}

// Renders requests the way mismatch messages and verbose logs want them,
// e.g. `Command({"ismaster": 1})` or `OpGetMore(cursor_id=123)`.
impl fmt::Display for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Query(q) if q.is_command => {
                let doc = q.unwrapped.as_ref().unwrap_or(&q.query);
                write!(f, "Command({doc})")
            }
            RequestBody::Query(q) => {
                write!(f, "OpQuery({}", q.query)?;
                if q.num_to_skip != 0 {
                    write!(f, ", numToSkip={}", q.num_to_skip)?;
                }
                if q.num_to_return != 0 {
                    write!(f, ", numToReturn={}", q.num_to_return)?;
                }
                write!(f, ")")
            }
            RequestBody::Insert(w) => write!(f, "OpInsert({})", join_docs(&w.docs)),
            RequestBody::Update(w) => write!(f, "OpUpdate({})", join_docs(&w.docs)),
            RequestBody::Delete(w) => write!(f, "OpDelete({})", join_docs(&w.docs)),
            RequestBody::GetMore(g) => write!(f, "OpGetMore(cursor_id={})", g.cursor_id),
            RequestBody::KillCursors(k) => write!(f, "OpKillCursors({:?})", k.cursor_ids),
            RequestBody::Msg(m) => write!(f, "OpMsg({})", m.merged),
        }
    }
}

fn join_docs(docs: &[Document]) -> String {
    docs.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
