//! Reply values and the reply-spec grammar.
//!
//! Most call sites pass something convertible into a [`Reply`]: a document,
//! a numeric `ok` value, a field name, or a batch of documents. Whether the
//! wire form is OP_REPLY or OP_MSG is decided by the opcode of the request
//! being answered.

use crate::error::{Error, Result};
use crate::protocol::{encode_op_msg_reply, encode_op_reply, RequestBody};
use bson::{doc, Bson, Document};
use std::fmt;

#[derive(Clone, Debug, Default)]
pub struct Reply {
    docs: Vec<Document>,
    flags: u32,
    cursor_id: i64,
    starting_from: i32,
}

impl Reply {
    pub fn new(doc: Document) -> Self {
        Self {
            docs: vec![doc],
            ..Self::default()
        }
    }

    /// A reply carrying several documents (legacy query batches).
    pub fn batch(docs: Vec<Document>) -> Self {
        Self {
            docs,
            ..Self::default()
        }
    }

    /// `{"ok": 1}`.
    pub fn ok() -> Self {
        Self::new(doc! {"ok": 1})
    }

    /// Response flag bits for OP_REPLY, or OP_MSG flag bits.
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn cursor_id(mut self, id: i64) -> Self {
        self.cursor_id = id;
        self
    }

    pub fn starting_from(mut self, n: i32) -> Self {
        self.starting_from = n;
        self
    }

    /// Add a field to the (single) reply document.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        if self.docs.is_empty() {
            self.docs.push(Document::new());
        }
        if let Some(first) = self.docs.first_mut() {
            first.insert(key.into(), value.into());
        }
        self
    }

    pub fn docs(&self) -> &[Document] {
        &self.docs
    }

    /// Encode for the given request. Commands get a default `ok: 1` when the
    /// reply document does not set one; a command reply with more than one
    /// document is rejected.
    pub(crate) fn encode_for(
        &self,
        request: &RequestBody,
        response_to: i32,
        request_id: i32,
    ) -> Result<Vec<u8>> {
        if let RequestBody::Msg(_) = request {
            if self.docs.len() > 1 {
                return Err(Error::Msg(format!(
                    "command reply with {} documents",
                    self.docs.len()
                )));
            }
            let mut doc = self.docs.first().cloned().unwrap_or_default();
            if !doc.contains_key("ok") {
                doc.insert("ok", 1i32);
            }
            return Ok(encode_op_msg_reply(request_id, response_to, &doc, self.flags));
        }

        let mut docs = self.docs.clone();
        if request.is_command() {
            if docs.len() > 1 {
                return Err(Error::Msg(format!(
                    "command reply with {} documents",
                    docs.len()
                )));
            }
            if docs.is_empty() {
                docs.push(Document::new());
            }
            if let Some(first) = docs.first_mut() {
                if !first.contains_key("ok") {
                    first.insert("ok", 1i32);
                }
            }
        }
        Ok(encode_op_reply(
            request_id,
            response_to,
            self.flags,
            self.cursor_id,
            self.starting_from,
            &docs,
        ))
    }
}

impl From<Document> for Reply {
    fn from(doc: Document) -> Self {
        Reply::new(doc)
    }
}

impl From<Vec<Document>> for Reply {
    fn from(docs: Vec<Document>) -> Self {
        Reply::batch(docs)
    }
}

// A numeric first positional is the `ok` field.
impl From<i32> for Reply {
    fn from(ok: i32) -> Self {
        Reply::new(doc! {"ok": ok})
    }
}

impl From<f64> for Reply {
    fn from(ok: f64) -> Self {
        Reply::new(doc! {"ok": ok})
    }
}

impl From<bool> for Reply {
    fn from(ok: bool) -> Self {
        Reply::new(doc! {"ok": ok})
    }
}

// A string first positional is a field name with value 1.
impl From<&str> for Reply {
    fn from(name: &str) -> Self {
        let mut doc = Document::new();
        doc.insert(name, 1i32);
        Reply::new(doc)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.docs.as_slice() {
            [doc] => write!(f, "Reply({doc})"),
            docs => {
                write!(f, "Reply(")?;
                let mut sep = "";
                for doc in docs {
                    write!(f, "{sep}{doc}")?;
                    sep = ", ";
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_op_reply, MessageHeader, OP_MSG, OP_REPLY};

    fn msg_request() -> RequestBody {
        let wire = crate::protocol::encode_op_msg(1, &doc! {"ping": 1, "$db": "db"}, 0);
        RequestBody::decode(OP_MSG, &wire[16..]).unwrap()
    }

    fn legacy_command() -> RequestBody {
        let wire =
            crate::protocol::encode_op_query(1, "db.$cmd", 0, 0, -1, &doc! {"ping": 1}, None);
        RequestBody::decode(crate::protocol::OP_QUERY, &wire[16..]).unwrap()
    }

    fn legacy_query() -> RequestBody {
        let wire = crate::protocol::encode_op_query(1, "db.coll", 0, 0, 0, &doc! {}, None);
        RequestBody::decode(crate::protocol::OP_QUERY, &wire[16..]).unwrap()
    }

    #[test]
    fn grammar_conversions() {
        assert_eq!(Reply::from(doc! {"a": 1}).docs(), &[doc! {"a": 1}]);
        assert_eq!(Reply::from(0i32).docs(), &[doc! {"ok": 0}]);
        assert_eq!(Reply::from(1.0).docs(), &[doc! {"ok": 1.0}]);
        assert_eq!(Reply::from("ismaster").docs(), &[doc! {"ismaster": 1}]);
        assert_eq!(
            Reply::from(vec![doc! {"a": 1}, doc! {"a": 2}]).docs().len(),
            2
        );
    }

    #[test]
    fn msg_request_gets_op_msg_reply_with_default_ok() {
        let wire = Reply::new(doc! {"n": 1})
            .encode_for(&msg_request(), 7, 42)
            .unwrap();
        let (hdr, _) = MessageHeader::parse(&wire).unwrap();
        assert_eq!(hdr.op_code, OP_MSG);
        assert_eq!(hdr.response_to, 7);
        assert_eq!(hdr.request_id, 42);
        match RequestBody::decode(OP_MSG, &wire[16..]).unwrap() {
            RequestBody::Msg(m) => {
                assert_eq!(m.body.get_i32("n").unwrap(), 1);
                assert_eq!(m.body.get_i32("ok").unwrap(), 1);
            }
            other => panic!("decoded {other}"),
        }
    }

    #[test]
    fn explicit_ok_zero_is_preserved() {
        let wire = Reply::new(doc! {"ok": 0, "code": 11000})
            .encode_for(&msg_request(), 1, 2)
            .unwrap();
        match RequestBody::decode(OP_MSG, &wire[16..]).unwrap() {
            RequestBody::Msg(m) => assert_eq!(m.body.get_i32("ok").unwrap(), 0),
            other => panic!("decoded {other}"),
        }
    }

    #[test]
    fn legacy_command_gets_op_reply_with_default_ok() {
        let wire = Reply::default().encode_for(&legacy_command(), 3, 4).unwrap();
        let (hdr, _) = MessageHeader::parse(&wire).unwrap();
        assert_eq!(hdr.op_code, OP_REPLY);
        let (_, _, _, docs) = decode_op_reply(&wire[16..]).unwrap();
        assert_eq!(docs, vec![doc! {"ok": 1}]);
    }

    #[test]
    fn plain_query_reply_keeps_batch_without_ok() {
        let wire = Reply::batch(vec![doc! {"_id": 1}, doc! {"_id": 2}])
            .cursor_id(55)
            .encode_for(&legacy_query(), 3, 4)
            .unwrap();
        let (_, cursor_id, _, docs) = decode_op_reply(&wire[16..]).unwrap();
        assert_eq!(cursor_id, 55);
        assert_eq!(docs, vec![doc! {"_id": 1}, doc! {"_id": 2}]);
        assert!(!docs[0].contains_key("ok"));
    }

    #[test]
    fn command_reply_rejects_multiple_documents() {
        let err = Reply::batch(vec![doc! {}, doc! {}])
            .encode_for(&msg_request(), 1, 2)
            .unwrap_err();
        assert!(err.to_string().contains("command reply"));
    }
}
