//! A decoded inbound message, tagged with the connection it arrived on and
//! the server that owns it. Holding only a `Request`, the test task can
//! assert on its contents and dictate the reply.
//!
//! A request may be replied to exactly once; later attempts fail with
//! [`Error::AlreadyReplied`](crate::error::Error::AlreadyReplied).

use crate::error::{Error, Result};
use crate::protocol::{reply_flags, RequestBody};
use crate::reply::Reply;
use crate::server::{Connection, ServerShared};
use bson::{doc, Bson, Document};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Request {
    request_id: i32,
    body: RequestBody,
    conn: Arc<Connection>,
    server: Arc<ServerShared>,
    replied: AtomicBool,
}

impl Request {
    pub(crate) fn new(
        request_id: i32,
        body: RequestBody,
        conn: Arc<Connection>,
        server: Arc<ServerShared>,
    ) -> Self {
        Self {
            request_id,
            body,
            conn,
            server,
            replied: AtomicBool::new(false),
        }
    }

    /// The client-assigned request id from the message header.
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// The request documents: the command or query document, the legacy
    /// write payload, or nothing for cursor opcodes.
    pub fn docs(&self) -> Vec<&Document> {
        self.body.matching_docs()
    }

    /// The request document, asserting there is exactly one.
    ///
    /// Use this for queries and commands; legacy writes may carry several
    /// documents, OP_GET_MORE and OP_KILL_CURSORS none.
    pub fn doc(&self) -> &Document {
        let docs = self.body.matching_docs();
        assert!(docs.len() == 1, "{self} does not have exactly one document");
        docs[0]
    }

    pub fn namespace(&self) -> Option<&str> {
        self.body.namespace()
    }

    pub fn flags(&self) -> u32 {
        self.body.flags()
    }

    pub fn is_command(&self) -> bool {
        self.body.is_command()
    }

    pub fn num_to_skip(&self) -> Option<i32> {
        self.body.num_to_skip()
    }

    pub fn num_to_return(&self) -> Option<i32> {
        self.body.num_to_return()
    }

    pub fn cursor_id(&self) -> Option<i64> {
        self.body.cursor_id()
    }

    pub fn cursor_ids(&self) -> Option<&[i64]> {
        self.body.cursor_ids()
    }

    /// Server-assigned serial id of the originating connection.
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    pub fn peer_addr(&self) -> &str {
        self.conn.peer()
    }

    /// Send a reply on the originating connection.
    ///
    /// The wire form (OP_REPLY or OP_MSG) follows the request's opcode, the
    /// reply's `response_to` is this request's id, and its request id comes
    /// from the server's counter. Fails if the request was already replied
    /// to or the connection is gone.
    pub async fn reply(&self, reply: impl Into<Reply>) -> Result<()> {
        let reply = reply.into();
        self.consume()?;
        let reply_id = self.server.next_reply_id();
        let bytes = reply.encode_for(&self.body, self.request_id, reply_id)?;
        self.server.log_reply(self.conn.id(), &reply);
        self.conn.send(&bytes).await
    }

    /// Synonym for [`reply`](Self::reply).
    pub async fn send(&self, reply: impl Into<Reply>) -> Result<()> {
        self.reply(reply).await
    }

    /// Error reply to a command: `{ok: 0, code, errmsg}`.
    pub async fn command_err(&self, code: i32, errmsg: impl Into<String>) -> Result<()> {
        self.command_err_with(code, errmsg, Document::new()).await
    }

    /// Error reply to a command with extra fields merged in.
    pub async fn command_err_with(
        &self,
        code: i32,
        errmsg: impl Into<String>,
        extras: Document,
    ) -> Result<()> {
        let mut doc = doc! {"ok": 0, "code": code, "errmsg": errmsg.into()};
        for (key, value) in extras {
            doc.insert(key, value);
        }
        self.reply(doc).await
    }

    /// Reply to a legacy query with the QueryFailure flag and an `$err` key.
    pub async fn fail(&self, err: impl Into<String>) -> Result<()> {
        self.reply(
            Reply::new(doc! {"$err": err.into()}).flags(reply_flags::QUERY_FAILURE),
        )
        .await
    }

    /// Send a getlasterror response: `{ok: 1, err: null}`.
    pub async fn replies_to_gle(&self) -> Result<()> {
        self.reply(doc! {"err": Bson::Null}).await
    }

    /// Close the originating connection without replying. The client sees
    /// the close as a reset-shaped network error.
    pub async fn hangup(&self) -> Result<()> {
        self.consume()?;
        self.conn.close().await;
        Ok(())
    }

    fn consume(&self) -> Result<()> {
        if self.replied.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyReplied(self.request_id));
        }
        Ok(())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.body.fmt(f)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request(id={}, {})", self.request_id, self.body)
    }
}
