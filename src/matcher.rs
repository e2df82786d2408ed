//! Request pattern matching.
//!
//! A [`Matcher`] decides whether a decoded request satisfies a pattern. It is
//! used by `MockServer::receives` to assert the client sent what the test
//! expects, and by the autoresponder chain to dispatch canned replies.
//! Matching is pure: it never consumes or mutates the request.

use crate::protocol::RequestBody;
use crate::request::Request;
use bson::{Bson, Document};
use std::fmt;

/// Sentinel bound to a pattern key to assert that the key is absent from the
/// request document.
///
/// Encoded as a BSON symbol, a deprecated type no driver produces.
pub fn absent() -> Bson {
    Bson::Symbol(ABSENT_MARKER.to_string())
}

const ABSENT_MARKER: &str = "__absent__";

fn is_absent(value: &Bson) -> bool {
    matches!(value, Bson::Symbol(s) if s == ABSENT_MARKER)
}

/// Opcode classes for strict matching. The command class (OP_MSG plus
/// command-carrying OP_QUERY) is expressed by [`Matcher::command`] instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Query,
    Insert,
    Update,
    Delete,
    GetMore,
    KillCursors,
    Msg,
}

impl OpKind {
    fn matches(self, body: &RequestBody) -> bool {
        matches!(
            (self, body),
            (OpKind::Query, RequestBody::Query(_))
                | (OpKind::Insert, RequestBody::Insert(_))
                | (OpKind::Update, RequestBody::Update(_))
                | (OpKind::Delete, RequestBody::Delete(_))
                | (OpKind::GetMore, RequestBody::GetMore(_))
                | (OpKind::KillCursors, RequestBody::KillCursors(_))
                | (OpKind::Msg, RequestBody::Msg(_))
        )
    }
}

#[derive(Clone, Debug, Default)]
enum PatternSpec {
    /// Matches every request.
    #[default]
    Empty,
    /// Matches commands (OP_MSG or `.$cmd` OP_QUERY) whose first document
    /// contains the pattern document as a subset.
    Command(CommandPattern),
    /// Strict opcode matching with opcode-specific extras.
    Op(OpPattern),
    /// Document-subset matching against any opcode.
    Docs(DocsPattern),
}

#[derive(Clone, Debug)]
struct CommandPattern {
    doc: Document,
    namespace: Option<String>,
    ordered: bool,
}

#[derive(Clone, Debug)]
struct OpPattern {
    kind: Option<OpKind>,
    namespace: Option<String>,
    flags: Option<u32>,
    num_to_skip: Option<i32>,
    num_to_return: Option<i32>,
    cursor_id: Option<i64>,
    cursor_ids: Option<Vec<i64>>,
    docs: Option<Vec<Document>>,
    ordered: bool,
}

impl OpPattern {
    fn new(kind: Option<OpKind>) -> Self {
        Self {
            kind,
            namespace: None,
            flags: None,
            num_to_skip: None,
            num_to_return: None,
            cursor_id: None,
            cursor_ids: None,
            docs: None,
            ordered: false,
        }
    }
}

#[derive(Clone, Debug)]
struct DocsPattern {
    docs: Vec<Document>,
    ordered: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Matcher {
    spec: PatternSpec,
}

impl Matcher {
    /// The empty pattern; matches everything.
    pub fn any() -> Self {
        Self::default()
    }

    /// Match a command by name: `command("ismaster")` expands to the pattern
    /// document `{"ismaster": 1}` applied to the request's first document.
    pub fn command(name: impl Into<String>) -> Self {
        let mut doc = Document::new();
        doc.insert(name.into(), 1i32);
        Self {
            spec: PatternSpec::Command(CommandPattern {
                doc,
                namespace: None,
                ordered: false,
            }),
        }
    }

    /// Match a command whose first document contains `doc` as a subset.
    pub fn command_doc(doc: Document) -> Self {
        Self {
            spec: PatternSpec::Command(CommandPattern {
                doc,
                namespace: None,
                ordered: false,
            }),
        }
    }

    /// Strictly match OP_MSG commands: `op_msg("insert", "coll")` expands to
    /// the pattern document `{"insert": "coll"}`.
    pub fn op_msg(name: impl Into<String>, value: impl Into<Bson>) -> Self {
        let mut doc = Document::new();
        doc.insert(name.into(), value.into());
        Self::op_msg_doc(doc)
    }

    pub fn op_msg_doc(doc: Document) -> Self {
        let mut op = OpPattern::new(Some(OpKind::Msg));
        op.docs = Some(vec![doc]);
        Self {
            spec: PatternSpec::Op(op),
        }
    }

    /// Strictly match OP_QUERY (commands carried by OP_QUERY included).
    pub fn op_query(query: Document) -> Self {
        let mut op = OpPattern::new(Some(OpKind::Query));
        op.docs = Some(vec![query]);
        Self {
            spec: PatternSpec::Op(op),
        }
    }

    pub fn op_insert(docs: Vec<Document>) -> Self {
        let mut op = OpPattern::new(Some(OpKind::Insert));
        op.docs = Some(docs);
        Self {
            spec: PatternSpec::Op(op),
        }
    }

    pub fn op_update(selector: Document, update: Document) -> Self {
        let mut op = OpPattern::new(Some(OpKind::Update));
        op.docs = Some(vec![selector, update]);
        Self {
            spec: PatternSpec::Op(op),
        }
    }

    pub fn op_delete(selector: Document) -> Self {
        let mut op = OpPattern::new(Some(OpKind::Delete));
        op.docs = Some(vec![selector]);
        Self {
            spec: PatternSpec::Op(op),
        }
    }

    pub fn op_get_more() -> Self {
        Self {
            spec: PatternSpec::Op(OpPattern::new(Some(OpKind::GetMore))),
        }
    }

    pub fn op_kill_cursors() -> Self {
        Self {
            spec: PatternSpec::Op(OpPattern::new(Some(OpKind::KillCursors))),
        }
    }

    /// Match any opcode by a strict opcode class.
    pub fn op(kind: OpKind) -> Self {
        Self {
            spec: PatternSpec::Op(OpPattern::new(Some(kind))),
        }
    }

    /// Match any opcode whose documents contain `docs` pairwise as subsets.
    pub fn docs(docs: Vec<Document>) -> Self {
        Self {
            spec: PatternSpec::Docs(DocsPattern {
                docs,
                ordered: false,
            }),
        }
    }

    pub fn doc(doc: Document) -> Self {
        Self::docs(vec![doc])
    }

    /// Require an exact namespace (`db.collection`, or the database alone
    /// for commands).
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        let ns = ns.into();
        self.spec = match self.spec {
            PatternSpec::Command(mut c) => {
                c.namespace = Some(ns);
                PatternSpec::Command(c)
            }
            other => {
                let mut op = into_op(other);
                op.namespace = Some(ns);
                PatternSpec::Op(op)
            }
        };
        self
    }

    /// Require the given flag bits to be set on the request.
    pub fn flags(self, mask: u32) -> Self {
        self.map_op(|op| op.flags = Some(mask))
    }

    pub fn num_to_skip(self, n: i32) -> Self {
        self.map_op(|op| op.num_to_skip = Some(n))
    }

    pub fn num_to_return(self, n: i32) -> Self {
        self.map_op(|op| op.num_to_return = Some(n))
    }

    pub fn cursor_id(self, id: i64) -> Self {
        self.map_op(|op| op.cursor_id = Some(id))
    }

    pub fn cursor_ids(self, ids: Vec<i64>) -> Self {
        self.map_op(|op| op.cursor_ids = Some(ids))
    }

    /// Declare the pattern documents ordered: their key order must equal the
    /// order of the corresponding keys in the request document.
    pub fn ordered(mut self) -> Self {
        match &mut self.spec {
            PatternSpec::Command(c) => c.ordered = true,
            PatternSpec::Op(op) => op.ordered = true,
            PatternSpec::Docs(d) => d.ordered = true,
            PatternSpec::Empty => {}
        }
        self
    }

    /// Add a key/value pair to the (first) pattern document.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        let key = key.into();
        let value = value.into();
        match &mut self.spec {
            PatternSpec::Command(c) => {
                c.doc.insert(key, value);
            }
            PatternSpec::Op(op) => {
                let docs = op.docs.get_or_insert_with(|| vec![Document::new()]);
                if let Some(first) = docs.first_mut() {
                    first.insert(key, value);
                }
            }
            PatternSpec::Docs(d) => {
                if let Some(first) = d.docs.first_mut() {
                    first.insert(key, value);
                }
            }
            PatternSpec::Empty => {
                let mut doc = Document::new();
                doc.insert(key, value);
                self.spec = PatternSpec::Docs(DocsPattern {
                    docs: vec![doc],
                    ordered: false,
                });
            }
        }
        self
    }

    fn map_op(mut self, f: impl FnOnce(&mut OpPattern)) -> Self {
        let mut op = into_op(std::mem::take(&mut self.spec));
        f(&mut op);
        self.spec = PatternSpec::Op(op);
        self
    }

    pub fn matches(&self, request: &Request) -> bool {
        self.matches_body(request.body())
    }

    pub(crate) fn matches_body(&self, body: &RequestBody) -> bool {
        match &self.spec {
            PatternSpec::Empty => true,
            PatternSpec::Command(c) => {
                if !body.is_command() {
                    return false;
                }
                if let Some(ns) = &c.namespace {
                    if body.namespace() != Some(ns.as_str()) {
                        return false;
                    }
                }
                match body.matching_docs().first() {
                    Some(doc) => doc_matches(&c.doc, doc, c.ordered),
                    None => false,
                }
            }
            PatternSpec::Op(op) => op_matches(op, body),
            PatternSpec::Docs(d) => docs_match(&d.docs, &body.matching_docs(), d.ordered),
        }
    }
}

impl From<&str> for Matcher {
    fn from(name: &str) -> Self {
        Matcher::command(name)
    }
}

impl From<String> for Matcher {
    fn from(name: String) -> Self {
        Matcher::command(name)
    }
}

impl From<Document> for Matcher {
    fn from(doc: Document) -> Self {
        Matcher::doc(doc)
    }
}

impl From<Vec<Document>> for Matcher {
    fn from(docs: Vec<Document>) -> Self {
        Matcher::docs(docs)
    }
}

fn into_op(spec: PatternSpec) -> OpPattern {
    match spec {
        PatternSpec::Op(op) => op,
        PatternSpec::Empty => OpPattern::new(None),
        PatternSpec::Docs(d) => {
            let mut op = OpPattern::new(None);
            op.docs = Some(d.docs);
            op.ordered = d.ordered;
            op
        }
        PatternSpec::Command(c) => {
            // Commands arrive as OP_MSG in practice; strict refinements pin
            // the opcode down.
            let mut op = OpPattern::new(Some(OpKind::Msg));
            op.docs = Some(vec![c.doc]);
            op.namespace = c.namespace;
            op.ordered = c.ordered;
            op
        }
    }
}

fn op_matches(op: &OpPattern, body: &RequestBody) -> bool {
    if let Some(kind) = op.kind {
        if !kind.matches(body) {
            return false;
        }
    }
    if let Some(mask) = op.flags {
        if body.flags() & mask != mask {
            return false;
        }
    }
    if let Some(ns) = &op.namespace {
        if body.namespace() != Some(ns.as_str()) {
            return false;
        }
    }
    if let Some(n) = op.num_to_skip {
        if body.num_to_skip() != Some(n) {
            return false;
        }
    }
    if let Some(n) = op.num_to_return {
        if body.num_to_return() != Some(n) {
            return false;
        }
    }
    if let Some(id) = op.cursor_id {
        if body.cursor_id() != Some(id) {
            return false;
        }
    }
    if let Some(ids) = &op.cursor_ids {
        if body.cursor_ids() != Some(ids.as_slice()) {
            return false;
        }
    }
    if let Some(docs) = &op.docs {
        if !docs_match(docs, &body.matching_docs(), op.ordered) {
            return false;
        }
    }
    true
}

fn docs_match(patterns: &[Document], actuals: &[&Document], ordered: bool) -> bool {
    if patterns.len() != actuals.len() {
        return false;
    }
    patterns
        .iter()
        .zip(actuals)
        .all(|(p, a)| doc_matches(p, a, ordered))
}

/// Subset rule: every pattern key must exist in the request document with a
/// matching value, except keys bound to [`absent`], which must not exist.
fn doc_matches(pattern: &Document, actual: &Document, ordered: bool) -> bool {
    for (key, pv) in pattern {
        if is_absent(pv) {
            if actual.contains_key(key) {
                return false;
            }
            continue;
        }
        match actual.get(key) {
            Some(av) => {
                if !value_matches(pv, av, ordered) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if ordered {
        let mut last: Option<usize> = None;
        for (key, pv) in pattern {
            if is_absent(pv) {
                continue;
            }
            let idx = match actual.keys().position(|k| k == key) {
                Some(i) => i,
                None => return false,
            };
            if let Some(prev) = last {
                if idx <= prev {
                    return false;
                }
            }
            last = Some(idx);
        }
    }
    true
}

fn value_matches(pattern: &Bson, actual: &Bson, ordered: bool) -> bool {
    match (pattern, actual) {
        (Bson::Document(p), Bson::Document(a)) => doc_matches(p, a, ordered),
        (Bson::Array(p), Bson::Array(a)) => {
            p.len() == a.len()
                && p.iter()
                    .zip(a)
                    .all(|(pe, ae)| value_matches(pe, ae, ordered))
        }
        _ => bson_eq(pattern, actual),
    }
}

/// Scalar equivalence: numeric types compare by value across int32/int64/
/// double, datetimes compare at millisecond resolution, and everything else
/// compares by canonical BSON bytes.
pub(crate) fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Int32(x), Bson::Int64(y)) | (Bson::Int64(y), Bson::Int32(x)) => {
            i64::from(*x) == *y
        }
        (Bson::Int32(x), Bson::Double(y)) | (Bson::Double(y), Bson::Int32(x)) => {
            f64::from(*x) == *y
        }
        (Bson::Int64(x), Bson::Double(y)) | (Bson::Double(y), Bson::Int64(x)) => {
            *x as f64 == *y
        }
        (Bson::DateTime(x), Bson::DateTime(y)) => x.timestamp_millis() == y.timestamp_millis(),
        _ => canonical_bytes(a) == canonical_bytes(b),
    }
}

fn canonical_bytes(value: &Bson) -> Vec<u8> {
    let mut doc = Document::new();
    doc.insert("", value.clone());
    bson::to_vec(&doc).unwrap_or_default()
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.spec {
            PatternSpec::Empty => write!(f, "Request()"),
            PatternSpec::Command(c) => write!(f, "Command({})", c.doc),
            PatternSpec::Op(op) => {
                let name = match op.kind {
                    Some(OpKind::Query) => "OpQuery",
                    Some(OpKind::Insert) => "OpInsert",
                    Some(OpKind::Update) => "OpUpdate",
                    Some(OpKind::Delete) => "OpDelete",
                    Some(OpKind::GetMore) => "OpGetMore",
                    Some(OpKind::KillCursors) => "OpKillCursors",
                    Some(OpKind::Msg) => "OpMsg",
                    None => "Request",
                };
                write!(f, "{name}(")?;
                let mut sep = "";
                if let Some(docs) = &op.docs {
                    for doc in docs {
                        write!(f, "{sep}{doc}")?;
                        sep = ", ";
                    }
                }
                if let Some(ns) = &op.namespace {
                    write!(f, "{sep}namespace={ns}")?;
                    sep = ", ";
                }
                if let Some(id) = op.cursor_id {
                    write!(f, "{sep}cursor_id={id}")?;
                    sep = ", ";
                }
                if let Some(flags) = op.flags {
                    write!(f, "{sep}flags={flags}")?;
                }
                write!(f, ")")
            }
            PatternSpec::Docs(d) => {
                write!(f, "Request(")?;
                let mut sep = "";
                for doc in &d.docs {
                    write!(f, "{sep}{doc}")?;
                    sep = ", ";
                }
                write!(f, ")")
            }
        }
    }
}
