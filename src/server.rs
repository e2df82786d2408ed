//! The mock server: lifecycle, listeners, connection workers, the
//! autoresponder chain, and the test-facing `receives` surface.
//!
//! One worker task per accepted connection reads framed messages, consults
//! the autoresponder chain, and funnels unanswered requests into the inbox
//! consumed by the test task. Replies travel back through the `Request`'s
//! connection back-reference, so the worker never waits on the test.

use crate::config::{AutoIsMaster, ServerOptions};
use crate::error::{Error, Result};
use crate::inbox::{Inbox, RecvError};
use crate::matcher::Matcher;
use crate::protocol::{read_message, RequestBody};
use crate::reply::Reply;
use crate::request::Request;
use bson::doc;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

const SOFT_CONNECTION_CAP: usize = 128;

pub(crate) trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Listening,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
enum BoundAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(String),
}

impl BoundAddr {
    fn address_string(&self) -> String {
        match self {
            BoundAddr::Tcp(addr) => addr.to_string(),
            #[cfg(unix)]
            BoundAddr::Unix(path) => path.clone(),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

enum RawStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl RawStream {
    fn into_boxed(self) -> Box<dyn StreamIo> {
        match self {
            RawStream::Tcp(stream) => Box::new(stream),
            #[cfg(unix)]
            RawStream::Unix(stream) => Box::new(stream),
        }
    }
}

impl Listener {
    async fn accept(&self) -> std::io::Result<(RawStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((RawStream::Tcp(stream), addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((RawStream::Unix(stream), "unix".to_string()))
            }
        }
    }
}

/// One accepted client socket: the write half behind a lock, the peer
/// address, the server's serial id, and a closed flag checked by `reply`.
pub(crate) struct Connection {
    id: u64,
    peer: String,
    writer: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    closed: AtomicBool,
}

impl Connection {
    fn new(id: u64, peer: String, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            id,
            peer,
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write a full encoded message, or fail if the socket is gone.
    pub(crate) async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionGone(self.id))?;
        let outcome: std::io::Result<()> = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        if outcome.is_err() {
            self.closed.store(true, Ordering::SeqCst);
            *guard = None;
        }
        outcome.map_err(Error::Io)
    }

    pub(crate) async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }
}

enum ResponderAction {
    Static(Reply),
    Handler(Box<dyn Fn(&Request) -> Option<Reply> + Send + Sync>),
}

struct Responder {
    id: u64,
    matcher: Matcher,
    action: ResponderAction,
}

impl Responder {
    /// `None` means this responder declines and the walk continues.
    fn produce(&self, request: &Request) -> Option<Reply> {
        if !self.matcher.matches(request) {
            return None;
        }
        match &self.action {
            ResponderAction::Static(reply) => Some(reply.clone()),
            ResponderAction::Handler(handler) => handler(request),
        }
    }
}

/// Handle returned at autoresponder registration; pass to
/// [`MockServer::remove_responder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponderHandle(u64);

struct ServerInner {
    responders: Vec<Responder>,
    connections: Vec<Arc<Connection>>,
    workers: Vec<JoinHandle<()>>,
    accept: Option<JoinHandle<()>>,
}

pub(crate) struct ServerShared {
    options: ServerOptions,
    inbox: Inbox<Request>,
    state: Mutex<ServerState>,
    // Single server-wide mutex for the autoresponder list and live set;
    // held only for mutation and walks, never across awaits.
    inner: Mutex<ServerInner>,
    reply_id: AtomicI32,
    conn_seq: AtomicU64,
    responder_seq: AtomicU64,
    requests_count: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    addr: OnceLock<BoundAddr>,
}

impl ServerShared {
    /// Request ids for server-sent messages; monotonically increasing.
    pub(crate) fn next_reply_id(&self) -> i32 {
        self.reply_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn log_reply(&self, conn_id: u64, reply: &Reply) {
        if self.options.verbose {
            tracing::info!(connection = conn_id, reply = %reply, "reply sent");
        } else {
            tracing::debug!(connection = conn_id, reply = %reply, "reply sent");
        }
    }

    fn log_request(&self, request: &Request) {
        if self.options.verbose {
            tracing::info!(connection = request.connection_id(), request = %request, "request received");
        } else {
            tracing::debug!(connection = request.connection_id(), request = %request, "request received");
        }
    }

    fn register_connection(&self, conn: Arc<Connection>) {
        let mut inner = self.inner.lock().expect("server lock");
        inner.connections.push(conn);
        if inner.connections.len() > SOFT_CONNECTION_CAP {
            tracing::warn!(
                live = inner.connections.len(),
                "live connections exceed the soft cap"
            );
        }
    }

    fn unregister_connection(&self, id: u64) {
        let mut inner = self.inner.lock().expect("server lock");
        inner.connections.retain(|c| c.id != id);
        inner.workers.retain(|h| !h.is_finished());
    }

    /// Walk responders newest-first; send the first produced reply.
    /// Returns whether the request was consumed.
    async fn autorespond(&self, request: &Request) -> Result<bool> {
        let reply = {
            let inner = self.inner.lock().expect("server lock");
            inner
                .responders
                .iter()
                .rev()
                .find_map(|responder| responder.produce(request))
        };
        match reply {
            Some(reply) => {
                request.reply(reply).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// A simulated mongod.
///
/// Call [`run`](Self::run) to start serving and always [`stop`](Self::stop)
/// to clean up. One test task consumes requests via
/// [`receives`](Self::receives); client connections are served concurrently.
pub struct MockServer {
    shared: Arc<ServerShared>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::with_options(ServerOptions::default())
    }

    pub fn with_options(options: ServerOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let server = Self {
            shared: Arc::new(ServerShared {
                options,
                inbox: Inbox::new(),
                state: Mutex::new(ServerState::Listening),
                inner: Mutex::new(ServerInner {
                    responders: Vec::new(),
                    connections: Vec::new(),
                    workers: Vec::new(),
                    accept: None,
                }),
                reply_id: AtomicI32::new(1),
                conn_seq: AtomicU64::new(1),
                responder_seq: AtomicU64::new(1),
                requests_count: AtomicU64::new(0),
                shutdown_tx,
                addr: OnceLock::new(),
            }),
        };
        server.register_auto_ismaster();
        server
    }

    fn register_auto_ismaster(&self) {
        let reply_doc = match &self.shared.options.auto_ismaster {
            AutoIsMaster::Off => return,
            AutoIsMaster::Enabled => default_handshake_doc(&self.shared.options),
            AutoIsMaster::Reply(doc) => doc.clone(),
        };
        self.autoresponds_fn(Matcher::any(), handshake_responder(reply_doc));
    }

    /// Bind the listener and start the accept loop. Returns the bound
    /// address string (`host:port`, or the Unix socket path).
    pub async fn run(&self) -> Result<String> {
        eprintln!("DEBUG run() start");
        {
            let state = self.shared.state.lock().expect("server lock");
            if *state != ServerState::Listening {
                return Err(Error::Msg(format!("cannot run server in state {state:?}")));
            }
        }
        eprintln!("DEBUG before bind()");

        let (listener, bound) = self.bind().await?;
        eprintln!("DEBUG after bind()");
        {
            let mut state = self.shared.state.lock().expect("server lock");
            if *state != ServerState::Listening {
                return Err(Error::Msg(format!("cannot run server in state {state:?}")));
            }
            *state = ServerState::Running;
        }
        eprintln!("DEBUG after state set");
        let addr_string = bound.address_string();
        let _ = self.shared.addr.set(bound);
        eprintln!("DEBUG after addr set");
        tracing::info!(address = %addr_string, "mock server listening");
        eprintln!("DEBUG after tracing");

        let shared = self.shared.clone();
        let accept = tokio::spawn(accept_loop(shared, listener));
        eprintln!("DEBUG after spawn");
        self.shared.inner.lock().expect("server lock").accept = Some(accept);
        eprintln!("DEBUG after inner lock set, returning");
        Ok(addr_string)
    }

    async fn bind(&self) -> Result<(Listener, BoundAddr)> {
        let options = &self.shared.options;
        if let Some(path) = &options.uds_path {
            #[cfg(unix)]
            {
                let listener = tokio::net::UnixListener::bind(path)?;
                let addr = BoundAddr::Unix(path.display().to_string());
                return Ok((Listener::Unix(listener), addr));
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(Error::Msg(
                    "unix domain sockets are not supported on this platform".into(),
                ));
            }
        }
        let port = options.port.unwrap_or(0);
        let listener = TcpListener::bind((options.bind_addr.as_str(), port)).await?;
        let addr = BoundAddr::Tcp(listener.local_addr()?);
        Ok((Listener::Tcp(listener), addr))
    }

    /// Stop serving: close the listener, every live connection, and the
    /// inbox, then join all workers. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.state.lock().expect("server lock");
            match *state {
                ServerState::Stopping | ServerState::Stopped => return,
                _ => *state = ServerState::Stopping,
            }
        }
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.inbox.close();

        let (accept, workers, connections) = {
            let mut inner = self.shared.inner.lock().expect("server lock");
            (
                inner.accept.take(),
                std::mem::take(&mut inner.workers),
                std::mem::take(&mut inner.connections),
            )
        };
        if let Some(handle) = accept {
            let _ = handle.await;
        }
        for conn in connections {
            conn.close().await;
        }
        for worker in workers {
            let _ = worker.await;
        }
        #[cfg(unix)]
        if let Some(path) = &self.shared.options.uds_path {
            let _ = std::fs::remove_file(path);
        }
        *self.shared.state.lock().expect("server lock") = ServerState::Stopped;
    }

    /// Pop the next request and assert it matches the pattern, waiting up to
    /// the server's `request_timeout`.
    ///
    /// A non-matching request is still consumed; the error reports both the
    /// expected pattern and the actual request.
    pub async fn receives(&self, matcher: impl Into<Matcher>) -> Result<Request> {
        self.receives_within(matcher, self.shared.options.request_timeout)
            .await
    }

    pub async fn receives_within(
        &self,
        matcher: impl Into<Matcher>,
        timeout: Duration,
    ) -> Result<Request> {
        let matcher = matcher.into();
        match self.shared.inbox.recv(timeout).await {
            Ok(request) => {
                if matcher.matches(&request) {
                    Ok(request)
                } else {
                    Err(Error::UnexpectedRequest {
                        expected: matcher.to_string(),
                        actual: request.to_string(),
                    })
                }
            }
            Err(RecvError::TimedOut) => Err(Error::ReceiveTimeout {
                expected: matcher.to_string(),
                timeout,
            }),
            Err(RecvError::Closed) => Err(Error::ServerStopped),
        }
    }

    /// Send a canned reply to every matching request, without involving the
    /// test task. Responders added later take precedence.
    ///
    /// If the request at the head of the inbox matches, it is popped and
    /// replied to; future matching requests skip the inbox entirely.
    pub fn autoresponds(
        &self,
        matcher: impl Into<Matcher>,
        reply: impl Into<Reply>,
    ) -> ResponderHandle {
        self.add_responder(matcher.into(), ResponderAction::Static(reply.into()), false)
    }

    /// Autorespond through a handler. Returning `None` declines the request
    /// and the chain walk continues.
    pub fn autoresponds_fn(
        &self,
        matcher: impl Into<Matcher>,
        handler: impl Fn(&Request) -> Option<Reply> + Send + Sync + 'static,
    ) -> ResponderHandle {
        self.add_responder(
            matcher.into(),
            ResponderAction::Handler(Box::new(handler)),
            false,
        )
    }

    /// Register a responder of last resort: consulted only after every other
    /// responder has missed.
    pub fn append_responder(
        &self,
        matcher: impl Into<Matcher>,
        reply: impl Into<Reply>,
    ) -> ResponderHandle {
        self.add_responder(matcher.into(), ResponderAction::Static(reply.into()), true)
    }

    pub fn append_responder_fn(
        &self,
        matcher: impl Into<Matcher>,
        handler: impl Fn(&Request) -> Option<Reply> + Send + Sync + 'static,
    ) -> ResponderHandle {
        self.add_responder(
            matcher.into(),
            ResponderAction::Handler(Box::new(handler)),
            true,
        )
    }

    fn add_responder(
        &self,
        matcher: Matcher,
        action: ResponderAction,
        last_resort: bool,
    ) -> ResponderHandle {
        let id = self.shared.responder_seq.fetch_add(1, Ordering::Relaxed);
        let absorbed = self.shared.inbox.pop_head_map(|request| {
            if matcher.matches(request) {
                match &action {
                    ResponderAction::Static(reply) => Some(reply.clone()),
                    ResponderAction::Handler(handler) => handler(request),
                }
            } else {
                None
            }
        });
        {
            let mut inner = self.shared.inner.lock().expect("server lock");
            let responder = Responder {
                id,
                matcher,
                action,
            };
            if last_resort {
                // The walk runs newest-first, so the low-precedence end is
                // the front of the list.
                inner.responders.insert(0, responder);
            } else {
                inner.responders.push(responder);
            }
        }
        if let Some((request, reply)) = absorbed {
            tokio::spawn(async move {
                if let Err(e) = request.reply(reply).await {
                    tracing::warn!(error = %e, "autoresponse to queued request failed");
                }
            });
        }
        ResponderHandle(id)
    }

    /// Remove a previously registered autoresponder.
    pub fn remove_responder(&self, handle: ResponderHandle) {
        let mut inner = self.shared.inner.lock().expect("server lock");
        inner.responders.retain(|r| r.id != handle.0);
    }

    /// The bound `host:port` (or Unix socket path). Run the server first.
    pub fn address_string(&self) -> String {
        self.bound().address_string()
    }

    pub fn host(&self) -> String {
        match self.bound() {
            BoundAddr::Tcp(addr) => addr.ip().to_string(),
            #[cfg(unix)]
            BoundAddr::Unix(path) => path.clone(),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self.bound() {
            BoundAddr::Tcp(addr) => Some(addr.port()),
            #[cfg(unix)]
            BoundAddr::Unix(_) => None,
        }
    }

    /// Connection string for a MongoDB client.
    pub fn uri(&self) -> String {
        let host = match self.bound() {
            BoundAddr::Tcp(addr) => addr.to_string(),
            #[cfg(unix)]
            BoundAddr::Unix(path) => path.replace('/', "%2F"),
        };
        match &self.shared.options.replica_set {
            Some(name) => format!("mongodb://{host}/?replicaSet={name}"),
            None => format!("mongodb://{host}"),
        }
    }

    fn bound(&self) -> &BoundAddr {
        self.shared
            .addr
            .get()
            .expect("server not started; call run() first")
    }

    /// Number of requests decoded so far, autoresponded ones included.
    pub fn requests_count(&self) -> u64 {
        self.shared.requests_count.load(Ordering::Relaxed)
    }

    /// Number of requests currently waiting in the inbox.
    pub fn pending_requests(&self) -> usize {
        self.shared.inbox.len()
    }

    pub fn is_running(&self) -> bool {
        *self.shared.state.lock().expect("server lock") == ServerState::Running
    }
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: Listener) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        break;
                    }
                };
                tracing::debug!(%peer, "accepted connection");
                let id = shared.conn_seq.fetch_add(1, Ordering::Relaxed);
                let worker_shared = shared.clone();
                let handle = tokio::spawn(async move {
                    serve_connection(worker_shared, id, stream, peer).await;
                });
                shared.inner.lock().expect("server lock").workers.push(handle);
            }
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn serve_connection(shared: Arc<ServerShared>, id: u64, stream: RawStream, peer: String) {
    let io: Box<dyn StreamIo> = match &shared.options.tls {
        Some(config) => {
            let acceptor = TlsAcceptor::from(config.clone());
            match acceptor.accept(stream.into_boxed()).await {
                Ok(tls) => Box::new(tls),
                Err(e) => {
                    tracing::warn!(connection = id, error = %e, "tls handshake failed");
                    return;
                }
            }
        }
        None => stream.into_boxed(),
    };
    let (reader, writer) = tokio::io::split(io);
    let conn = Arc::new(Connection::new(id, peer, Box::new(writer)));
    shared.register_connection(conn.clone());
    connection_worker(shared.clone(), conn.clone(), reader).await;
    shared.unregister_connection(id);
    conn.close().await;
}

/// Per-connection loop: read a message, run the autoresponder chain, else
/// enqueue on the inbox and keep reading. The worker never waits for the
/// test task's reply; several requests from one client may sit in the inbox
/// at once, each carrying its own id for `response_to`.
async fn connection_worker(
    shared: Arc<ServerShared>,
    conn: Arc<Connection>,
    mut reader: impl AsyncRead + Send + Unpin,
) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        let frame = tokio::select! {
            res = read_message(&mut reader) => res,
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };
        let (header, body_bytes) = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(connection = conn.id(), error = %e, "closing connection on bad frame");
                break;
            }
        };
        let body = match RequestBody::decode(header.op_code, &body_bytes) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(connection = conn.id(), error = %e, "closing connection on decode failure");
                break;
            }
        };
        let request = Request::new(header.request_id, body, conn.clone(), shared.clone());
        shared.requests_count.fetch_add(1, Ordering::Relaxed);
        shared.log_request(&request);

        match shared.autorespond(&request).await {
            Ok(true) => {}
            Ok(false) => shared.inbox.push(request),
            Err(e) => {
                tracing::warn!(connection = conn.id(), error = %e, "autoresponse failed");
                break;
            }
        }
        if conn.is_closed() {
            break;
        }
    }
    conn.close().await;
}

fn default_handshake_doc(options: &ServerOptions) -> bson::Document {
    doc! {
        "ismaster": true,
        "minWireVersion": options.min_wire_version,
        "maxWireVersion": options.max_wire_version,
    }
}

/// Answers `ismaster`/`isMaster`/`hello` commands with `reply_doc`,
/// declining everything else.
fn handshake_responder(
    reply_doc: bson::Document,
) -> impl Fn(&Request) -> Option<Reply> + Send + Sync + 'static {
    move |request| {
        if !request.is_command() {
            return None;
        }
        let docs = request.docs();
        let first_key = docs.first().and_then(|d| d.keys().next())?;
        match first_key.as_str() {
            "ismaster" | "isMaster" | "hello" => Some(Reply::new(reply_doc.clone())),
            _ => None,
        }
    }
}

/// A server the mongo shell can connect to, preloaded with catch-all
/// autoresponders. Run it with the `mockmongo` binary and clean up with
/// [`MockServer::stop`].
pub fn interactive_server(mut options: ServerOptions) -> MockServer {
    options.request_timeout = Duration::from_secs(1_000_000);
    let handshake = match std::mem::replace(&mut options.auto_ismaster, AutoIsMaster::Off) {
        AutoIsMaster::Reply(doc) => doc,
        AutoIsMaster::Off | AutoIsMaster::Enabled => default_handshake_doc(&options),
    };
    let server = MockServer::with_options(options);
    server.append_responder(Matcher::any(), Reply::ok());
    server.autoresponds(
        Matcher::op_query(doc! {}),
        vec![doc! {"a": 1}, doc! {"a": 2}],
    );
    server.autoresponds_fn(Matcher::any(), handshake_responder(handshake));
    server.autoresponds("whatsmyuri", doc! {"you": "localhost:12345"});
    server.autoresponds(
        Matcher::command_doc(doc! {"getLog": "startupWarnings"}),
        doc! {"log": ["hello from mockmongo!"]},
    );
    server.autoresponds("replSetGetStatus", 0);
    server
}
