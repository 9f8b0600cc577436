use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Document};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::matcher::MatchPattern;
use crate::protocol::{decode_request, MsgHeader, Reply, HEADER_LEN, MAX_MESSAGE_SIZE};
use crate::request::{ConnectionHandle, Request, WriteCmd};
use crate::MockodbError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the handshake reply a standalone primary would send, with
/// `overrides` merged on top (e.g. `setName`/`hosts` for replica-set
/// scripting, or a lower `maxWireVersion`).
pub fn ismaster_reply(overrides: Document) -> Document {
    let mut reply = doc! {
        "ok": 1,
        "ismaster": true,
        "isWritablePrimary": true,
        "helloOk": true,
        "maxBsonObjectSize": 16777216,
        "maxMessageSizeBytes": MAX_MESSAGE_SIZE,
        "maxWriteBatchSize": 100000,
        "minWireVersion": 0,
        "maxWireVersion": 13,
        "readOnly": false,
    };
    for (key, value) in overrides {
        reply.insert(key, value);
    }
    reply
}

/// What a standing responder does with a matching request.
enum ResponderAction {
    Reply(Reply),
    /// Computed reply; returning `None` declines the request and lets later
    /// responders (or the receive queue) have it.
    Func(Box<dyn Fn(&Request) -> Option<Reply> + Send + Sync>),
}

struct Responder {
    pattern: MatchPattern,
    action: ResponderAction,
}

/// Ticket for cancelling a responder installed with `autoresponds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponderId(u64);

/// Options for a [`MockServer`], builder-style.
pub struct MockServerOptions {
    bind_addr: String,
    request_timeout: Duration,
    auto_ismaster: Option<Document>,
}

impl Default for MockServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            auto_ismaster: None,
        }
    }
}

impl MockServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_addr(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Bound on every blocking `receive`, 10 seconds unless overridden.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Answer isMaster/hello handshakes automatically so drivers can
    /// complete connection setup without cluttering the test body.
    pub fn auto_ismaster(self) -> Self {
        self.auto_ismaster_with(Document::new())
    }

    /// Like [`auto_ismaster`](Self::auto_ismaster) with fields merged over
    /// the default handshake reply.
    pub fn auto_ismaster_with(mut self, overrides: Document) -> Self {
        self.auto_ismaster = Some(overrides);
        self
    }
}

struct Inner {
    pending: VecDeque<Request>,
    connections: HashMap<u64, ConnectionHandle>,
    responders: Vec<(u64, Arc<Responder>)>,
    next_responder_id: u64,
    closed: u64,
    last_closed: u64,
}

struct ServerState {
    inner: Mutex<Inner>,
    /// Wakes `receive` waiters on every enqueue and every disconnect.
    notify: Notify,
    seq: AtomicU64,
    reply_id: Arc<AtomicI32>,
    accepted: AtomicUsize,
}

/// A fake server speaking the MongoDB wire protocol. It accepts real socket
/// connections, hands every decoded request to the test body through
/// [`receive`](Self::receive), and sends back whatever the test scripts.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    request_timeout: Duration,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    /// Binds an ephemeral localhost port and starts serving.
    pub async fn run() -> Result<Self, MockodbError> {
        Self::run_with(MockServerOptions::new()).await
    }

    pub async fn run_with(options: MockServerOptions) -> Result<Self, MockodbError> {
        let listener = TcpListener::bind(&options.bind_addr).await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(ServerState {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                connections: HashMap::new(),
                responders: Vec::new(),
                next_responder_id: 0,
                closed: 0,
                last_closed: 0,
            }),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            reply_id: Arc::new(AtomicI32::new(1)),
            accepted: AtomicUsize::new(0),
        });

        if let Some(overrides) = options.auto_ismaster {
            add_responder(
                &state,
                Responder {
                    pattern: MatchPattern::handshake(),
                    action: ResponderAction::Reply(Reply::new(ismaster_reply(overrides))),
                },
            );
        }

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(accept_loop(listener, accept_state));
        debug!(%addr, "mock server listening");

        Ok(Self {
            addr,
            state,
            request_timeout: options.request_timeout,
            accept_task,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Connection string for handing to the driver under test.
    pub fn uri(&self) -> String {
        format!("mongodb://{}", self.addr)
    }

    /// Connection string pinning the driver to this member alone, so a
    /// single server can answer a replica-set-flavored handshake without
    /// the driver going off to discover the other members.
    pub fn uri_direct(&self) -> String {
        format!("mongodb://{}/?directConnection=true", self.addr)
    }

    /// True while the listener is still accepting connections; false once
    /// [`stop`](Self::stop) has taken effect.
    pub fn alive(&self) -> bool {
        !self.accept_task.is_finished()
    }

    /// Total connections accepted since the server started.
    pub fn accept_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.inner.lock().connections.len()
    }

    /// Removes and returns the next request, FIFO by arrival.
    pub async fn receive(&self) -> Result<Request, MockodbError> {
        self.receive_timeout(MatchPattern::any(), self.request_timeout)
            .await
    }

    /// Removes and returns the oldest queued request matching `pattern`.
    /// Non-matching requests stay queued for later calls, so a test may pick
    /// a later request from one connection ahead of an earlier unmatched one
    /// on another.
    pub async fn receive_matching(&self, pattern: MatchPattern) -> Result<Request, MockodbError> {
        self.receive_timeout(pattern, self.request_timeout).await
    }

    pub async fn receive_timeout(
        &self,
        pattern: MatchPattern,
        timeout: Duration,
    ) -> Result<Request, MockodbError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for a wakeup before re-checking state, otherwise a
            // request arriving between the check and the await is lost.
            let mut notified = pin!(self.state.notify.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.state.inner.lock();
                if let Some(pos) = inner.pending.iter().position(|r| pattern.matches(r)) {
                    if let Some(request) = inner.pending.remove(pos) {
                        return Ok(request);
                    }
                }
                if inner.connections.is_empty() && inner.closed > 0 {
                    return Err(MockodbError::ConnectionClosed(inner.last_closed));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(MockodbError::Timeout {
                    pattern: pattern.to_string(),
                    queued: self.queued_snapshot(),
                    waited: timeout,
                });
            }
        }
    }

    fn queued_snapshot(&self) -> String {
        let inner = self.state.inner.lock();
        if inner.pending.is_empty() {
            "nothing".to_string()
        } else {
            inner
                .pending
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        }
    }

    /// Installs a standing rule answering every matching request with
    /// `reply` before it can reach [`receive`](Self::receive). Responders
    /// are consulted in registration order; the first match fires.
    pub fn autoresponds(
        &self,
        pattern: MatchPattern,
        reply: impl Into<Reply>,
    ) -> ResponderId {
        add_responder(
            &self.state,
            Responder {
                pattern,
                action: ResponderAction::Reply(reply.into()),
            },
        )
    }

    /// Responder whose reply is computed per request; returning `None`
    /// passes the request on.
    pub fn autoresponds_with(
        &self,
        pattern: MatchPattern,
        action: impl Fn(&Request) -> Option<Reply> + Send + Sync + 'static,
    ) -> ResponderId {
        add_responder(
            &self.state,
            Responder {
                pattern,
                action: ResponderAction::Func(Box::new(action)),
            },
        )
    }

    pub fn cancel_responder(&self, id: ResponderId) {
        self.state
            .inner
            .lock()
            .responders
            .retain(|(responder_id, _)| *responder_id != id.0);
    }

    /// Stops accepting and hangs up every live connection.
    pub fn stop(&self) {
        self.accept_task.abort();
        let handles: Vec<ConnectionHandle> = {
            let inner = self.state.inner.lock();
            inner.connections.values().cloned().collect()
        };
        for handle in handles {
            handle.open.store(false, Ordering::SeqCst);
            let _ = handle.writer.send(WriteCmd::Hangup);
            handle.hangup.notify_waiters();
        }
        self.state.notify.notify_waiters();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn add_responder(state: &ServerState, responder: Responder) -> ResponderId {
    let mut inner = state.inner.lock();
    inner.next_responder_id += 1;
    let id = inner.next_responder_id;
    inner.responders.push((id, Arc::new(responder)));
    ResponderId(id)
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    let mut next_conn_id = 0u64;
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                next_conn_id += 1;
                let _ = socket.set_nodelay(true);
                state.accepted.fetch_add(1, Ordering::SeqCst);
                let conn_state = Arc::clone(&state);
                tokio::spawn(handle_connection(conn_state, next_conn_id, socket, peer));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Pumps one connection: reads frames, decodes them, runs them past the
/// responders, and queues the rest for the test body. A paired writer task
/// serializes outgoing frames so replies never interleave.
async fn handle_connection(
    state: Arc<ServerState>,
    conn_id: u64,
    socket: TcpStream,
    peer: SocketAddr,
) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle {
        conn_id,
        writer: tx,
        open: Arc::new(AtomicBool::new(true)),
        hangup: Arc::new(Notify::new()),
        reply_id: Arc::clone(&state.reply_id),
    };
    state
        .inner
        .lock()
        .connections
        .insert(conn_id, handle.clone());
    debug!(conn_id, %peer, "connection accepted");

    let writer_task = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriteCmd::Frame(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                WriteCmd::Hangup => {
                    let _ = writer.shutdown().await;
                    break;
                }
            }
        }
    });

    let hangup = Arc::clone(&handle.hangup);
    loop {
        if !handle.open.load(Ordering::SeqCst) {
            break;
        }
        let frame = tokio::select! {
            biased;
            _ = hangup.notified() => break,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some((header, body))) => match decode_request(header.op_code, &body) {
                Ok(body) => {
                    let seq = state.seq.fetch_add(1, Ordering::SeqCst);
                    let request = Request::new(seq, header.request_id, peer, body, handle.clone());
                    dispatch(&state, request);
                }
                Err(err) => {
                    warn!(conn_id, error = %err, "dropping connection on decode error");
                    break;
                }
            },
            Ok(None) => break,
            Err(err) => {
                debug!(conn_id, error = %err, "read error");
                break;
            }
        }
    }

    handle.open.store(false, Ordering::SeqCst);
    let _ = handle.writer.send(WriteCmd::Hangup);
    {
        let mut inner = state.inner.lock();
        inner.connections.remove(&conn_id);
        inner.closed += 1;
        inner.last_closed = conn_id;
    }
    // A disconnect must unblock waiters, not leave them hanging.
    state.notify.notify_waiters();
    debug!(conn_id, "connection closed");
    let _ = writer_task.await;
}

/// Reads one whole frame; `None` on a clean EOF at a frame boundary.
async fn read_frame(
    reader: &mut OwnedReadHalf,
) -> Result<Option<(MsgHeader, Vec<u8>)>, MockodbError> {
    let mut header_buf = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let header = MsgHeader::read_from_slice(&header_buf)?;
    if header.message_length < HEADER_LEN as i32 || header.message_length > MAX_MESSAGE_SIZE {
        return Err(MockodbError::Decode(format!(
            "bad message length {}",
            header.message_length
        )));
    }
    let mut body = vec![0u8; header.message_length as usize - HEADER_LEN];
    reader.read_exact(&mut body).await?;
    Ok(Some((header, body)))
}

/// Offers `request` to the standing responders first; only unclaimed
/// requests reach the queue behind `receive`.
fn dispatch(state: &Arc<ServerState>, request: Request) {
    let responders: Vec<Arc<Responder>> = {
        let inner = state.inner.lock();
        inner
            .responders
            .iter()
            .map(|(_, responder)| Arc::clone(responder))
            .collect()
    };
    for responder in responders {
        if !responder.pattern.matches(&request) {
            continue;
        }
        let reply = match &responder.action {
            ResponderAction::Reply(reply) => Some(reply.clone()),
            ResponderAction::Func(func) => func(&request),
        };
        if let Some(reply) = reply {
            if request.is_fire_and_forget() {
                debug!(seq = request.seq(), "responder consumed fire-and-forget request");
            } else if let Err(err) = request.reply_with(reply) {
                warn!(error = %err, "auto-reply failed");
            }
            return;
        }
    }
    state.inner.lock().pending.push_back(request);
    state.notify.notify_waiters();
}
