use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bson::{doc, Document};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

use crate::protocol::{
    encode_op_msg, encode_op_reply, Opcode, Reply, RequestBody, MSG_FLAG_MORE_TO_COME,
    REPLY_FLAG_QUERY_FAILURE,
};
use crate::MockodbError;

/// What the test hands back to a connection's writer task.
#[derive(Debug)]
pub(crate) enum WriteCmd {
    Frame(Vec<u8>),
    Hangup,
}

/// Channel back to the connection that produced a request, shared by every
/// request from that connection.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub(crate) conn_id: u64,
    pub(crate) writer: UnboundedSender<WriteCmd>,
    pub(crate) open: Arc<AtomicBool>,
    pub(crate) hangup: Arc<Notify>,
    pub(crate) reply_id: Arc<AtomicI32>,
}

/// An immutable view of one decoded client frame, plus the single-shot reply
/// slot pairing it with the connection that produced it.
pub struct Request {
    seq: u64,
    request_id: i32,
    peer: SocketAddr,
    body: RequestBody,
    handle: ConnectionHandle,
    replied: AtomicBool,
}

impl Request {
    pub(crate) fn new(
        seq: u64,
        request_id: i32,
        peer: SocketAddr,
        body: RequestBody,
        handle: ConnectionHandle,
    ) -> Self {
        Self {
            seq,
            request_id,
            peer,
            body,
            handle,
            replied: AtomicBool::new(false),
        }
    }

    /// Global arrival sequence number, monotonic across all connections of
    /// one server.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    pub fn connection_id(&self) -> u64 {
        self.handle.conn_id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Distinguishes sockets from the same client, e.g. a driver's monitor
    /// connection from its application connection.
    pub fn client_port(&self) -> u16 {
        self.peer.port()
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn opcode(&self) -> Opcode {
        self.body.opcode()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.body.namespace()
    }

    pub fn flags(&self) -> u32 {
        self.body.flags()
    }

    pub fn principal_doc(&self) -> Option<&Document> {
        self.body.principal_doc()
    }

    /// The command name, resolved the way the server does: the first key of
    /// the command document. Legacy OP_QUERY only carries a command when
    /// aimed at a `$cmd` namespace.
    pub fn command_name(&self) -> Option<&str> {
        match &self.body {
            RequestBody::Msg { command, .. } => command.keys().next().map(String::as_str),
            RequestBody::Query {
                namespace, query, ..
            } if namespace.ends_with(".$cmd") => query.keys().next().map(String::as_str),
            _ => None,
        }
    }

    pub fn cursor_id(&self) -> Option<i64> {
        match &self.body {
            RequestBody::GetMore { cursor_id, .. } => Some(*cursor_id),
            _ => None,
        }
    }

    /// True when the client does not expect a reply: OP_MSG with
    /// `moreToCome`, and every legacy write opcode.
    pub fn is_fire_and_forget(&self) -> bool {
        match &self.body {
            RequestBody::Msg { flag_bits, .. } => flag_bits & MSG_FLAG_MORE_TO_COME != 0,
            RequestBody::Insert { .. }
            | RequestBody::Update { .. }
            | RequestBody::Delete { .. }
            | RequestBody::KillCursors { .. } => true,
            _ => false,
        }
    }

    /// Sends `doc` back as this request's reply. Fails `DoubleReply` on a
    /// second call, `ConnectionClosed` if the peer is already gone, and
    /// `Protocol` if the request was fire-and-forget.
    pub fn reply(&self, doc: Document) -> Result<(), MockodbError> {
        self.reply_with(Reply::new(doc))
    }

    /// Full-control variant of [`reply`](Self::reply) for cursor ids, reply
    /// flags and multi-document OP_REPLY batches.
    pub fn reply_with(&self, reply: Reply) -> Result<(), MockodbError> {
        if self.is_fire_and_forget() {
            return Err(MockodbError::Protocol(format!(
                "request {self} is fire-and-forget, no reply expected"
            )));
        }
        if matches!(self.body, RequestBody::Msg { .. }) && reply.docs().len() > 1 {
            return Err(MockodbError::Protocol(
                "OP_MSG replies carry exactly one document; batches are OP_REPLY only".into(),
            ));
        }
        // A double reply is the loud programming error; report it even when
        // the connection has since closed.
        if self.replied.load(Ordering::SeqCst) {
            return Err(MockodbError::DoubleReply(self.request_id));
        }
        if !self.handle.open.load(Ordering::SeqCst) {
            return Err(MockodbError::ConnectionClosed(self.handle.conn_id));
        }
        if self.replied.swap(true, Ordering::SeqCst) {
            return Err(MockodbError::DoubleReply(self.request_id));
        }

        let reply_id = self.handle.reply_id.fetch_add(1, Ordering::SeqCst);
        let bytes = match &self.body {
            RequestBody::Msg { .. } => {
                let doc = reply.docs().first().ok_or_else(|| {
                    MockodbError::Protocol("OP_MSG reply needs a body document".into())
                })?;
                encode_op_msg(doc, reply_id, self.request_id)?
            }
            _ => encode_op_reply(&reply, reply_id, self.request_id)?,
        };

        self.handle
            .writer
            .send(WriteCmd::Frame(bytes))
            .map_err(|_| MockodbError::ConnectionClosed(self.handle.conn_id))
    }

    /// Replies `{ok: 1}`.
    pub fn ok(&self) -> Result<(), MockodbError> {
        self.reply(doc! { "ok": 1 })
    }

    /// Replies `doc` with `ok: 1` merged in unless the test set it itself.
    pub fn ok_with(&self, mut doc: Document) -> Result<(), MockodbError> {
        if !doc.contains_key("ok") {
            doc.insert("ok", 1);
        }
        self.reply(doc)
    }

    /// Scripts a server error: `{ok: 0, errmsg}` for commands, a
    /// QueryFailure OP_REPLY for plain legacy queries.
    pub fn error(&self, errmsg: &str) -> Result<(), MockodbError> {
        match &self.body {
            RequestBody::Query { namespace, .. } if !namespace.ends_with(".$cmd") => self
                .reply_with(
                    Reply::new(doc! { "$err": errmsg, "ok": 0 }).flags(REPLY_FLAG_QUERY_FAILURE),
                ),
            _ => self.reply(doc! { "ok": 0, "errmsg": errmsg }),
        }
    }

    /// Server-initiated hangup: closes this request's connection without
    /// replying. Unanswered requests on it become `ConnectionClosed`.
    pub fn hangup(&self) {
        self.handle.open.store(false, Ordering::SeqCst);
        let _ = self.handle.writer.send(WriteCmd::Hangup);
        self.handle.hangup.notify_waiters();
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from {} (conn {}, seq {})",
            self.body,
            self.peer,
            self.handle.conn_id,
            self.seq
        )
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request({self})")
    }
}
