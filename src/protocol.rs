use std::fmt;
use std::io::{self, Cursor};

use bson::Document;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::MockodbError;

pub const OP_REPLY: i32 = 1;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;
pub const OP_COMPRESSED: i32 = 2012;
pub const OP_MSG: i32 = 2013;

/// OP_QUERY flag: the read may be served by a non-primary member.
pub const QUERY_FLAG_SLAVE_OK: u32 = 1 << 2;

pub const MSG_FLAG_CHECKSUM_PRESENT: u32 = 0x1;
/// OP_MSG flag: fire-and-forget, the sender does not expect a reply.
pub const MSG_FLAG_MORE_TO_COME: u32 = 0x2;
pub const MSG_FLAG_EXHAUST_ALLOWED: u32 = 0x10000;

pub const REPLY_FLAG_CURSOR_NOT_FOUND: u32 = 0x1;
pub const REPLY_FLAG_QUERY_FAILURE: u32 = 0x2;

/// Largest frame a real server accepts; anything bigger is a decode error.
pub const MAX_MESSAGE_SIZE: i32 = 48_000_000;

pub const HEADER_LEN: usize = 16;

/// The kind of frame a client sent, independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Query,
    Insert,
    Update,
    Delete,
    GetMore,
    KillCursors,
    Msg,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Query => "OP_QUERY",
            Opcode::Insert => "OP_INSERT",
            Opcode::Update => "OP_UPDATE",
            Opcode::Delete => "OP_DELETE",
            Opcode::GetMore => "OP_GET_MORE",
            Opcode::KillCursors => "OP_KILL_CURSORS",
            Opcode::Msg => "OP_MSG",
        };
        f.write_str(name)
    }
}

/// Standard 16-byte wire header shared by every frame.
#[derive(Debug, Clone, Copy)]
pub struct MsgHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MsgHeader {
    pub fn read_from_slice(buf: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            message_length: cursor.read_i32::<LittleEndian>()?,
            request_id: cursor.read_i32::<LittleEndian>()?,
            response_to: cursor.read_i32::<LittleEndian>()?,
            op_code: cursor.read_i32::<LittleEndian>()?,
        })
    }

    pub fn write_to_vec(&self, buf: &mut Vec<u8>) {
        // Writes to a Vec cannot fail.
        let _ = buf.write_i32::<LittleEndian>(self.message_length);
        let _ = buf.write_i32::<LittleEndian>(self.request_id);
        let _ = buf.write_i32::<LittleEndian>(self.response_to);
        let _ = buf.write_i32::<LittleEndian>(self.op_code);
    }
}

/// One decoded client frame, by opcode. Immutable after construction.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Query {
        flags: u32,
        namespace: String,
        num_to_skip: i32,
        num_to_return: i32,
        query: Document,
        fields: Option<Document>,
    },
    Insert {
        flags: u32,
        namespace: String,
        documents: Vec<Document>,
    },
    Update {
        flags: u32,
        namespace: String,
        selector: Document,
        update: Document,
    },
    Delete {
        flags: u32,
        namespace: String,
        selector: Document,
    },
    GetMore {
        namespace: String,
        num_to_return: i32,
        cursor_id: i64,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
    Msg {
        flag_bits: u32,
        command: Document,
    },
}

impl RequestBody {
    pub fn opcode(&self) -> Opcode {
        match self {
            RequestBody::Query { .. } => Opcode::Query,
            RequestBody::Insert { .. } => Opcode::Insert,
            RequestBody::Update { .. } => Opcode::Update,
            RequestBody::Delete { .. } => Opcode::Delete,
            RequestBody::GetMore { .. } => Opcode::GetMore,
            RequestBody::KillCursors { .. } => Opcode::KillCursors,
            RequestBody::Msg { .. } => Opcode::Msg,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            RequestBody::Query { namespace, .. }
            | RequestBody::Insert { namespace, .. }
            | RequestBody::Update { namespace, .. }
            | RequestBody::Delete { namespace, .. }
            | RequestBody::GetMore { namespace, .. } => Some(namespace),
            _ => None,
        }
    }

    pub fn flags(&self) -> u32 {
        match self {
            RequestBody::Query { flags, .. }
            | RequestBody::Insert { flags, .. }
            | RequestBody::Update { flags, .. }
            | RequestBody::Delete { flags, .. } => *flags,
            RequestBody::Msg { flag_bits, .. } => *flag_bits,
            _ => 0,
        }
    }

    /// The document a pattern is matched against: the command document for
    /// OP_MSG, the query for OP_QUERY, the selector for legacy updates and
    /// deletes, the first document for legacy inserts.
    pub fn principal_doc(&self) -> Option<&Document> {
        match self {
            RequestBody::Query { query, .. } => Some(query),
            RequestBody::Msg { command, .. } => Some(command),
            RequestBody::Update { selector, .. } | RequestBody::Delete { selector, .. } => {
                Some(selector)
            }
            RequestBody::Insert { documents, .. } => documents.first(),
            _ => None,
        }
    }
}

impl fmt::Display for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Query {
                flags,
                namespace,
                query,
                ..
            } => write!(f, "OpQuery({namespace}, {query}, flags={flags:#x})"),
            RequestBody::Insert {
                namespace,
                documents,
                ..
            } => write!(f, "OpInsert({namespace}, {} docs)", documents.len()),
            RequestBody::Update {
                namespace,
                selector,
                update,
                ..
            } => write!(f, "OpUpdate({namespace}, {selector}, {update})"),
            RequestBody::Delete {
                namespace,
                selector,
                ..
            } => write!(f, "OpDelete({namespace}, {selector})"),
            RequestBody::GetMore {
                namespace,
                cursor_id,
                ..
            } => write!(f, "OpGetMore({namespace}, cursor={cursor_id})"),
            RequestBody::KillCursors { cursor_ids } => {
                write!(f, "OpKillCursors({cursor_ids:?})")
            }
            RequestBody::Msg { flag_bits, command } => {
                write!(f, "OpMsg({command}, flags={flag_bits:#x})")
            }
        }
    }
}

/// One scripted reply: documents plus the OP_REPLY metadata that only
/// matters for legacy requests.
#[derive(Debug, Clone)]
pub struct Reply {
    docs: Vec<Document>,
    cursor_id: i64,
    starting_from: i32,
    flags: u32,
}

impl Reply {
    pub fn new(doc: Document) -> Self {
        Self::batch(vec![doc])
    }

    /// A streaming batch of documents, e.g. one OP_REPLY cursor page.
    pub fn batch(docs: Vec<Document>) -> Self {
        Self {
            docs,
            cursor_id: 0,
            starting_from: 0,
            flags: 0,
        }
    }

    pub fn cursor_id(mut self, id: i64) -> Self {
        self.cursor_id = id;
        self
    }

    pub fn starting_from(mut self, n: i32) -> Self {
        self.starting_from = n;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn docs(&self) -> &[Document] {
        &self.docs
    }
}

impl From<Document> for Reply {
    fn from(doc: Document) -> Self {
        Reply::new(doc)
    }
}

fn read_cstring(cursor: &mut Cursor<&[u8]>) -> Result<String, MockodbError> {
    let mut bytes = Vec::new();
    loop {
        let b = cursor.read_u8().map_err(truncated)?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|_| MockodbError::Decode("cstring is not utf-8".into()))
}

fn read_document(cursor: &mut Cursor<&[u8]>) -> Result<Document, MockodbError> {
    bson::from_reader(cursor).map_err(|e| MockodbError::Decode(format!("bad document: {e}")))
}

fn truncated(_: io::Error) -> MockodbError {
    MockodbError::Decode("truncated frame".into())
}

/// Decodes the body of one frame. Framing (header plus exactly
/// `messageLength - 16` body bytes) is the connection handler's job, which is
/// what makes decoding resumable across partial TCP reads.
pub fn decode_request(op_code: i32, body: &[u8]) -> Result<RequestBody, MockodbError> {
    let mut cursor = Cursor::new(body);
    match op_code {
        OP_QUERY => {
            let flags = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
            let namespace = read_cstring(&mut cursor)?;
            let num_to_skip = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
            let num_to_return = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
            let query = read_document(&mut cursor)?;
            let fields = if (cursor.position() as usize) < body.len() {
                Some(read_document(&mut cursor)?)
            } else {
                None
            };
            Ok(RequestBody::Query {
                flags,
                namespace,
                num_to_skip,
                num_to_return,
                query,
                fields,
            })
        }
        OP_INSERT => {
            let flags = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
            let namespace = read_cstring(&mut cursor)?;
            let mut documents = Vec::new();
            while (cursor.position() as usize) < body.len() {
                documents.push(read_document(&mut cursor)?);
            }
            Ok(RequestBody::Insert {
                flags,
                namespace,
                documents,
            })
        }
        OP_UPDATE => {
            let _zero = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
            let namespace = read_cstring(&mut cursor)?;
            let flags = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
            let selector = read_document(&mut cursor)?;
            let update = read_document(&mut cursor)?;
            Ok(RequestBody::Update {
                flags,
                namespace,
                selector,
                update,
            })
        }
        OP_DELETE => {
            let _zero = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
            let namespace = read_cstring(&mut cursor)?;
            let flags = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
            let selector = read_document(&mut cursor)?;
            Ok(RequestBody::Delete {
                flags,
                namespace,
                selector,
            })
        }
        OP_GET_MORE => {
            let _zero = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
            let namespace = read_cstring(&mut cursor)?;
            let num_to_return = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
            let cursor_id = cursor.read_i64::<LittleEndian>().map_err(truncated)?;
            Ok(RequestBody::GetMore {
                namespace,
                num_to_return,
                cursor_id,
            })
        }
        OP_KILL_CURSORS => {
            let _zero = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
            let count = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
            if count < 0 {
                return Err(MockodbError::Decode("negative cursor count".into()));
            }
            let mut cursor_ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                cursor_ids.push(cursor.read_i64::<LittleEndian>().map_err(truncated)?);
            }
            Ok(RequestBody::KillCursors { cursor_ids })
        }
        OP_MSG => decode_op_msg(body),
        OP_COMPRESSED => {
            let original = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
            let _uncompressed_size = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
            let compressor = cursor.read_u8().map_err(truncated)?;
            if compressor != 0 {
                return Err(MockodbError::Decode(format!(
                    "unsupported compressor id {compressor}"
                )));
            }
            // Real servers never nest compression; a frame that does is
            // hostile and would otherwise recurse per layer.
            if original == OP_COMPRESSED {
                return Err(MockodbError::Decode("nested compressed frame".into()));
            }
            // Compressor 0 is noop: the original body follows verbatim.
            decode_request(original, &body[cursor.position() as usize..])
        }
        other => Err(MockodbError::Decode(format!("unknown opcode {other}"))),
    }
}

fn decode_op_msg(body: &[u8]) -> Result<RequestBody, MockodbError> {
    let mut cursor = Cursor::new(body);
    let flag_bits = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

    // The CRC-32C trailer is tolerated but not verified.
    let end = if flag_bits & MSG_FLAG_CHECKSUM_PRESENT != 0 {
        if body.len() < 8 {
            return Err(MockodbError::Decode("checksum flag on a short frame".into()));
        }
        body.len() - 4
    } else {
        body.len()
    };

    let mut command: Option<Document> = None;
    let mut sequences: Vec<(String, Vec<Document>)> = Vec::new();

    while (cursor.position() as usize) < end {
        let kind = cursor.read_u8().map_err(truncated)?;
        match kind {
            0 => {
                if command.is_some() {
                    return Err(MockodbError::Decode("multiple body sections".into()));
                }
                command = Some(read_document(&mut cursor)?);
            }
            1 => {
                let size = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
                if size < 4 {
                    return Err(MockodbError::Decode("bad section size".into()));
                }
                let section_start = cursor.position();
                let identifier = read_cstring(&mut cursor)?;
                let mut docs = Vec::new();
                while cursor.position() - section_start < size as u64 - 4 {
                    docs.push(read_document(&mut cursor)?);
                }
                sequences.push((identifier, docs));
            }
            other => {
                return Err(MockodbError::Decode(format!("unknown section kind {other}")));
            }
        }
    }

    let mut command =
        command.ok_or_else(|| MockodbError::Decode("message has no body section".into()))?;

    // Fold document sequences back into the command, the way the server sees
    // them, so patterns can match e.g. the "documents" of an insert.
    for (identifier, docs) in sequences {
        if !command.contains_key(&identifier) {
            let array = docs.into_iter().map(bson::Bson::Document).collect();
            command.insert(identifier, bson::Bson::Array(array));
        }
    }

    Ok(RequestBody::Msg { flag_bits, command })
}

/// Encodes a legacy OP_REPLY correlated to the original request id.
pub fn encode_op_reply(
    reply: &Reply,
    request_id: i32,
    response_to: i32,
) -> Result<Vec<u8>, MockodbError> {
    let mut doc_bytes = Vec::new();
    for doc in &reply.docs {
        doc_bytes.extend_from_slice(&bson::to_vec(doc)?);
    }
    let message_length = (HEADER_LEN + 4 + 8 + 4 + 4 + doc_bytes.len()) as i32;

    let mut buf = Vec::with_capacity(message_length as usize);
    MsgHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_REPLY,
    }
    .write_to_vec(&mut buf);
    let _ = buf.write_u32::<LittleEndian>(reply.flags);
    let _ = buf.write_i64::<LittleEndian>(reply.cursor_id);
    let _ = buf.write_i32::<LittleEndian>(reply.starting_from);
    let _ = buf.write_i32::<LittleEndian>(reply.docs.len() as i32);
    buf.extend_from_slice(&doc_bytes);
    Ok(buf)
}

/// Encodes an OP_MSG response with a single kind-0 body section.
pub fn encode_op_msg(
    doc: &Document,
    request_id: i32,
    response_to: i32,
) -> Result<Vec<u8>, MockodbError> {
    let doc_bytes = bson::to_vec(doc)?;
    let message_length = (HEADER_LEN + 4 + 1 + doc_bytes.len()) as i32;

    let mut buf = Vec::with_capacity(message_length as usize);
    MsgHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_MSG,
    }
    .write_to_vec(&mut buf);
    let _ = buf.write_u32::<LittleEndian>(0);
    let _ = buf.write_u8(0);
    buf.extend_from_slice(&doc_bytes);
    Ok(buf)
}
