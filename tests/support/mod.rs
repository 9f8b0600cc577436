//! A bare-bones wire-protocol client for driving the mock server from tests
//! without a real driver in the way, plus shared test plumbing.

// Each test binary uses its own subset of this module.
#![allow(dead_code)]

use std::io::Cursor;
use std::net::SocketAddr;

use bson::Document;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Routes harness logs into the per-test captured output. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_MSG: i32 = 2013;

pub struct WireClient {
    stream: TcpStream,
    next_id: i32,
}

/// A parsed server-to-client frame, OP_REPLY or OP_MSG.
pub struct ReplyFrame {
    pub op_code: i32,
    pub response_to: i32,
    pub flags: u32,
    pub cursor_id: i64,
    pub docs: Vec<Document>,
}

impl WireClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self { stream, next_id: 1 }
    }

    async fn send(&mut self, op_code: i32, body: &[u8]) -> i32 {
        let request_id = self.next_id;
        self.next_id += 1;

        let mut frame = Vec::with_capacity(16 + body.len());
        WriteBytesExt::write_i32::<LittleEndian>(&mut frame, (16 + body.len()) as i32).unwrap();
        WriteBytesExt::write_i32::<LittleEndian>(&mut frame, request_id).unwrap();
        WriteBytesExt::write_i32::<LittleEndian>(&mut frame, 0).unwrap();
        WriteBytesExt::write_i32::<LittleEndian>(&mut frame, op_code).unwrap();
        frame.extend_from_slice(body);
        self.stream.write_all(&frame).await.expect("write frame");
        request_id
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write raw");
    }

    pub async fn send_msg(&mut self, doc: &Document, flags: u32) -> i32 {
        let mut body = Vec::new();
        WriteBytesExt::write_u32::<LittleEndian>(&mut body, flags).unwrap();
        WriteBytesExt::write_u8(&mut body, 0).unwrap();
        body.extend_from_slice(&bson::to_vec(doc).unwrap());
        self.send(OP_MSG, &body).await
    }

    pub async fn send_query(&mut self, namespace: &str, query: &Document, flags: u32) -> i32 {
        let mut body = Vec::new();
        WriteBytesExt::write_u32::<LittleEndian>(&mut body, flags).unwrap();
        body.extend_from_slice(namespace.as_bytes());
        WriteBytesExt::write_u8(&mut body, 0).unwrap();
        WriteBytesExt::write_i32::<LittleEndian>(&mut body, 0).unwrap();
        WriteBytesExt::write_i32::<LittleEndian>(&mut body, -1).unwrap();
        body.extend_from_slice(&bson::to_vec(query).unwrap());
        self.send(OP_QUERY, &body).await
    }

    pub async fn send_get_more(&mut self, namespace: &str, cursor_id: i64) -> i32 {
        let mut body = Vec::new();
        WriteBytesExt::write_i32::<LittleEndian>(&mut body, 0).unwrap();
        body.extend_from_slice(namespace.as_bytes());
        WriteBytesExt::write_u8(&mut body, 0).unwrap();
        WriteBytesExt::write_i32::<LittleEndian>(&mut body, 10).unwrap();
        WriteBytesExt::write_i64::<LittleEndian>(&mut body, cursor_id).unwrap();
        self.send(OP_GET_MORE, &body).await
    }

    pub async fn read_reply(&mut self) -> ReplyFrame {
        let mut header = [0u8; 16];
        self.stream.read_exact(&mut header).await.expect("header");
        let mut cursor = Cursor::new(&header[..]);
        let message_length = ReadBytesExt::read_i32::<LittleEndian>(&mut cursor).unwrap();
        let _request_id = ReadBytesExt::read_i32::<LittleEndian>(&mut cursor).unwrap();
        let response_to = ReadBytesExt::read_i32::<LittleEndian>(&mut cursor).unwrap();
        let op_code = ReadBytesExt::read_i32::<LittleEndian>(&mut cursor).unwrap();

        let mut body = vec![0u8; message_length as usize - 16];
        self.stream.read_exact(&mut body).await.expect("body");
        let mut cursor = Cursor::new(&body[..]);

        match op_code {
            OP_REPLY => {
                let flags = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor).unwrap();
                let cursor_id = ReadBytesExt::read_i64::<LittleEndian>(&mut cursor).unwrap();
                let _starting_from = ReadBytesExt::read_i32::<LittleEndian>(&mut cursor).unwrap();
                let count = ReadBytesExt::read_i32::<LittleEndian>(&mut cursor).unwrap();
                let mut docs = Vec::new();
                for _ in 0..count {
                    docs.push(bson::from_reader(&mut cursor).unwrap());
                }
                ReplyFrame {
                    op_code,
                    response_to,
                    flags,
                    cursor_id,
                    docs,
                }
            }
            OP_MSG => {
                let flags = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor).unwrap();
                let kind = ReadBytesExt::read_u8(&mut cursor).unwrap();
                assert_eq!(kind, 0, "reply should be a single body section");
                let doc: Document = bson::from_reader(&mut cursor).unwrap();
                ReplyFrame {
                    op_code,
                    response_to,
                    flags,
                    cursor_id: 0,
                    docs: vec![doc],
                }
            }
            other => panic!("unexpected reply opcode {other}"),
        }
    }

    /// True once the server has closed its side of the connection.
    pub async fn at_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte).await, Ok(0))
    }
}
