//! A scriptable mock MongoDB server for testing drivers against the real
//! wire protocol.
//!
//! The server accepts genuine socket connections from an unmodified driver,
//! decodes every frame it sends (legacy opcodes and OP_MSG alike), and hands
//! each request to the test body, which asserts its shape and scripts the
//! exact reply, including when, or whether, to reply at all:
//!
//! ```no_run
//! use mockodb::{go, MatchPattern, MockServer, MockServerOptions};
//!
//! # async fn example() -> Result<(), mockodb::MockodbError> {
//! let server = MockServer::run_with(MockServerOptions::new().auto_ismaster()).await?;
//!
//! // Kick the driver operation off in the background...
//! let op = go(run_driver_operation(server.uri()));
//!
//! // ...script the server's side of the conversation...
//! let request = server.receive_matching(MatchPattern::command("ping")).await?;
//! request.ok()?;
//!
//! // ...then collect the driver's outcome.
//! op.wait().await;
//! # Ok(())
//! # }
//! # async fn run_driver_operation(_uri: String) {}
//! ```

mod errors;
mod going;
mod matcher;
mod protocol;
mod request;
mod server;

pub use crate::errors::MockodbError;
pub use crate::going::{go, Background};
pub use crate::matcher::MatchPattern;
pub use crate::protocol::{
    Opcode, Reply, RequestBody, MAX_MESSAGE_SIZE, MSG_FLAG_CHECKSUM_PRESENT,
    MSG_FLAG_EXHAUST_ALLOWED, MSG_FLAG_MORE_TO_COME, QUERY_FLAG_SLAVE_OK,
    REPLY_FLAG_CURSOR_NOT_FOUND, REPLY_FLAG_QUERY_FAILURE,
};
pub use crate::request::Request;
pub use crate::server::{ismaster_reply, MockServer, MockServerOptions, ResponderId};
