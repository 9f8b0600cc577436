use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong inside the harness, kept distinct from
/// ordinary test-assertion failures so a broken harness and a failing
/// conformance check are never confused.
#[derive(Debug, Error)]
pub enum MockodbError {
    /// Malformed frame. Fatal to the connection that produced it.
    #[error("decode error: {0}")]
    Decode(String),

    /// Nothing matched within the bound. Reports what was awaited and what
    /// was sitting in the queue at the time.
    #[error("timed out after {waited:?} waiting for {pattern}; queued: {queued}")]
    Timeout {
        pattern: String,
        queued: String,
        waited: Duration,
    },

    /// A request arrived but does not satisfy the asserted pattern.
    #[error("request does not match pattern\n  expected: {expected}\n  actual:   {actual}")]
    Mismatch { expected: String, actual: String },

    /// The peer went away while a waiter was blocked on it.
    #[error("connection {0} closed")]
    ConnectionClosed(u64),

    /// Two replies scripted for one request. Programming error in the test.
    #[error("request {0} was already replied to")]
    DoubleReply(i32),

    /// Harness misuse that is none of the above, e.g. replying to a
    /// fire-and-forget request.
    #[error("protocol misuse: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bson serialization error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[error("bson deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),
}
