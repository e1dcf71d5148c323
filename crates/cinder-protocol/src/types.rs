//! RESP frame types.
//!
//! The [`Frame`] enum represents a single parsed RESP value. Bulk
//! strings use `Bytes` for reference-counted storage that avoids
//! copies when payloads move through the delivery pipeline.

use bytes::Bytes;

/// A single RESP protocol frame.
///
/// Covers the five wire types plus the two RESP null encodings
/// (`$-1\r\n` and `*-1\r\n`), which parse and serialize distinctly
/// even though most clients treat them alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string response, e.g. `+OK\r\n`.
    /// Used for short, non-binary status replies.
    Simple(String),

    /// Error response, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Null bulk string, `$-1\r\n`. The reply shape for a missing key.
    Null,

    /// Ordered array of frames, e.g. `*2\r\n+hello\r\n+world\r\n`.
    Array(Vec<Frame>),

    /// Null array, `*-1\r\n`.
    NullArray,
}

impl Frame {
    /// Returns `true` for either null encoding.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::NullArray)
    }

    /// Builds a bulk frame from anything byte-like.
    pub fn bulk(data: impl Into<Bytes>) -> Frame {
        Frame::Bulk(data.into())
    }
}
