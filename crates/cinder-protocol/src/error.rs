//! Protocol error types for RESP parsing.

use thiserror::Error;

/// Errors that can occur when parsing the RESP wire format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input buffer doesn't contain a complete frame yet.
    /// The caller should read more data and try again.
    #[error("incomplete frame: need more data")]
    Incomplete,

    /// A header line (type prefix + count) could not be parsed.
    ///
    /// Recoverable: the caller discards `skip` bytes (everything up to
    /// and including the offending line's terminator) and resumes
    /// parsing at the next line.
    #[error("malformed header, skipping {skip} bytes")]
    BadHeader { skip: usize },

    /// Arrays nested deeper than the parser allows.
    #[error("frame nesting exceeds {0} levels")]
    NestingTooDeep(usize),

    /// The frame structure is corrupt in a way that can't be skipped
    /// (e.g. a bulk string whose payload is not followed by CRLF).
    /// The connection should be closed.
    #[error("corrupt frame: {0}")]
    Corrupt(&'static str),
}
