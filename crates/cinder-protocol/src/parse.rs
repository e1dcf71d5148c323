//! Incremental RESP parser.
//!
//! Operates on buffered byte slices. The caller is responsible for
//! reading data from the network into a buffer — this parser is purely
//! synchronous. A `Cursor<&[u8]>` tracks the position through the
//! input without consuming it, so the caller can retry the same bytes
//! once more data arrives.
//!
//! # Recovery
//!
//! Partial input is never an error: the parser returns `Ok(None)` and
//! leaves the buffer untouched. A header line that cannot be parsed
//! (non-numeric count, unknown garbage after a type prefix) yields
//! [`ProtocolError::BadHeader`] carrying the number of bytes to
//! discard; the caller skips that line and resumes. Only structural
//! corruption inside a length-prefixed payload is unrecoverable.
//!
//! # Inline commands
//!
//! When the first byte is not one of the five RESP type markers, the
//! line is treated as an inline command: whitespace-separated tokens
//! terminated by `\r\n` or a bare `\n`, yielded as an array of bulk
//! strings. This is the fallback path for humans driving the server
//! with `nc`.
//!
//! # Zero-copy bulk strings
//!
//! When parsing from a `Bytes` buffer via [`parse_frame_bytes`], bulk
//! string data is returned as a zero-copy `Bytes::slice()` into the
//! original buffer. The fallback [`parse_frame`] copies bulk data for
//! callers that only have a `&[u8]`.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::Frame;

/// Maximum nesting depth for arrays. Prevents stack overflow from
/// malicious or malformed deeply-nested frames.
const MAX_NESTING_DEPTH: usize = 32;

/// Maximum number of elements in an array. Prevents memory
/// amplification where tiny elements declare huge Vec allocations.
const MAX_ARRAY_ELEMENTS: i64 = 1_048_576;

/// Maximum length of a bulk string in bytes (512 MB, matching Redis).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Cap for Vec::with_capacity in array parsing. A declared count of 1M
/// elements would pre-allocate tens of megabytes before any child data
/// is parsed; this cap bounds the initial allocation while the Vec
/// still grows organically.
const PREALLOC_CAP: usize = 1024;

/// Zero-copy frame parser. Bulk string data is returned as
/// `Bytes::slice()` into the input buffer, avoiding a heap copy per
/// bulk string. Use this on the hot path when the caller has a `Bytes`
/// (e.g. from `BytesMut::freeze()`).
///
/// Returns `Ok(Some((frame, consumed)))` for a complete frame,
/// `Ok(None)` if the buffer doesn't contain enough data yet, or
/// `Err(...)` if the data is malformed.
#[inline]
pub fn parse_frame_bytes(buf: &Bytes) -> Result<Option<(Frame, usize)>, ProtocolError> {
    parse_inner(buf.as_ref(), Some(buf))
}

/// Parses a complete RESP frame (or inline command) from `buf`.
///
/// Bulk string data is copied out of the buffer. Prefer
/// [`parse_frame_bytes`] on hot paths when a `Bytes` is available.
#[inline]
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    parse_inner(buf, None)
}

fn parse_inner(buf: &[u8], src: Option<&Bytes>) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    if !matches!(buf[0], b'+' | b'-' | b':' | b'$' | b'*') {
        return parse_inline(buf);
    }

    let mut cursor = Cursor::new(buf);
    match try_parse(&mut cursor, src, 0) {
        Ok(frame) => {
            let consumed = cursor.position() as usize;
            Ok(Some((frame, consumed)))
        }
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Parses an inline command line into an array of bulk-string tokens.
///
/// The line ends at the first `\n` (a preceding `\r` is stripped).
/// Tokens are runs of non-whitespace bytes. A blank line parses to an
/// empty array, which the dispatcher ignores.
fn parse_inline(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let Some(nl) = memchr::memchr(b'\n', buf) else {
        return Ok(None);
    };

    let mut line = &buf[..nl];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }

    let tokens: Vec<Frame> = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| Frame::Bulk(Bytes::copy_from_slice(t)))
        .collect();

    Ok(Some((Frame::Array(tokens), nl + 1)))
}

// ---------------------------------------------------------------------------
// single-pass parser: validates and builds Frame values in one traversal
// ---------------------------------------------------------------------------

/// Parses a complete RESP frame from the cursor position, returning
/// `Incomplete` if the buffer doesn't contain enough data.
///
/// When `src` is `Some`, bulk string bytes are sliced zero-copy from
/// the source buffer. When `None`, they are copied.
fn try_parse(
    cursor: &mut Cursor<&[u8]>,
    src: Option<&Bytes>,
    depth: usize,
) -> Result<Frame, ProtocolError> {
    let prefix = read_byte(cursor)?;

    match prefix {
        b'+' => {
            let line = read_line(cursor)?;
            match std::str::from_utf8(line) {
                Ok(s) => Ok(Frame::Simple(s.to_owned())),
                Err(_) => Err(bad_header(cursor)),
            }
        }
        b'-' => {
            let line = read_line(cursor)?;
            match std::str::from_utf8(line) {
                Ok(s) => Ok(Frame::Error(s.to_owned())),
                Err(_) => Err(bad_header(cursor)),
            }
        }
        b':' => {
            let val = read_integer_line(cursor)?;
            Ok(Frame::Integer(val))
        }
        b'$' => {
            let len = read_integer_line(cursor)?;
            if len == -1 {
                return Ok(Frame::Null);
            }
            if len < -1 || len > MAX_BULK_LEN {
                return Err(bad_header(cursor));
            }
            let len = len as usize;

            // need `len` bytes of data + \r\n
            if remaining(cursor) < len + 2 {
                return Err(ProtocolError::Incomplete);
            }

            let pos = cursor.position() as usize;

            // verify trailing \r\n (scope the borrow so we can mutate cursor after)
            {
                let buf = cursor.get_ref();
                if buf[pos + len] != b'\r' || buf[pos + len + 1] != b'\n' {
                    return Err(ProtocolError::Corrupt(
                        "bulk string payload not terminated by CRLF",
                    ));
                }
            }

            cursor.set_position((pos + len + 2) as u64);

            // zero-copy when a source Bytes is available, copy otherwise
            let data = match src {
                Some(b) => b.slice(pos..pos + len),
                None => Bytes::copy_from_slice(&cursor.get_ref()[pos..pos + len]),
            };
            Ok(Frame::Bulk(data))
        }
        b'*' => {
            let next_depth = depth + 1;
            if next_depth > MAX_NESTING_DEPTH {
                return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
            }

            let count = read_integer_line(cursor)?;
            if count == -1 {
                return Ok(Frame::NullArray);
            }
            if count < -1 || count > MAX_ARRAY_ELEMENTS {
                return Err(bad_header(cursor));
            }

            let count = count as usize;
            let mut frames = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                frames.push(try_parse(cursor, src, next_depth)?);
            }
            Ok(Frame::Array(frames))
        }
        // parse_inner only dispatches marker bytes here; nested frames
        // with an unknown prefix fall through to header recovery
        _ => {
            let _ = read_line(cursor)?;
            Err(bad_header(cursor))
        }
    }
}

/// Builds a recoverable header error skipping everything consumed so
/// far, i.e. through the terminator of the line the cursor just read.
fn bad_header(cursor: &Cursor<&[u8]>) -> ProtocolError {
    ProtocolError::BadHeader {
        skip: cursor.position() as usize,
    }
}

// ---------------------------------------------------------------------------
// low-level cursor helpers
// ---------------------------------------------------------------------------

fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    if pos >= cursor.get_ref().len() {
        return Err(ProtocolError::Incomplete);
    }
    cursor.set_position((pos + 1) as u64);
    Ok(cursor.get_ref()[pos])
}

/// Returns the slice of bytes up to (but not including) the next
/// `\r\n`, and advances the cursor past the `\r\n`.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let start = cursor.position() as usize;
    let end = find_crlf(cursor)?;
    Ok(&cursor.get_ref()[start..end])
}

/// Reads a line and parses it as an i64. A non-numeric line is a
/// recoverable header error.
fn read_integer_line(cursor: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    let line = read_line(cursor)?;
    parse_i64_bytes(line).ok_or_else(|| bad_header(cursor))
}

/// Finds the next `\r\n` starting from the cursor position. Returns
/// the index of `\r` and advances the cursor past the `\n`.
fn find_crlf(cursor: &mut Cursor<&[u8]>) -> Result<usize, ProtocolError> {
    let buf = cursor.get_ref();
    let start = cursor.position() as usize;

    if start >= buf.len() {
        return Err(ProtocolError::Incomplete);
    }

    // memchr scans for \r, then verify \n follows
    let mut pos = start;
    while let Some(offset) = memchr::memchr(b'\r', &buf[pos..]) {
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            cursor.set_position((cr + 2) as u64);
            return Ok(cr);
        }
        // bare \r without \n — keep scanning past it
        pos = cr + 1;
    }

    Err(ProtocolError::Incomplete)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    let len = cursor.get_ref().len();
    let pos = cursor.position() as usize;
    len.saturating_sub(pos)
}

/// Parses an i64 directly from a byte slice without allocating.
///
/// Negative numbers are accumulated in the negative direction so that
/// `i64::MIN` is representable without overflow.
fn parse_i64_bytes(buf: &[u8]) -> Option<i64> {
    if buf.is_empty() {
        return None;
    }

    let (negative, digits) = if buf[0] == b'-' {
        (true, &buf[1..])
    } else {
        (false, buf)
    };

    if digits.is_empty() {
        return None;
    }

    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        let d = (b - b'0') as i64;
        n = if negative {
            n.checked_mul(10)?.checked_sub(d)?
        } else {
            n.checked_mul(10)?.checked_add(d)?
        };
    }
    Some(n)
}
