//! Per-connection read loop.
//!
//! Reads RESP frames (or inline commands) from the socket, dispatches
//! them in arrival order, and enqueues every reply to the connection's
//! multiplexer slot; replies never touch the socket directly. After
//! each batch of pipelined commands the slot is kicked so replies
//! don't sit out the batch window.
//!
//! The close hook runs on every exit path, in a fixed order:
//! subscriptions are released first (so no broadcast can target the
//! dying connection), then the slot is torn down (pending bytes
//! discarded), then the client record drops.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use cinder_protocol::{parse_frame_bytes, Command, Frame, ProtocolError};

use crate::dispatch::{self, ConnState};
use crate::mux::Priority;
use crate::server::ServerContext;
use crate::ConnectionId;

/// Initial read buffer capacity. 4KB covers most commands comfortably
/// without over-allocating for simple PING/SET/GET workloads.
const BUF_CAPACITY: usize = 4096;

/// Maximum read buffer size before we disconnect the client. Prevents
/// a single slow or malicious client from consuming unbounded memory
/// with incomplete frames.
const MAX_BUF_SIZE: usize = 64 * 1024 * 1024;

/// How long a graceful close waits for queued replies to drain.
const CLOSE_DRAIN: Duration = Duration::from_millis(250);

/// Drives one client connection from accept to close.
pub(crate) async fn handle(stream: TcpStream, ctx: Arc<ServerContext>, id: ConnectionId) {
    let peer = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!(conn = id, error = %e, "connection vanished before setup");
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        trace!(conn = id, error = %e, "set_nodelay failed");
    }

    let (mut read_half, write_half) = stream.into_split();
    ctx.mux.register(id, write_half);
    ctx.clients.register(id, peer);

    let mut conn = ConnState::new(id);
    if let Err(e) = read_loop(&mut read_half, &ctx, &mut conn).await {
        debug!(conn = id, error = %e, "connection ended with error");
    }

    if conn.should_close {
        // graceful close (QUIT): let the final replies out first
        ctx.mux.drain(id, CLOSE_DRAIN).await;
    }

    ctx.broker.unsubscribe_all(id);
    ctx.mux.unregister(id);
    ctx.clients.unregister(id);
    debug!(conn = id, "connection closed");
}

async fn read_loop(
    read_half: &mut OwnedReadHalf,
    ctx: &Arc<ServerContext>,
    conn: &mut ConnState,
) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(BUF_CAPACITY);
    let mut out = BytesMut::with_capacity(BUF_CAPACITY);

    loop {
        if buf.len() > MAX_BUF_SIZE {
            warn!(conn = conn.id, "read buffer cap exceeded, closing");
            enqueue_reply(
                ctx,
                conn.id,
                &Frame::Error("ERR max buffer size exceeded, closing connection".into()),
                &mut out,
            );
            conn.should_close = true;
            return Ok(());
        }

        let n = read_half.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(()); // clean disconnect
        }

        // freeze the buffer so parsed bulk strings are zero-copy
        // slices of the receive buffer
        let frozen = buf.split().freeze();
        let mut offset = 0;

        loop {
            let remaining = frozen.slice(offset..);
            if remaining.is_empty() {
                break;
            }

            match parse_frame_bytes(&remaining) {
                Ok(Some((frame, consumed))) => {
                    offset += consumed;
                    match Command::from_frame(frame) {
                        Ok(None) => {} // blank inline line
                        Ok(Some(cmd)) => {
                            ctx.stats.commands_processed.fetch_add(1, Ordering::Relaxed);
                            let replies = dispatch::execute(cmd, ctx, conn).await;
                            for frame in &replies {
                                frame.serialize(&mut out);
                            }
                            flush_replies(ctx, conn.id, &mut out);
                        }
                        Err(e) => {
                            enqueue_reply(ctx, conn.id, &Frame::Error(format!("ERR {e}")), &mut out);
                        }
                    }
                    if conn.should_close {
                        return Ok(());
                    }
                }
                Ok(None) => break, // need more data
                Err(ProtocolError::BadHeader { skip }) => {
                    // skip the offending line and keep going; the
                    // dispatcher never sees it
                    debug!(conn = conn.id, skip, "malformed header skipped");
                    offset += skip.max(1);
                }
                Err(e) => {
                    debug!(conn = conn.id, error = %e, "unrecoverable protocol error");
                    enqueue_reply(
                        ctx,
                        conn.id,
                        &Frame::Error(format!("ERR Protocol error: {e}")),
                        &mut out,
                    );
                    conn.should_close = true;
                    return Ok(());
                }
            }
        }

        // keep any trailing partial frame for the next read
        if offset < frozen.len() {
            buf.extend_from_slice(&frozen[offset..]);
        }

        // pipelined batch finished: don't let replies wait out the
        // batch window
        ctx.mux.kick(conn.id);
    }
}

/// Serializes one reply frame and hands it to the slot.
fn enqueue_reply(ctx: &ServerContext, id: ConnectionId, frame: &Frame, out: &mut BytesMut) {
    frame.serialize(out);
    flush_replies(ctx, id, out);
}

/// Moves the accumulated reply bytes into the slot as one payload.
/// A full or missing slot drops the reply; the connection is on its
/// way down in either case and the drop counters record it.
fn flush_replies(ctx: &ServerContext, id: ConnectionId, out: &mut BytesMut) {
    if out.is_empty() {
        return;
    }
    let payload = out.split().freeze();
    if let Err(e) = ctx.mux.enqueue(id, payload, Priority::Normal) {
        debug!(conn = id, error = %e, "reply dropped");
    }
}
