//! Command execution.
//!
//! Routes a typed [`Command`] to the store, the broker, or the
//! connection's own state, and returns the reply frames in order. Any
//! error becomes a RESP error reply; processing on the connection
//! always continues (except QUIT, which flags the connection for a
//! graceful close).

use std::collections::HashSet;

use bytes::Bytes;

use cinder_core::TtlResult;
use cinder_protocol::{ClientSubcommand, Command, Frame};

use crate::broker::PublishOptions;
use crate::info;
use crate::mux::Priority;
use crate::server::ServerContext;
use crate::ConnectionId;

/// At most this many arguments are echoed back in the unknown-command
/// error, matching the "args beginning with" phrasing.
const UNKNOWN_ARGS_SHOWN: usize = 5;

/// Per-connection dispatcher state. The subscribed set mirrors broker
/// membership exactly: every mutation here goes through the broker in
/// the same call.
#[derive(Debug)]
pub struct ConnState {
    pub id: ConnectionId,
    pub subscribed: HashSet<Bytes>,
    /// Set by QUIT; the read loop drains and closes.
    pub should_close: bool,
}

impl ConnState {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            subscribed: HashSet::new(),
            should_close: false,
        }
    }
}

/// Executes one command, returning the reply frames in write order.
pub async fn execute(cmd: Command, ctx: &ServerContext, conn: &mut ConnState) -> Vec<Frame> {
    match cmd {
        Command::Ping(None) => vec![Frame::Simple("PONG".into())],
        Command::Ping(Some(msg)) => vec![Frame::Bulk(msg)],
        Command::Echo(msg) => vec![Frame::Bulk(msg)],

        // the wire accepts AUTH for client compatibility; there is no
        // password to check
        Command::Auth => vec![Frame::Simple("OK".into())],

        Command::Select { index } => {
            if index == 0 {
                vec![Frame::Simple("OK".into())]
            } else {
                vec![Frame::Error("ERR DB index is out of range".into())]
            }
        }

        Command::Info { section: _ } => {
            // the full block regardless of the requested section
            let body = info::render(&ctx.info_snapshot());
            vec![Frame::Bulk(Bytes::from(body))]
        }

        Command::Client(sub) => vec![execute_client(sub, ctx, conn)],

        Command::Set { key, value } => {
            ctx.store.set(key, value);
            vec![Frame::Simple("OK".into())]
        }

        Command::Get { key } => match ctx.store.get(&key) {
            Some(value) => vec![Frame::Bulk(value)],
            None => vec![Frame::Null],
        },

        Command::Del { keys } => {
            let removed = ctx.store.del(&keys);
            vec![Frame::Integer(removed as i64)]
        }

        Command::Exists { keys } => {
            let present = ctx.store.exists(&keys);
            vec![Frame::Integer(present as i64)]
        }

        Command::Ttl { key } => {
            let reply = match ctx.store.ttl(&key) {
                TtlResult::NotFound => -2,
                TtlResult::NoExpiry => -1,
                TtlResult::Seconds(s) => s as i64,
            };
            vec![Frame::Integer(reply)]
        }

        Command::Expire { key, seconds } => {
            let armed = ctx.store.expire(key, seconds);
            vec![Frame::Integer(i64::from(armed))]
        }

        Command::Persist { key } => {
            let cleared = ctx.store.persist(&key);
            vec![Frame::Integer(i64::from(cleared))]
        }

        Command::Keys { pattern } => {
            let keys = ctx.store.keys(&pattern);
            vec![Frame::Array(keys.into_iter().map(Frame::Bulk).collect())]
        }

        Command::Scan {
            cursor,
            pattern,
            count,
        } => {
            let page = ctx.store.scan(cursor, pattern.as_deref(), count);
            vec![Frame::Array(vec![
                Frame::Bulk(Bytes::from(page.next_cursor.to_string())),
                Frame::Array(page.keys.into_iter().map(Frame::Bulk).collect()),
            ])]
        }

        Command::DbSize => vec![Frame::Integer(ctx.store.dbsize() as i64)],

        Command::Type { key } => vec![Frame::Simple(ctx.store.type_of(&key).into())],

        Command::Subscribe { channels } => {
            let mut replies = Vec::with_capacity(channels.len());
            for channel in channels {
                ctx.broker
                    .subscribe(conn.id, channel.clone(), Priority::Normal);
                conn.subscribed.insert(channel.clone());
                replies.push(Frame::Array(vec![
                    Frame::Bulk(Bytes::from_static(b"subscribe")),
                    Frame::Bulk(channel),
                    Frame::Integer(conn.subscribed.len() as i64),
                ]));
            }
            replies
        }

        Command::Unsubscribe { channels } => {
            let targets: Vec<Bytes> = if channels.is_empty() {
                conn.subscribed.iter().cloned().collect()
            } else {
                channels
            };

            if targets.is_empty() {
                // nothing subscribed and nothing named: single
                // confirmation with a null channel, like Redis
                return vec![Frame::Array(vec![
                    Frame::Bulk(Bytes::from_static(b"unsubscribe")),
                    Frame::Null,
                    Frame::Integer(0),
                ])];
            }

            let mut replies = Vec::with_capacity(targets.len());
            for channel in targets {
                ctx.broker.unsubscribe(conn.id, &channel);
                conn.subscribed.remove(&channel);
                replies.push(Frame::Array(vec![
                    Frame::Bulk(Bytes::from_static(b"unsubscribe")),
                    Frame::Bulk(channel),
                    Frame::Integer(conn.subscribed.len() as i64),
                ]));
            }
            replies
        }

        Command::Publish { channel, message } => {
            let delivered = ctx
                .broker
                .publish(channel, message, PublishOptions::default())
                .await;
            vec![Frame::Integer(delivered as i64)]
        }

        Command::Quit => {
            conn.should_close = true;
            vec![Frame::Simple("OK".into())]
        }

        Command::Unknown { name, args } => vec![Frame::Error(unknown_command(&name, &args))],
    }
}

fn execute_client(sub: ClientSubcommand, ctx: &ServerContext, conn: &ConnState) -> Frame {
    match sub {
        ClientSubcommand::SetName(name) => {
            ctx.clients.set_name(conn.id, name);
            Frame::Simple("OK".into())
        }
        ClientSubcommand::GetName => match ctx.clients.name(conn.id) {
            Some(name) => Frame::Bulk(name),
            None => Frame::Null,
        },
        ClientSubcommand::List => Frame::Bulk(Bytes::from(ctx.clients.list())),
        ClientSubcommand::Unknown(sub) => {
            Frame::Error(format!("ERR unknown subcommand '{sub}'. Try CLIENT HELP."))
        }
    }
}

/// `ERR unknown command 'X', with args beginning with: 'a', 'b', `
/// with a trailing separator after every shown argument, like Redis.
fn unknown_command(name: &str, args: &[Bytes]) -> String {
    let mut msg = format!("ERR unknown command '{name}', with args beginning with: ");
    for arg in args.iter().take(UNKNOWN_ARGS_SHOWN) {
        msg.push('\'');
        msg.push_str(&String::from_utf8_lossy(arg));
        msg.push_str("', ");
    }
    msg
}
