//! Command parsing from RESP frames.
//!
//! Converts a parsed [`Frame`] into a typed [`Command`]. Nested arrays
//! are flattened into a single token list before interpretation, so a
//! client that wraps arguments in sub-arrays still produces a flat
//! command. Arity and argument-type validation happens here; the
//! executor only ever sees well-formed commands (or `Unknown`).

use bytes::Bytes;
use thiserror::Error;

use crate::types::Frame;

/// Errors produced while interpreting a frame as a command.
///
/// `Display` renders the exact Redis-compatible message body; callers
/// prepend the `ERR ` prefix when building the wire reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Known command, wrong argument count. Carries the lowercased
    /// command name.
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    /// An argument that must be an integer wasn't one.
    #[error("value is not an integer or out of range")]
    NotAnInteger,

    /// SCAN received a cursor that isn't a non-negative integer.
    #[error("invalid cursor")]
    InvalidCursor,

    /// An unrecognized option token (e.g. a bad SCAN modifier).
    #[error("syntax error")]
    Syntax,
}

/// Subcommands of CLIENT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSubcommand {
    /// CLIENT SETNAME <name>.
    SetName(Bytes),
    /// CLIENT GETNAME.
    GetName,
    /// CLIENT LIST.
    List,
    /// Anything else; carries the subcommand as sent for the error reply.
    Unknown(String),
}

/// A parsed client command, ready for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// PING with an optional message. Returns PONG or echoes the message.
    Ping(Option<Bytes>),

    /// ECHO <message>.
    Echo(Bytes),

    /// AUTH <password> or AUTH <user> <password>. Accepted unconditionally.
    Auth,

    /// SELECT <index>. Only database 0 exists.
    Select { index: i64 },

    /// INFO [section].
    Info { section: Option<String> },

    /// CLIENT <subcommand> [...].
    Client(ClientSubcommand),

    /// SET <key> <value>. Replaces the value and clears any TTL.
    Set { key: Bytes, value: Bytes },

    /// GET <key>.
    Get { key: Bytes },

    /// DEL <key> [key ...].
    Del { keys: Vec<Bytes> },

    /// EXISTS <key> [key ...]. Duplicates count multiply.
    Exists { keys: Vec<Bytes> },

    /// TTL <key>.
    Ttl { key: Bytes },

    /// EXPIRE <key> <seconds>.
    Expire { key: Bytes, seconds: i64 },

    /// PERSIST <key>.
    Persist { key: Bytes },

    /// KEYS <pattern>.
    Keys { pattern: Bytes },

    /// SCAN <cursor> [MATCH pattern] [COUNT n].
    Scan {
        cursor: u64,
        pattern: Option<Bytes>,
        count: Option<usize>,
    },

    /// DBSIZE.
    DbSize,

    /// TYPE <key>.
    Type { key: Bytes },

    /// SUBSCRIBE <channel> [channel ...].
    Subscribe { channels: Vec<Bytes> },

    /// UNSUBSCRIBE [channel ...]. No channels = all.
    Unsubscribe { channels: Vec<Bytes> },

    /// PUBLISH <channel> <message>.
    Publish { channel: Bytes, message: Bytes },

    /// QUIT. Replies OK, then the connection closes.
    Quit,

    /// A command we don't recognize; carries the name as sent plus the
    /// leading arguments for the error reply.
    Unknown { name: String, args: Vec<Bytes> },
}

impl Command {
    /// Interprets a frame as a command.
    ///
    /// Returns `Ok(None)` for an empty command (blank inline line);
    /// the caller skips it silently, matching Redis.
    pub fn from_frame(frame: Frame) -> Result<Option<Command>, CommandError> {
        let mut tokens = Vec::new();
        flatten(frame, &mut tokens);

        let Some((name_raw, args)) = tokens.split_first() else {
            return Ok(None);
        };

        let name = String::from_utf8_lossy(name_raw).into_owned();
        let upper = name.to_ascii_uppercase();

        let cmd = match upper.as_str() {
            "PING" => parse_ping(args)?,
            "ECHO" => parse_exact1(args, "echo", |m| Command::Echo(m))?,
            "AUTH" => parse_auth(args)?,
            "SELECT" => parse_select(args)?,
            "INFO" => parse_info(args)?,
            "CLIENT" => parse_client(args)?,
            "SET" => parse_set(args)?,
            "GET" => parse_exact1(args, "get", |k| Command::Get { key: k })?,
            "DEL" => parse_at_least1(args, "del", |ks| Command::Del { keys: ks })?,
            "EXISTS" => parse_at_least1(args, "exists", |ks| Command::Exists { keys: ks })?,
            "TTL" => parse_exact1(args, "ttl", |k| Command::Ttl { key: k })?,
            "EXPIRE" => parse_expire(args)?,
            "PERSIST" => parse_exact1(args, "persist", |k| Command::Persist { key: k })?,
            "KEYS" => parse_exact1(args, "keys", |p| Command::Keys { pattern: p })?,
            "SCAN" => parse_scan(args)?,
            "DBSIZE" => parse_exact0(args, "dbsize", Command::DbSize)?,
            "TYPE" => parse_exact1(args, "type", |k| Command::Type { key: k })?,
            "SUBSCRIBE" => {
                parse_at_least1(args, "subscribe", |cs| Command::Subscribe { channels: cs })?
            }
            "UNSUBSCRIBE" => Command::Unsubscribe {
                channels: args.to_vec(),
            },
            "PUBLISH" => parse_publish(args)?,
            "QUIT" => parse_exact0(args, "quit", Command::Quit)?,
            _ => Command::Unknown {
                name,
                args: args.to_vec(),
            },
        };

        Ok(Some(cmd))
    }

    /// Static name for logging and counters.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping(_) => "ping",
            Command::Echo(_) => "echo",
            Command::Auth => "auth",
            Command::Select { .. } => "select",
            Command::Info { .. } => "info",
            Command::Client(_) => "client",
            Command::Set { .. } => "set",
            Command::Get { .. } => "get",
            Command::Del { .. } => "del",
            Command::Exists { .. } => "exists",
            Command::Ttl { .. } => "ttl",
            Command::Expire { .. } => "expire",
            Command::Persist { .. } => "persist",
            Command::Keys { .. } => "keys",
            Command::Scan { .. } => "scan",
            Command::DbSize => "dbsize",
            Command::Type { .. } => "type",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::Publish { .. } => "publish",
            Command::Quit => "quit",
            Command::Unknown { .. } => "unknown",
        }
    }
}

/// Flattens a frame tree into a token list. Nested arrays are inlined
/// depth-first; nulls contribute nothing.
fn flatten(frame: Frame, out: &mut Vec<Bytes>) {
    match frame {
        Frame::Array(items) => {
            for item in items {
                flatten(item, out);
            }
        }
        Frame::Bulk(data) => out.push(data),
        Frame::Simple(s) => out.push(Bytes::from(s.into_bytes())),
        Frame::Error(s) => out.push(Bytes::from(s.into_bytes())),
        Frame::Integer(n) => {
            let mut buf = itoa::Buffer::new();
            out.push(Bytes::copy_from_slice(buf.format(n).as_bytes()));
        }
        Frame::Null | Frame::NullArray => {}
    }
}

fn parse_i64_token(token: &Bytes) -> Option<i64> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

fn parse_ping(args: &[Bytes]) -> Result<Command, CommandError> {
    match args {
        [] => Ok(Command::Ping(None)),
        [msg] => Ok(Command::Ping(Some(msg.clone()))),
        _ => Err(CommandError::WrongArity("ping".into())),
    }
}

fn parse_auth(args: &[Bytes]) -> Result<Command, CommandError> {
    // AUTH <password> or AUTH <user> <password>; always accepted
    match args.len() {
        1 | 2 => Ok(Command::Auth),
        _ => Err(CommandError::WrongArity("auth".into())),
    }
}

fn parse_select(args: &[Bytes]) -> Result<Command, CommandError> {
    match args {
        [idx] => {
            let index = parse_i64_token(idx).ok_or(CommandError::NotAnInteger)?;
            Ok(Command::Select { index })
        }
        _ => Err(CommandError::WrongArity("select".into())),
    }
}

fn parse_info(args: &[Bytes]) -> Result<Command, CommandError> {
    match args {
        [] => Ok(Command::Info { section: None }),
        [section] => Ok(Command::Info {
            section: Some(String::from_utf8_lossy(section).into_owned()),
        }),
        _ => Err(CommandError::WrongArity("info".into())),
    }
}

fn parse_client(args: &[Bytes]) -> Result<Command, CommandError> {
    let Some((sub, rest)) = args.split_first() else {
        return Err(CommandError::WrongArity("client".into()));
    };
    let sub_str = String::from_utf8_lossy(sub).into_owned();

    let sub = match sub_str.to_ascii_uppercase().as_str() {
        "SETNAME" => match rest {
            [name] => ClientSubcommand::SetName(name.clone()),
            _ => return Err(CommandError::WrongArity("client".into())),
        },
        "GETNAME" => match rest {
            [] => ClientSubcommand::GetName,
            _ => return Err(CommandError::WrongArity("client".into())),
        },
        "LIST" => match rest {
            [] => ClientSubcommand::List,
            _ => return Err(CommandError::WrongArity("client".into())),
        },
        _ => ClientSubcommand::Unknown(sub_str),
    };
    Ok(Command::Client(sub))
}

fn parse_set(args: &[Bytes]) -> Result<Command, CommandError> {
    match args {
        [key, value] => Ok(Command::Set {
            key: key.clone(),
            value: value.clone(),
        }),
        _ => Err(CommandError::WrongArity("set".into())),
    }
}

fn parse_expire(args: &[Bytes]) -> Result<Command, CommandError> {
    match args {
        [key, seconds] => {
            let seconds = parse_i64_token(seconds).ok_or(CommandError::NotAnInteger)?;
            Ok(Command::Expire {
                key: key.clone(),
                seconds,
            })
        }
        _ => Err(CommandError::WrongArity("expire".into())),
    }
}

fn parse_scan(args: &[Bytes]) -> Result<Command, CommandError> {
    let Some((cursor_raw, mut rest)) = args.split_first() else {
        return Err(CommandError::WrongArity("scan".into()));
    };

    let cursor: u64 = std::str::from_utf8(cursor_raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::InvalidCursor)?;

    let mut pattern = None;
    let mut count = None;

    while let Some((opt, tail)) = rest.split_first() {
        match (opt.to_ascii_uppercase().as_slice(), tail.split_first()) {
            (b"MATCH", Some((pat, tail2))) => {
                pattern = Some(pat.clone());
                rest = tail2;
            }
            (b"COUNT", Some((n, tail2))) => {
                let n = parse_i64_token(n).ok_or(CommandError::NotAnInteger)?;
                if n < 1 {
                    return Err(CommandError::Syntax);
                }
                count = Some(n as usize);
                rest = tail2;
            }
            _ => return Err(CommandError::Syntax),
        }
    }

    Ok(Command::Scan {
        cursor,
        pattern,
        count,
    })
}

fn parse_publish(args: &[Bytes]) -> Result<Command, CommandError> {
    match args {
        [channel, message] => Ok(Command::Publish {
            channel: channel.clone(),
            message: message.clone(),
        }),
        _ => Err(CommandError::WrongArity("publish".into())),
    }
}

fn parse_exact0(args: &[Bytes], name: &str, cmd: Command) -> Result<Command, CommandError> {
    if args.is_empty() {
        Ok(cmd)
    } else {
        Err(CommandError::WrongArity(name.into()))
    }
}

fn parse_exact1(
    args: &[Bytes],
    name: &str,
    build: impl FnOnce(Bytes) -> Command,
) -> Result<Command, CommandError> {
    match args {
        [one] => Ok(build(one.clone())),
        _ => Err(CommandError::WrongArity(name.into())),
    }
}

fn parse_at_least1(
    args: &[Bytes],
    name: &str,
    build: impl FnOnce(Vec<Bytes>) -> Command,
) -> Result<Command, CommandError> {
    if args.is_empty() {
        Err(CommandError::WrongArity(name.into()))
    } else {
        Ok(build(args.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&[u8]]) -> Result<Option<Command>, CommandError> {
        let frame = Frame::Array(
            parts
                .iter()
                .map(|p| Frame::Bulk(Bytes::copy_from_slice(p)))
                .collect(),
        );
        Command::from_frame(frame)
    }

    fn must(parts: &[&[u8]]) -> Command {
        cmd(parts).unwrap().unwrap()
    }

    #[test]
    fn ping_variants() {
        assert_eq!(must(&[b"PING"]), Command::Ping(None));
        assert_eq!(
            must(&[b"ping", b"hello"]),
            Command::Ping(Some(Bytes::from_static(b"hello")))
        );
        assert_eq!(
            cmd(&[b"PING", b"a", b"b"]),
            Err(CommandError::WrongArity("ping".into()))
        );
    }

    #[test]
    fn command_name_is_case_insensitive() {
        assert_eq!(
            must(&[b"GeT", b"k"]),
            Command::Get {
                key: Bytes::from_static(b"k")
            }
        );
    }

    #[test]
    fn set_requires_exactly_key_and_value() {
        assert_eq!(
            must(&[b"SET", b"foo", b"bar"]),
            Command::Set {
                key: Bytes::from_static(b"foo"),
                value: Bytes::from_static(b"bar"),
            }
        );
        assert_eq!(
            cmd(&[b"SET", b"foo"]),
            Err(CommandError::WrongArity("set".into()))
        );
        assert_eq!(
            cmd(&[b"SET", b"foo", b"bar", b"EX", b"10"]),
            Err(CommandError::WrongArity("set".into()))
        );
    }

    #[test]
    fn expire_parses_seconds() {
        assert_eq!(
            must(&[b"EXPIRE", b"k", b"10"]),
            Command::Expire {
                key: Bytes::from_static(b"k"),
                seconds: 10
            }
        );
        assert_eq!(
            must(&[b"EXPIRE", b"k", b"-5"]),
            Command::Expire {
                key: Bytes::from_static(b"k"),
                seconds: -5
            }
        );
        assert_eq!(
            cmd(&[b"EXPIRE", b"k", b"ten"]),
            Err(CommandError::NotAnInteger)
        );
        assert_eq!(
            cmd(&[b"EXPIRE", b"k", b"1.5"]),
            Err(CommandError::NotAnInteger)
        );
    }

    #[test]
    fn select_parses_index() {
        assert_eq!(must(&[b"SELECT", b"0"]), Command::Select { index: 0 });
        assert_eq!(must(&[b"SELECT", b"3"]), Command::Select { index: 3 });
        assert_eq!(cmd(&[b"SELECT", b"abc"]), Err(CommandError::NotAnInteger));
    }

    #[test]
    fn auth_is_accepted_with_one_or_two_args() {
        assert_eq!(must(&[b"AUTH", b"secret"]), Command::Auth);
        assert_eq!(must(&[b"AUTH", b"user", b"secret"]), Command::Auth);
        assert_eq!(
            cmd(&[b"AUTH"]),
            Err(CommandError::WrongArity("auth".into()))
        );
    }

    #[test]
    fn scan_with_options() {
        assert_eq!(
            must(&[b"SCAN", b"0"]),
            Command::Scan {
                cursor: 0,
                pattern: None,
                count: None
            }
        );
        assert_eq!(
            must(&[b"SCAN", b"5", b"MATCH", b"user:*", b"COUNT", b"20"]),
            Command::Scan {
                cursor: 5,
                pattern: Some(Bytes::from_static(b"user:*")),
                count: Some(20),
            }
        );
        assert_eq!(
            must(&[b"SCAN", b"0", b"count", b"7"]),
            Command::Scan {
                cursor: 0,
                pattern: None,
                count: Some(7)
            }
        );
    }

    #[test]
    fn scan_rejects_bad_input() {
        assert_eq!(cmd(&[b"SCAN", b"nope"]), Err(CommandError::InvalidCursor));
        assert_eq!(cmd(&[b"SCAN", b"-1"]), Err(CommandError::InvalidCursor));
        assert_eq!(
            cmd(&[b"SCAN", b"0", b"COUNT", b"0"]),
            Err(CommandError::Syntax)
        );
        assert_eq!(
            cmd(&[b"SCAN", b"0", b"BOGUS", b"x"]),
            Err(CommandError::Syntax)
        );
        assert_eq!(
            cmd(&[b"SCAN", b"0", b"MATCH"]),
            Err(CommandError::Syntax)
        );
    }

    #[test]
    fn client_subcommands() {
        assert_eq!(
            must(&[b"CLIENT", b"SETNAME", b"worker-1"]),
            Command::Client(ClientSubcommand::SetName(Bytes::from_static(b"worker-1")))
        );
        assert_eq!(
            must(&[b"CLIENT", b"getname"]),
            Command::Client(ClientSubcommand::GetName)
        );
        assert_eq!(
            must(&[b"CLIENT", b"LIST"]),
            Command::Client(ClientSubcommand::List)
        );
        assert_eq!(
            must(&[b"CLIENT", b"PAUSE"]),
            Command::Client(ClientSubcommand::Unknown("PAUSE".into()))
        );
        assert_eq!(
            cmd(&[b"CLIENT"]),
            Err(CommandError::WrongArity("client".into()))
        );
    }

    #[test]
    fn unsubscribe_allows_zero_channels() {
        assert_eq!(
            must(&[b"UNSUBSCRIBE"]),
            Command::Unsubscribe { channels: vec![] }
        );
    }

    #[test]
    fn unknown_command_carries_name_and_args() {
        assert_eq!(
            must(&[b"FLUSHALL", b"ASYNC"]),
            Command::Unknown {
                name: "FLUSHALL".into(),
                args: vec![Bytes::from_static(b"ASYNC")],
            }
        );
    }

    #[test]
    fn empty_command_is_none() {
        assert_eq!(Command::from_frame(Frame::Array(vec![])), Ok(None));
    }

    #[test]
    fn nested_arrays_flatten() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"DEL")),
            Frame::Array(vec![
                Frame::Bulk(Bytes::from_static(b"a")),
                Frame::Bulk(Bytes::from_static(b"b")),
            ]),
        ]);
        assert_eq!(
            Command::from_frame(frame).unwrap().unwrap(),
            Command::Del {
                keys: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            }
        );
    }

    #[test]
    fn integer_tokens_flatten_to_decimal() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"EXPIRE")),
            Frame::Bulk(Bytes::from_static(b"k")),
            Frame::Integer(30),
        ]);
        assert_eq!(
            Command::from_frame(frame).unwrap().unwrap(),
            Command::Expire {
                key: Bytes::from_static(b"k"),
                seconds: 30
            }
        );
    }

    #[test]
    fn error_messages_render_exactly() {
        assert_eq!(
            CommandError::WrongArity("get".into()).to_string(),
            "wrong number of arguments for 'get' command"
        );
        assert_eq!(
            CommandError::NotAnInteger.to_string(),
            "value is not an integer or out of range"
        );
    }
}
