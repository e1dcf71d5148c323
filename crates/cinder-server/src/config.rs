//! Server configuration and environment resolution.

use std::time::Duration;

/// Default RESP port when neither flag nor environment says otherwise.
pub const DEFAULT_PORT: u16 = 6380;

/// Tuning for the per-connection output multiplexer.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Max messages coalesced into one write batch.
    pub batch_size: usize,
    /// How long a partial batch may sit before it's flushed anyway.
    pub batch_timeout: Duration,
    /// Total queued messages per slot across all three priorities.
    pub max_queue_size: usize,
    /// Payloads larger than this are split into ordered chunks.
    pub max_chunk_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            batch_timeout: Duration::from_millis(5),
            max_queue_size: 1000,
            max_chunk_size: 8192,
        }
    }
}

/// Tuning for the pub/sub broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Channels with at least this many subscribers broadcast through
    /// the multiplexer's chunked fan-out instead of buffering.
    pub large_channel_threshold: usize,
    /// How often buffered channel payloads are released.
    pub buffer_flush_interval: Duration,
    /// A channel buffer reaching this many payloads flushes early.
    pub max_buffered_messages: usize,
    /// Turn buffering off entirely (every publish delivers directly).
    pub batching_enabled: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            large_channel_threshold: 100,
            buffer_flush_interval: Duration::from_millis(10),
            max_buffered_messages: 100,
            batching_enabled: true,
        }
    }
}

/// Everything the server needs to boot.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port. 0 asks the OS for an ephemeral port (used by tests).
    pub port: u16,
    /// Bind address; the server listens on all interfaces by default.
    pub bind_addr: String,
    pub mux: MuxConfig,
    pub broker: BrokerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addr: "0.0.0.0".into(),
            mux: MuxConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Config bound to an ephemeral localhost port, for tests.
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            bind_addr: "127.0.0.1".into(),
            ..Self::default()
        }
    }
}

/// Resolves the listen port: CLI flag first, then `REDIS_PORT`, then
/// `PORT`, then the default. A set-but-invalid environment value is a
/// startup error rather than a silent fallback.
pub fn resolve_port(cli_port: Option<u16>) -> Result<u16, String> {
    if let Some(port) = cli_port {
        return Ok(port);
    }
    for var in ["REDIS_PORT", "PORT"] {
        if let Ok(raw) = std::env::var(var) {
            let port: u32 = raw
                .trim()
                .parse()
                .map_err(|_| format!("{var}={raw:?} is not a valid port number"))?;
            if !(1..=65535).contains(&port) {
                return Err(format!("{var}={raw:?} is out of range (1-65535)"));
            }
            return Ok(port as u16);
        }
    }
    Ok(DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_wins() {
        assert_eq!(resolve_port(Some(7777)).unwrap(), 7777);
    }

    #[test]
    fn default_when_nothing_set() {
        // note: assumes the test environment doesn't set REDIS_PORT/PORT
        if std::env::var("REDIS_PORT").is_err() && std::env::var("PORT").is_err() {
            assert_eq!(resolve_port(None).unwrap(), DEFAULT_PORT);
        }
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.mux.max_queue_size > 0);
        assert!(cfg.broker.large_channel_threshold > 0);
    }

    #[test]
    fn ephemeral_binds_localhost() {
        let cfg = ServerConfig::ephemeral();
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.bind_addr, "127.0.0.1");
    }
}
