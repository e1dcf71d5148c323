//! INFO reply rendering.
//!
//! Produces the familiar sectioned key:value block. Fields clients
//! commonly probe (version, mode, role, keyspace) are always present;
//! counters are real where the server already tracks them, synthetic
//! where it doesn't (memory, CPU). The full block is returned
//! regardless of which section was requested; clients tolerate the
//! extra sections.

use std::fmt::Write;

/// Redis version advertised to compatibility probes. Synthetic: the
/// wire behavior tracks this protocol generation, not a real Redis
/// build.
const COMPAT_VERSION: &str = "7.2.0";

/// Everything the renderer needs, captured at request time.
#[derive(Debug, Clone, Default)]
pub struct InfoSnapshot {
    pub server_version: &'static str,
    pub tcp_port: u16,
    pub uptime_secs: u64,
    pub connected_clients: usize,
    pub total_connections_received: u64,
    pub total_commands_processed: u64,
    pub expired_keys: u64,
    pub messages_published: u64,
    pub pubsub_channels: usize,
    pub keys: usize,
    pub expires: usize,
}

/// Renders the full INFO block. Lines use CRLF like Redis.
pub fn render(s: &InfoSnapshot) -> String {
    let mut out = String::with_capacity(768);

    let w = &mut out;
    let _ = write!(
        w,
        "# Server\r\n\
         redis_version:{COMPAT_VERSION}\r\n\
         cinder_version:{}\r\n\
         redis_mode:standalone\r\n\
         arch_bits:64\r\n\
         process_id:{}\r\n\
         tcp_port:{}\r\n\
         uptime_in_seconds:{}\r\n\
         uptime_in_days:{}\r\n\
         \r\n",
        s.server_version,
        std::process::id(),
        s.tcp_port,
        s.uptime_secs,
        s.uptime_secs / 86_400,
    );

    let _ = write!(
        w,
        "# Clients\r\n\
         connected_clients:{}\r\n\
         blocked_clients:0\r\n\
         \r\n",
        s.connected_clients,
    );

    // memory-only server with no allocator hooks: report a stable
    // synthetic figure rather than a misleading one
    let _ = write!(
        w,
        "# Memory\r\n\
         used_memory:1048576\r\n\
         used_memory_human:1.00M\r\n\
         maxmemory:0\r\n\
         \r\n",
    );

    let _ = write!(
        w,
        "# Stats\r\n\
         total_connections_received:{}\r\n\
         total_commands_processed:{}\r\n\
         expired_keys:{}\r\n\
         pubsub_channels:{}\r\n\
         total_messages_published:{}\r\n\
         \r\n",
        s.total_connections_received,
        s.total_commands_processed,
        s.expired_keys,
        s.pubsub_channels,
        s.messages_published,
    );

    let _ = write!(
        w,
        "# Replication\r\n\
         role:master\r\n\
         connected_slaves:0\r\n\
         \r\n",
    );

    let _ = write!(
        w,
        "# CPU\r\n\
         used_cpu_sys:0.00\r\n\
         used_cpu_user:0.00\r\n\
         \r\n",
    );

    let _ = write!(
        w,
        "# Keyspace\r\n\
         db0:keys={},expires={},avg_ttl=0\r\n",
        s.keys, s.expires,
    );

    out
}
