//! cinder-server: the network-facing half of cinder.
//!
//! Accepts RESP clients over TCP and wires each connection to the
//! keyspace, the pub/sub broker, and a per-connection output
//! multiplexer slot. The [`Server`] type owns everything, so tests boot
//! as many instances as they like on ephemeral ports.

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod info;
pub mod mux;
pub mod server;

pub use config::{BrokerConfig, MuxConfig, ServerConfig};
pub use server::{Server, ServerError};

/// Opaque per-connection identity. Assigned once on accept and used as
/// the key everywhere connections are referenced (multiplexer slots,
/// broker membership, client registry), so no component holds the
/// connection itself.
pub type ConnectionId = u64;
