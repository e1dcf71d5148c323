//! cinder-core: the in-memory keyspace.
//!
//! A string-only key/value store with per-key TTL handled by one-shot
//! timer tasks. The synchronous [`Keyspace`] owns the data; the
//! cloneable [`Store`] handle wraps it in a lock and arms the timers.

pub mod glob;
mod keyspace;
mod store;
pub mod time;

pub use keyspace::{Keyspace, ScanPage, TtlResult};
pub use store::Store;
