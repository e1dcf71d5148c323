//! Client registry backing the CLIENT commands and INFO counters.
//!
//! Holds one record per live connection, keyed by connection id. The
//! connection registers itself on accept and unregisters in its close
//! hook; nothing here owns the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use cinder_core::time;

use crate::ConnectionId;

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    /// Set via CLIENT SETNAME; empty until then.
    pub name: Option<Bytes>,
    pub connected_at_ms: u64,
}

/// Cheap-to-clone registry handle.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<DashMap<ConnectionId, ClientInfo>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnectionId, addr: SocketAddr) {
        self.clients.insert(
            id,
            ClientInfo {
                id,
                addr,
                name: None,
                connected_at_ms: time::now_ms(),
            },
        );
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.clients.remove(&id);
    }

    /// CLIENT SETNAME. Returns false for an unknown connection.
    pub fn set_name(&self, id: ConnectionId, name: Bytes) -> bool {
        match self.clients.get_mut(&id) {
            Some(mut info) => {
                info.name = Some(name);
                true
            }
            None => false,
        }
    }

    /// CLIENT GETNAME.
    pub fn name(&self, id: ConnectionId) -> Option<Bytes> {
        self.clients.get(&id).and_then(|info| info.name.clone())
    }

    /// Connected client count for INFO.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// CLIENT LIST: one line per connection, oldest first.
    pub fn list(&self) -> String {
        let mut infos: Vec<ClientInfo> = self.clients.iter().map(|e| e.value().clone()).collect();
        infos.sort_by_key(|c| c.id);

        let now = time::now_ms();
        let mut out = String::new();
        for c in infos {
            let name = c
                .name
                .as_ref()
                .map(|n| String::from_utf8_lossy(n).into_owned())
                .unwrap_or_default();
            let age = now.saturating_sub(c.connected_at_ms) / 1000;
            out.push_str(&format!(
                "id={} addr={} name={} age={} db=0\n",
                c.id, c.addr, name, age
            ));
        }
        out
    }
}
