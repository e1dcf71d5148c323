//! TCP server: owns the shared subsystems and the accept loop.
//!
//! Everything hangs off an explicit [`Server`] value rather than
//! process-wide globals, so tests boot as many instances as they want
//! on ephemeral ports.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info};

use cinder_core::Store;

use crate::broker::Broker;
use crate::client::ClientRegistry;
use crate::config::ServerConfig;
use crate::connection;
use crate::info::InfoSnapshot;
use crate::mux::OutputMux;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Counters the dispatcher and accept loop feed into INFO.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_received: AtomicU64,
    pub commands_processed: AtomicU64,
}

/// Shared state every connection handler sees.
#[derive(Debug)]
pub struct ServerContext {
    pub store: Store,
    pub broker: Broker,
    pub mux: OutputMux,
    pub clients: ClientRegistry,
    pub stats: ServerStats,
    pub started_at: Instant,
    /// The actually-bound port (resolved after an ephemeral bind).
    pub port: u16,
}

impl ServerContext {
    /// Captures the counters INFO renders.
    pub fn info_snapshot(&self) -> InfoSnapshot {
        let broker = self.broker.stats();
        InfoSnapshot {
            server_version: env!("CARGO_PKG_VERSION"),
            tcp_port: self.port,
            uptime_secs: self.started_at.elapsed().as_secs(),
            connected_clients: self.clients.count(),
            total_connections_received: self.stats.connections_received.load(Ordering::Relaxed),
            total_commands_processed: self.stats.commands_processed.load(Ordering::Relaxed),
            expired_keys: self.store.expired_total(),
            messages_published: broker.messages_published,
            pubsub_channels: broker.channels,
            keys: self.store.dbsize(),
            expires: self.store.expires_count(),
        }
    }
}

/// A bound, not-yet-running server.
pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Binds the listener and wires up the subsystems (including the
    /// multiplexer maintenance tasks and the broker's buffer flusher).
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr = format!("{}:{}", config.bind_addr, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let port = listener.local_addr()?.port();

        let mux = OutputMux::new(config.mux.clone());
        mux.spawn_maintenance();

        let broker = Broker::new(config.broker.clone(), mux.clone());
        broker.spawn_flusher();

        let ctx = Arc::new(ServerContext {
            store: Store::new(),
            broker,
            mux,
            clients: ClientRegistry::new(),
            stats: ServerStats::default(),
            started_at: Instant::now(),
            port,
        });

        info!(port, "listening");

        Ok(Self {
            listener,
            ctx,
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// The bound address (useful after an ephemeral bind).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared context, for tests and embedders.
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Runs the accept loop forever.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            self.accept_one().await?;
        }
    }

    /// Runs until `shutdown` resolves, then returns after closing the
    /// listener. In-flight connection tasks end when their sockets do.
    pub async fn run_until(self, shutdown: impl std::future::Future<Output = ()>) -> Result<(), ServerError> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = self.accept_one() => result?,
                _ = &mut shutdown => {
                    info!("shutdown signal received, closing listener");
                    return Ok(());
                }
            }
        }
    }

    async fn accept_one(&self) -> Result<(), ServerError> {
        let (stream, peer) = self.listener.accept().await?;
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.ctx
            .stats
            .connections_received
            .fetch_add(1, Ordering::Relaxed);
        debug!(conn = id, %peer, "accepted connection");

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            connection::handle(stream, ctx, id).await;
        });
        Ok(())
    }
}
