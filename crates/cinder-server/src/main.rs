//! cinder-server binary: argument parsing, logging, signals.

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{debug, error, info};

use cinder_server::config::{resolve_port, ServerConfig};
use cinder_server::Server;

/// In-memory Redis-wire-compatible key/value store with pub/sub.
#[derive(Parser, Debug)]
#[command(name = "cinder-server", version, about)]
struct Args {
    /// TCP port to listen on. Falls back to $REDIS_PORT, then $PORT,
    /// then 6380.
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() -> ExitCode {
    // clap exits 2 on bad flags by default; we promise 0 for
    // help/version and 1 for anything invalid
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprint!("{e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder=info".into()),
        )
        .init();

    let port = match resolve_port(args.port) {
        Ok(port) => port,
        Err(msg) => {
            error!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    // accepted for deployment-environment compatibility; nothing in
    // the core changes behavior on it
    if let Ok(env) = std::env::var("NODE_ENV") {
        debug!(node_env = %env, "NODE_ENV set");
    }

    let config = ServerConfig {
        port,
        ..ServerConfig::default()
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(config: ServerConfig) -> Result<(), cinder_server::ServerError> {
    let server = Server::bind(config).await?;
    server.run_until(shutdown_signal()).await?;
    info!("bye");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = term.recv() => info!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received");
    }
}
