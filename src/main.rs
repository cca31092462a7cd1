//! chat-relay: a WebSocket chat relay with rooms
//!
//! Features:
//! - Persistent bidirectional connections over TCP/WebSocket
//! - Time-sortable identities for rooms, users, and connections
//! - Room-scoped fan-out of structured JSON chat events
//! - Configuration via CLI arguments or TOML file

mod chat;
mod config;
mod ident;
mod protocol;
mod registry;
mod server;
mod session;
mod user;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        send_queue = config.send_queue,
        debug_replies = config.debug_replies,
        "Starting chat-relay server"
    );

    let server = Server::new(config);
    server.run(shutdown_signal()).await
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
