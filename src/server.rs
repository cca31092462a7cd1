//! WebSocket relay server: accept loop and graceful shutdown.
//!
//! Accepts TCP connections forever, minting a ConnectionId and spawning a
//! session task for each. A transient accept failure is logged and the
//! loop continues; only shutdown ends it, after which every registered
//! session is closed (abruptly; queued frames are not guaranteed to
//! flush).

use crate::chat::ChatState;
use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::session;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<SessionRegistry>,
    chat: Arc<ChatState>,
    connection_limit: Arc<Semaphore>,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let chat = Arc::new(ChatState::new(Arc::clone(&registry), config.debug_replies));
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            registry,
            chat,
            connection_limit,
            next_conn_id: AtomicU64::new(0),
        }
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    /// Failure to bind is the only fatal error.
    pub async fn run(
        &self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %listener.local_addr()?, "Server listening");
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let Ok(permit) = Arc::clone(&self.connection_limit).try_acquire_owned()
                        else {
                            debug!(peer = %addr, "Connection limit reached, refusing");
                            continue;
                        };

                        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
                        debug!(peer = %addr, conn = id, "New connection");

                        let registry = Arc::clone(&self.registry);
                        let chat = Arc::clone(&self.chat);
                        let send_queue = self.config.send_queue;

                        tokio::spawn(async move {
                            session::run(stream, id, registry, chat, send_queue).await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        // Transient; the accept loop must never stop on this.
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = &mut shutdown => {
                    info!(sessions = self.registry.len(), "Shutting down, closing sessions");
                    break;
                }
            }
        }

        for handle in self.registry.snapshot() {
            handle.close();
        }
    }

    /// Get a reference to the registry for testing
    #[cfg(test)]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get a reference to the chat state for testing
    #[cfg(test)]
    pub fn chat(&self) -> &Arc<ChatState> {
        &self.chat
    }
}
