//! Per-connection session lifecycle.
//!
//! Each accepted connection runs through `Connecting → Open → Closing →
//! Closed`. After the WebSocket handshake, the connection is served by two
//! tasks: the session task itself runs the read loop, and a writer task
//! owns the sink exclusively, draining a bounded queue. The queue is the
//! only write path, so outbound frames go out in exact `send()` order with
//! at most one write in flight.
//!
//! The `Closed` transition is guarded by the state mutex: whichever side
//! loses the connection first (failed read, failed write, peer close, stop
//! request) performs unregistration and fires the disconnect event, and
//! the other side finds the session already closed.

use crate::chat::ChatState;
use crate::protocol::ServerEvent;
use crate::registry::{ConnectionId, SessionRegistry};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, WebSocket handshake in progress.
    Connecting,
    /// Handshake done; read loop and write queue are live.
    Open,
    /// Close requested; no new outbound frames are accepted.
    Closing,
    /// Terminal. Unregistered, disconnect event fired.
    Closed,
}

struct HandleInner {
    id: ConnectionId,
    client_id: String,
    tx: mpsc::Sender<Message>,
    state: Mutex<SessionState>,
    close_signal: Notify,
}

/// Cloneable reference to a live session: its identity, outbound queue,
/// and lifecycle state. Stored in the registry; cloned out for sends.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl SessionHandle {
    pub fn new(id: ConnectionId, client_id: String, tx: mpsc::Sender<Message>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                client_id,
                tx,
                state: Mutex::new(SessionState::Connecting),
                close_signal: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The `client-` identity minted for this connection.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().expect("session state poisoned")
    }

    /// Handshake completed.
    pub fn mark_open(&self) {
        let mut state = self.inner.state.lock().expect("session state poisoned");
        if *state == SessionState::Connecting {
            *state = SessionState::Open;
        }
    }

    /// Queue an event for delivery. Fire-and-forget: returns `false` if the
    /// session is no longer accepting writes or the queue is full (which
    /// marks the peer slow and requests close).
    pub fn send(&self, event: &ServerEvent) -> bool {
        self.send_frame(Message::text(event.to_json()))
    }

    /// Queue an already-encoded frame. Used by broadcasts so the payload is
    /// serialized once and shared across recipients.
    pub fn send_frame(&self, frame: Message) -> bool {
        match self.state() {
            SessionState::Open | SessionState::Connecting => {}
            SessionState::Closing | SessionState::Closed => return false,
        }

        match self.inner.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn = self.inner.id, "outbound queue full, closing slow session");
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Request a graceful close. Idempotent; the writer task emits the
    /// close frame.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().expect("session state poisoned");
            match *state {
                SessionState::Connecting | SessionState::Open => *state = SessionState::Closing,
                SessionState::Closing | SessionState::Closed => {}
            }
        }
        self.inner.close_signal.notify_one();
    }

    /// Take the `Closed` transition. Returns `true` only for the first
    /// caller; concurrent failure paths all funnel through here so the
    /// disconnect event fires exactly once.
    pub fn begin_closed(&self) -> bool {
        let mut state = self.inner.state.lock().expect("session state poisoned");
        if *state == SessionState::Closed {
            false
        } else {
            *state = SessionState::Closed;
            true
        }
    }

    /// Resolves when a close has been requested.
    async fn closed(&self) {
        self.inner.close_signal.notified().await;
    }
}

/// Serve one accepted TCP connection for its whole life.
pub async fn run(
    stream: TcpStream,
    id: ConnectionId,
    registry: Arc<SessionRegistry>,
    chat: Arc<ChatState>,
    send_queue: usize,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            // Never opened: no events fired, nothing registered.
            debug!(conn = id, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (tx, rx) = mpsc::channel(send_queue.max(1));
    let handle = SessionHandle::new(id, chat.mint_client_id(), tx);
    handle.mark_open();

    // Registered before the connect event, so the join broadcast can reach
    // this session too.
    registry.register(handle.clone());
    chat.on_connect(&handle);

    let (sink, mut frames) = ws.split();
    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        handle.clone(),
        Arc::clone(&registry),
        Arc::clone(&chat),
    ));

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => chat.on_message(&handle, text.as_str()),
            Ok(Message::Ping(payload)) => {
                handle.send_frame(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => {
                debug!(conn = id, "peer closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(conn = id, error = %e, "read failed");
                break;
            }
        }
    }

    disconnect(&handle, &registry, &chat);
    handle.close();
    let _ = writer.await;
}

/// Writer task: sole owner of the sink. Frames leave in queue order; a
/// failed write tears the session down just like a failed read.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<Message>,
    handle: SessionHandle,
    registry: Arc<SessionRegistry>,
    chat: Arc<ChatState>,
) {
    loop {
        tokio::select! {
            _ = handle.closed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!(conn = handle.id(), error = %e, "write failed");
                        disconnect(&handle, &registry, &chat);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
}

/// Idempotent teardown: first caller unregisters, then fires the
/// disconnect event. A concurrent broadcast may still look the session up
/// mid-removal; its lookup miss is an accepted race outcome.
fn disconnect(handle: &SessionHandle, registry: &SessionRegistry, chat: &ChatState) {
    if handle.begin_closed() {
        registry.unregister(handle.id());
        chat.on_disconnect(handle.id());
    }
}
