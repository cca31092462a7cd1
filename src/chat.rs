//! Application layer: user records, event dispatch, room broadcast.
//!
//! Consumes connect/disconnect/message events from sessions, keeps one
//! [`User`] per registered connection, and fans room-scoped events out
//! through the registry. A room is nothing but the set of connected users
//! sharing a `room` value.

use crate::ident::IdentityGenerator;
use crate::protocol::{ClientFrame, ServerEvent};
use crate::registry::{ConnectionId, SessionRegistry};
use crate::session::SessionHandle;
use crate::user::{User, DEFAULT_ROOM};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

/// Welcome text sent to every new connection.
const WELCOME_TEXT: &str = "welcome to chat-relay";

/// Error text for a frame from a connection with no user record (a
/// disconnect raced an in-flight message).
const UNKNOWN_CLIENT: &str = "unknown client";

/// Shared chat state and dispatch logic.
pub struct ChatState {
    registry: Arc<SessionRegistry>,
    idgen: IdentityGenerator,
    users: RwLock<HashMap<ConnectionId, User>>,
    debug_replies: bool,
}

impl ChatState {
    pub fn new(registry: Arc<SessionRegistry>, debug_replies: bool) -> Self {
        Self {
            registry,
            idgen: IdentityGenerator::new(),
            users: RwLock::new(HashMap::new()),
            debug_replies,
        }
    }

    /// Mint a `client-` identity for a new connection.
    pub fn mint_client_id(&self) -> String {
        self.idgen.client_id()
    }

    /// Number of connections with a user record (for tests).
    #[cfg(test)]
    pub fn user_count(&self) -> usize {
        self.users.read().expect("user map poisoned").len()
    }

    /// A session finished its handshake: create its user, welcome it, and
    /// announce it to the lobby (the new session included; it is already
    /// registered when the broadcast runs).
    pub fn on_connect(&self, handle: &SessionHandle) {
        let user = User::new(
            self.idgen.user_id(),
            &format!("guest-{}", handle.id()),
            DEFAULT_ROOM,
        );
        let user_id = user.user_id().to_string();
        let name = user.name().to_string();

        {
            let mut users = self.users.write().expect("user map poisoned");
            users.insert(handle.id(), user);
        }
        debug!(conn = handle.id(), user = %user_id, "user connected");

        handle.send(&ServerEvent::System {
            text: WELCOME_TEXT.to_string(),
            room_id: DEFAULT_ROOM.to_string(),
            user_id: Some(user_id.clone()),
        });

        self.broadcast(
            DEFAULT_ROOM,
            &ServerEvent::System {
                text: format!("{name} joined {DEFAULT_ROOM}"),
                room_id: DEFAULT_ROOM.to_string(),
                user_id: Some(user_id),
            },
        );
    }

    /// A session reached `Closed`: drop its user and announce the
    /// departure to the room it was last in. The session itself is already
    /// unregistered, so the broadcast cannot reach it.
    pub fn on_disconnect(&self, id: ConnectionId) {
        let user = {
            let mut users = self.users.write().expect("user map poisoned");
            users.remove(&id)
        };

        // Absent when the handshake never completed; nothing to announce.
        let Some(user) = user else { return };
        debug!(conn = id, user = %user.user_id(), "user disconnected");

        self.broadcast(
            user.room(),
            &ServerEvent::System {
                text: format!("{} left {}", user.name(), user.room()),
                room_id: user.room().to_string(),
                user_id: Some(user.user_id().to_string()),
            },
        );
    }

    /// Dispatch one inbound text frame from a session.
    pub fn on_message(&self, handle: &SessionHandle, raw: &str) {
        trace!(conn = handle.id(), len = raw.len(), "frame received");

        let frame = match ClientFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                handle.send(&ServerEvent::error(e));
                return;
            }
        };

        match frame {
            ClientFrame::Join { user, room } => self.handle_join(handle, user, room),
            ClientFrame::Msg { text } => self.handle_msg(handle, text),
        }
    }

    fn handle_join(&self, handle: &SessionHandle, user: Option<String>, room: Option<String>) {
        let Some((user_id, name, room_id)) = self.update_user(handle.id(), |record| {
            if let Some(name) = &user {
                record.set_name(name);
            }
            if let Some(room) = &room {
                record.set_room(room);
            }
        }) else {
            handle.send(&ServerEvent::Error {
                text: UNKNOWN_CLIENT.to_string(),
            });
            return;
        };

        if self.debug_replies {
            handle.send(&ServerEvent::DebugJoin {
                client_id: handle.client_id().to_string(),
                user_id: user_id.clone(),
                name: name.clone(),
                room_id: room_id.clone(),
            });
        }

        self.broadcast(
            &room_id,
            &ServerEvent::System {
                text: format!("{name} joined {room_id}"),
                room_id: room_id.clone(),
                user_id: Some(user_id),
            },
        );
    }

    fn handle_msg(&self, handle: &SessionHandle, text: String) {
        let Some((user_id, name, room_id)) = self.update_user(handle.id(), |_| {}) else {
            handle.send(&ServerEvent::Error {
                text: UNKNOWN_CLIENT.to_string(),
            });
            return;
        };

        if self.debug_replies {
            handle.send(&ServerEvent::DebugMsg {
                client_id: handle.client_id().to_string(),
                user_id: user_id.clone(),
                name: name.clone(),
                room_id: room_id.clone(),
                text: text.clone(),
            });
        }

        self.broadcast(
            &room_id,
            &ServerEvent::Msg {
                from: name,
                user_id,
                client_id: handle.client_id().to_string(),
                room_id: room_id.clone(),
                text,
            },
        );
    }

    /// Apply a mutation to a user record and return the (user_id, name,
    /// room) triple afterwards, or `None` if the connection has no record.
    /// Also refreshes `last_seen`.
    fn update_user<F>(&self, id: ConnectionId, apply: F) -> Option<(String, String, String)>
    where
        F: FnOnce(&mut User),
    {
        let mut users = self.users.write().expect("user map poisoned");
        let record = users.get_mut(&id)?;
        apply(record);
        record.touch();
        Some((
            record.user_id().to_string(),
            record.name().to_string(),
            record.room().to_string(),
        ))
    }

    /// Send an event to every connected session whose user is in `room`.
    /// The payload is serialized once; the user-map lock is released before
    /// any registry lookup or send. A lookup miss means the session
    /// disconnected mid-broadcast and is skipped.
    fn broadcast(&self, room: &str, event: &ServerEvent) {
        let members: Vec<ConnectionId> = {
            let users = self.users.read().expect("user map poisoned");
            users
                .iter()
                .filter(|(_, user)| user.room() == room)
                .map(|(id, _)| *id)
                .collect()
        };

        let frame = Message::text(event.to_json());
        let mut delivered = 0usize;
        for id in &members {
            if let Some(handle) = self.registry.get(*id) {
                if handle.send_frame(frame.clone()) {
                    delivered += 1;
                }
            }
        }
        trace!(room, members = members.len(), delivered, "broadcast");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Client {
        handle: SessionHandle,
        rx: mpsc::Receiver<Message>,
    }

    impl Client {
        /// Next queued event, or None when the queue is empty.
        fn next(&mut self) -> Option<ServerEvent> {
            match self.rx.try_recv() {
                Ok(Message::Text(text)) => {
                    Some(serde_json::from_str(text.as_str()).expect("valid event json"))
                }
                Ok(other) => panic!("unexpected frame {other:?}"),
                Err(_) => None,
            }
        }

        fn drain(&mut self) {
            while self.next().is_some() {}
        }
    }

    fn connect(chat: &ChatState, registry: &Arc<SessionRegistry>, id: ConnectionId) -> Client {
        let (tx, rx) = mpsc::channel(32);
        let handle = SessionHandle::new(id, chat.mint_client_id(), tx);
        handle.mark_open();
        registry.register(handle.clone());
        chat.on_connect(&handle);
        Client { handle, rx }
    }

    fn setup(debug_replies: bool) -> (Arc<ChatState>, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        let chat = Arc::new(ChatState::new(Arc::clone(&registry), debug_replies));
        (chat, registry)
    }

    #[test]
    fn test_connect_welcomes_then_announces() {
        let (chat, registry) = setup(false);
        let mut client = connect(&chat, &registry, 1);

        match client.next().unwrap() {
            ServerEvent::System { text, room_id, user_id } => {
                assert_eq!(text, WELCOME_TEXT);
                assert_eq!(room_id, "lobby");
                assert!(user_id.unwrap().starts_with("user-"));
            }
            other => panic!("expected welcome, got {other:?}"),
        }

        match client.next().unwrap() {
            ServerEvent::System { text, room_id, .. } => {
                assert_eq!(text, "guest-1 joined lobby");
                assert_eq!(room_id, "lobby");
            }
            other => panic!("expected join notice, got {other:?}"),
        }

        assert_eq!(chat.user_count(), 1);
    }

    #[test]
    fn test_room_isolation() {
        let (chat, registry) = setup(false);
        let mut a = connect(&chat, &registry, 1);
        let mut b = connect(&chat, &registry, 2);
        let mut c = connect(&chat, &registry, 3);

        chat.on_message(&c.handle, r#"{"type":"join","user":"carol","room":"games"}"#);
        a.drain();
        b.drain();
        c.drain();

        chat.on_message(&a.handle, r#"{"type":"msg","text":"hi"}"#);

        for client in [&mut a, &mut b] {
            match client.next().unwrap() {
                ServerEvent::Msg { from, room_id, text, .. } => {
                    assert_eq!(from, "guest-1");
                    assert_eq!(room_id, "lobby");
                    assert_eq!(text, "hi");
                }
                other => panic!("expected msg, got {other:?}"),
            }
        }
        assert!(c.next().is_none(), "games room must not see lobby traffic");
    }

    #[test]
    fn test_join_updates_name_and_room() {
        let (chat, registry) = setup(false);
        let mut a = connect(&chat, &registry, 1);
        a.drain();

        chat.on_message(&a.handle, r#"{"type":"join","user":"  alice  ","room":"games"}"#);
        match a.next().unwrap() {
            ServerEvent::System { text, room_id, .. } => {
                assert_eq!(text, "alice joined games");
                assert_eq!(room_id, "games");
            }
            other => panic!("expected join notice, got {other:?}"),
        }
    }

    #[test]
    fn test_whitespace_name_becomes_guest() {
        let (chat, registry) = setup(false);
        let mut a = connect(&chat, &registry, 1);
        a.drain();

        chat.on_message(&a.handle, r#"{"type":"join","user":"   "}"#);
        match a.next().unwrap() {
            ServerEvent::System { text, .. } => assert_eq!(text, "guest joined lobby"),
            other => panic!("expected join notice, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_text_error_is_sender_only() {
        let (chat, registry) = setup(false);
        let mut a = connect(&chat, &registry, 1);
        let mut b = connect(&chat, &registry, 2);
        a.drain();
        b.drain();

        chat.on_message(&a.handle, r#"{"type":"msg"}"#);
        assert_eq!(
            a.next().unwrap(),
            ServerEvent::Error {
                text: "missing text".into()
            }
        );
        assert!(b.next().is_none(), "error replies must not broadcast");
    }

    #[test]
    fn test_malformed_frames_get_error_replies() {
        let (chat, registry) = setup(false);
        let mut a = connect(&chat, &registry, 1);
        a.drain();

        for (raw, expected) in [
            ("not json", "invalid json"),
            (r#"{"user":"x"}"#, "missing type"),
            (r#"{"type":"dance"}"#, "unknown type"),
        ] {
            chat.on_message(&a.handle, raw);
            assert_eq!(
                a.next().unwrap(),
                ServerEvent::Error {
                    text: expected.into()
                }
            );
        }
        assert_eq!(chat.user_count(), 1);
    }

    #[test]
    fn test_debug_replies_precede_broadcast() {
        let (chat, registry) = setup(true);
        let mut a = connect(&chat, &registry, 1);
        a.drain();

        chat.on_message(&a.handle, r#"{"type":"msg","text":"hi"}"#);
        assert!(matches!(a.next().unwrap(), ServerEvent::DebugMsg { .. }));
        assert!(matches!(a.next().unwrap(), ServerEvent::Msg { .. }));

        chat.on_message(&a.handle, r#"{"type":"join","user":"alice"}"#);
        assert!(matches!(a.next().unwrap(), ServerEvent::DebugJoin { .. }));
        assert!(matches!(a.next().unwrap(), ServerEvent::System { .. }));
    }

    #[test]
    fn test_message_without_user_record() {
        let (chat, registry) = setup(false);

        // Registered session, but its user record is already gone: the
        // disconnect race window.
        let (tx, rx) = mpsc::channel(32);
        let handle = SessionHandle::new(9, chat.mint_client_id(), tx);
        handle.mark_open();
        registry.register(handle.clone());
        let mut ghost = Client { handle, rx };

        chat.on_message(&ghost.handle, r#"{"type":"msg","text":"hi"}"#);
        assert_eq!(
            ghost.next().unwrap(),
            ServerEvent::Error {
                text: UNKNOWN_CLIENT.into()
            }
        );
    }

    #[test]
    fn test_disconnect_announces_last_known_room() {
        let (chat, registry) = setup(false);
        let mut a = connect(&chat, &registry, 1);
        let mut b = connect(&chat, &registry, 2);

        chat.on_message(&a.handle, r#"{"type":"join","user":"alice","room":"games"}"#);
        chat.on_message(&b.handle, r#"{"type":"join","room":"games"}"#);
        a.drain();
        b.drain();

        // Session 1 reaches Closed: unregister first, then the event.
        registry.unregister(1);
        chat.on_disconnect(1);

        assert_eq!(chat.user_count(), 1);
        match b.next().unwrap() {
            ServerEvent::System { text, room_id, .. } => {
                assert_eq!(text, "alice left games");
                assert_eq!(room_id, "games");
            }
            other => panic!("expected leave notice, got {other:?}"),
        }
        assert!(a.next().is_none(), "departed session must not hear itself");

        // Second disconnect for the same id is a no-op.
        chat.on_disconnect(1);
        assert!(b.next().is_none());
    }
}
