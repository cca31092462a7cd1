//! Connected user records.
//!
//! One `User` exists per registered connection. Display names and room
//! names are sanitized on every write: trimmed, length-capped (names),
//! and defaulted when empty.

use std::time::Instant;

/// Maximum display name length after trimming.
pub const MAX_NAME_LEN: usize = 24;

/// Fallback display name for an empty or whitespace-only input.
pub const DEFAULT_NAME: &str = "guest";

/// Room every connection starts in.
pub const DEFAULT_ROOM: &str = "lobby";

/// A connected chat user.
#[derive(Debug, Clone)]
pub struct User {
    user_id: String,
    name: String,
    room: String,
    connected_at: Instant,
    last_seen: Instant,
}

impl User {
    /// Create a user from a freshly minted identity.
    pub fn new(user_id: String, name: &str, room: &str) -> Self {
        let now = Instant::now();
        Self {
            user_id,
            name: sanitize_name(name),
            room: sanitize_room(room),
            connected_at: now,
            last_seen: now,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Replace the display name, sanitizing the input.
    pub fn set_name(&mut self, name: &str) {
        self.name = sanitize_name(name);
    }

    /// Move the user to another room, sanitizing the input.
    pub fn set_room(&mut self, room: &str) {
        self.room = sanitize_room(room);
    }

    /// Record activity on the connection.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// Trim, cap at [`MAX_NAME_LEN`] characters, re-trim (truncation can expose
/// trailing whitespace), and default empty input to [`DEFAULT_NAME`].
pub fn sanitize_name(input: &str) -> String {
    let mut name = input.trim().to_string();

    if name.chars().count() > MAX_NAME_LEN {
        name = name.chars().take(MAX_NAME_LEN).collect();
        name = name.trim_end().to_string();
    }

    if name.is_empty() {
        name = DEFAULT_NAME.to_string();
    }
    name
}

/// Trim and default empty input to [`DEFAULT_ROOM`].
pub fn sanitize_room(input: &str) -> String {
    let room = input.trim();
    if room.is_empty() {
        DEFAULT_ROOM.to_string()
    } else {
        room.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_trimmed() {
        assert_eq!(sanitize_name("  alice  "), "alice");
    }

    #[test]
    fn test_whitespace_name_defaults() {
        assert_eq!(sanitize_name("   "), "guest");
        assert_eq!(sanitize_name(""), "guest");
        assert_eq!(sanitize_name("\t\r\n"), "guest");
    }

    #[test]
    fn test_long_name_truncated() {
        let name = "x".repeat(30);
        assert_eq!(sanitize_name(&name), "x".repeat(24));
    }

    #[test]
    fn test_truncation_retrims() {
        // 23 chars + spaces: the cap lands inside the whitespace run.
        let input = format!("{} tail", "y".repeat(23));
        let got = sanitize_name(&input);
        assert_eq!(got, "y".repeat(23));
    }

    #[test]
    fn test_room_defaults_to_lobby() {
        assert_eq!(sanitize_room("  "), "lobby");
        assert_eq!(sanitize_room("games "), "games");
    }

    #[test]
    fn test_user_lifecycle() {
        let mut user = User::new("user-X".into(), "  bob ", "");
        assert_eq!(user.user_id(), "user-X");
        assert_eq!(user.name(), "bob");
        assert_eq!(user.room(), "lobby");
        assert_eq!(user.connected_at(), user.last_seen());

        user.set_room("games");
        assert_eq!(user.room(), "games");

        user.set_name("");
        assert_eq!(user.name(), "guest");

        user.touch();
        assert!(user.last_seen() >= user.connected_at());
    }
}
