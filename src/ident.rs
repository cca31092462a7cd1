//! Time-sortable identity generation.
//!
//! Identities are ULID-style: a 48-bit millisecond timestamp followed by
//! 80 bits of randomness, encoded as 26 Crockford base32 characters and
//! prefixed with a kind tag (`room-`, `user-`, `client-`).
//!
//! Calls within the same millisecond increment the previous random value
//! instead of redrawing, so output is strictly increasing (and therefore
//! lexicographically sortable) even under bursts.

use std::sync::Mutex;

/// Crockford base32 alphabet (no I, L, O, U).
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Mask selecting the low 80 random bits of the 128-bit value.
const RAND_MASK: u128 = (1u128 << 80) - 1;

/// What an identity names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Room,
    User,
    Client,
}

impl IdKind {
    /// Prefix tag used in the rendered identity string.
    pub fn prefix(self) -> &'static str {
        match self {
            IdKind::Room => "room",
            IdKind::User => "user",
            IdKind::Client => "client",
        }
    }
}

/// Generator state: the last timestamp observed and the random value
/// minted for it. Protected by a single mutex; all callers observe a
/// globally monotonic sequence.
struct GenState {
    last_ts_ms: u64,
    last_rand: u128,
}

/// Thread-safe generator for time-ordered identity strings.
pub struct IdentityGenerator {
    state: Mutex<GenState>,
}

impl IdentityGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GenState {
                last_ts_ms: 0,
                last_rand: 0,
            }),
        }
    }

    /// Mint a new identity of the given kind, e.g. `user-01JGW7...`.
    pub fn make(&self, kind: IdKind) -> String {
        let ts_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;

        let value = {
            let mut state = self.state.lock().expect("identity state poisoned");

            if ts_ms != state.last_ts_ms {
                // New millisecond: fresh 80-bit randomness.
                state.last_ts_ms = ts_ms;
                state.last_rand = random_80();
            } else {
                // Same millisecond: increment to stay strictly increasing.
                state.last_rand += 1;
            }

            ((ts_ms as u128) << 80) | (state.last_rand & RAND_MASK)
        };

        format!("{}-{}", kind.prefix(), encode_base32(value))
    }

    /// Convenience: `room-` identity.
    #[allow(dead_code)] // rooms are client-named today; minted ids are not yet used
    pub fn room_id(&self) -> String {
        self.make(IdKind::Room)
    }

    /// Convenience: `user-` identity.
    pub fn user_id(&self) -> String {
        self.make(IdKind::User)
    }

    /// Convenience: `client-` identity.
    pub fn client_id(&self) -> String {
        self.make(IdKind::Client)
    }
}

impl Default for IdentityGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Draw 80 random bits.
fn random_80() -> u128 {
    let hi: u16 = rand::random();
    let lo: u64 = rand::random();
    ((hi as u128) << 64) | lo as u128
}

/// Encode 128 bits as exactly 26 Crockford base32 characters.
///
/// Bits are consumed MSB-first in 5-bit groups; the final partial group
/// (3 bits) is left-shifted to pad, matching ULID's 26-character form.
fn encode_base32(value: u128) -> String {
    let mut out = String::with_capacity(26);
    for group in 0..25 {
        let shift = 123 - 5 * group;
        let index = ((value >> shift) & 0x1F) as usize;
        out.push(ALPHABET[index] as char);
    }
    // 25 * 5 = 125 bits consumed; pad the trailing 3 bits up to a group.
    let index = ((value & 0x07) << 2) as usize;
    out.push(ALPHABET[index] as char);
    out
}
