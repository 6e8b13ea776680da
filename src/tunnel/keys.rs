//! WireGuard key handling
//!
//! Keys are 32-byte X25519 values. The configuration file accepts them in
//! either the Base64 form used by `wg(8)` (44 characters) or the lowercase hex
//! form used by the engine settings interface (64 characters).

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use boringtun::x25519::{PublicKey, StaticSecret};
use rand::RngCore;
use serde::{Serialize, Serializer};

/// Length of a WireGuard key in bytes
pub const KEY_LEN: usize = 32;

/// A 32-byte WireGuard key
///
/// `Debug` and `Display` never print the key bytes, so a `WgKey` can sit
/// inside configuration structs that get logged.
#[derive(Clone, PartialEq, Eq)]
pub struct WgKey([u8; KEY_LEN]);

impl WgKey {
    /// Wrap raw key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key from Base64 or hex
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason if the text is neither valid Base64
    /// nor valid hex, or does not decode to exactly 32 bytes.
    pub fn parse(text: &str) -> Result<Self, String> {
        decode_key(text.trim()).map(Self)
    }

    /// Raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Base64 encoding (`wg(8)` form)
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Lowercase hex encoding (engine settings form)
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Treat this key as a private key
    #[must_use]
    pub fn to_static_secret(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }

    /// Treat this key as a public key
    #[must_use]
    pub fn to_public_key(&self) -> PublicKey {
        PublicKey::from(self.0)
    }

    /// Derive the public key of this private key
    #[must_use]
    pub fn public_key(&self) -> Self {
        Self(*PublicKey::from(&self.to_static_secret()).as_bytes())
    }
}

impl fmt::Debug for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WgKey(<redacted>)")
    }
}

impl fmt::Display for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl Serialize for WgKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("<redacted>")
    }
}

/// Decode a Base64 or hex key to 32 bytes
fn decode_key(text: &str) -> Result<[u8; KEY_LEN], String> {
    let bytes = if text.len() == KEY_LEN * 2 && text.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(text).map_err(|e| format!("invalid hex: {e}"))?
    } else {
        BASE64
            .decode(text)
            .map_err(|e| format!("invalid Base64: {e}"))?
    };

    <[u8; KEY_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| format!("key must be {KEY_LEN} bytes, got {}", bytes.len()))
}

/// Generate a new random private key
///
/// The key is clamped according to X25519 requirements.
#[must_use]
pub fn generate_private_key() -> WgKey {
    let mut key_bytes = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key_bytes);

    let secret = StaticSecret::from(key_bytes);
    WgKey(secret.to_bytes())
}

/// Check that a key string decodes to exactly 32 bytes
#[must_use]
pub fn validate_key(text: &str) -> bool {
    WgKey::parse(text).is_ok()
}
