//! Reversible identifier obfuscation.
//!
//! Identifiers sent to a peer are xored, nibble by nibble, with a key
//! unique to that member pairing, so two recipients never see the same
//! identifier for the same document. Applying the same key twice restores
//! the original identifier.

use cumulus_revs::hash_part;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Number of nibbles in a key.
pub const XOR_KEY_LEN: usize = 16;

/// A per-member obfuscation key: one nibble per hexadecimal position.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct XorKey([u8; XOR_KEY_LEN]);

impl XorKey {
    /// Draws 8 random bytes and expands them into 16 nibbles.
    pub fn generate() -> Self {
        let mut bytes = [0u8; XOR_KEY_LEN / 2];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let mut nibbles = [0u8; XOR_KEY_LEN];
        for (i, byte) in bytes.iter().enumerate() {
            nibbles[2 * i] = byte >> 4;
            nibbles[2 * i + 1] = byte & 0x0f;
        }
        bytes.zeroize();
        Self(nibbles)
    }

    /// The identity key.
    pub fn zero() -> Self {
        Self([0; XOR_KEY_LEN])
    }

    /// Builds a key from nibbles; the high bits of every byte are ignored.
    pub fn from_nibbles(mut nibbles: [u8; XOR_KEY_LEN]) -> Self {
        for nibble in &mut nibbles {
            *nibble &= 0x0f;
        }
        Self(nibbles)
    }

    pub fn as_nibbles(&self) -> &[u8] {
        &self.0
    }

    /// Rewrites an identifier with this key.
    pub fn apply(&self, id: &str) -> String {
        xor_id(id, &self.0)
    }
}

impl std::fmt::Debug for XorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("XorKey").field(&"[REDACTED]").finish()
    }
}

/// Xors every lowercase hexadecimal character of `id` with the nibble of
/// `key` at the same position (modulo the key length).
///
/// Any other character, uppercase hexadecimal included, is left untouched
/// but still consumes a key position. An empty key is the identity.
pub fn xor_id(id: &str, key: &[u8]) -> String {
    if key.is_empty() {
        return id.to_string();
    }
    id.chars()
        .enumerate()
        .map(|(i, c)| match lower_hex_value(c) {
            Some(value) => hex_char(value ^ (key[i % key.len()] & 0x0f)),
            None => c,
        })
        .collect()
}

/// A deterministic alternate identifier for the fork of a conflicting
/// document, derived from the revision that lost.
pub fn conflict_id(id: &str, rev: &str) -> String {
    let Some(hash) = hash_part(rev) else {
        return id.to_string();
    };
    let key: Vec<u8> = hash.chars().map(|c| lower_hex_value(c).unwrap_or(0)).collect();
    xor_id(id, &key)
}

fn lower_hex_value(c: char) -> Option<u8> {
    match c {
        '0'..='9' => Some(c as u8 - b'0'),
        'a'..='f' => Some(c as u8 - b'a' + 10),
        _ => None,
    }
}

fn hex_char(value: u8) -> char {
    char::from_digit(u32::from(value), 16).unwrap_or('0')
}
