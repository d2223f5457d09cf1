//! Entity id generation, normalization, and validation.
//!
//! Ids are 8 symbols drawn from a 32-symbol alphabet that excludes the
//! visually confusable glyphs `i`, `l`, `o`, and `v`. Each symbol encodes
//! 5 bits of cryptographically random entropy. Normalization canonicalizes
//! the transcription mistakes a human is likely to make, so a hand-entered
//! id and a generated one compare equal after normalization.

use rand::rngs::OsRng;
use rand::RngCore;

/// 32 symbols, 5 bits each. Skips i, l, o, v.
pub const ID_ALPHABET: &[u8; 32] = b"abcdefghjkmnpqrstuwxyz0123456789";

/// Length of every entity id.
pub const ID_LEN: usize = 8;

/// Generate a random id. Not checked for uniqueness; prefer
/// [`crate::Store::generate_unique_id`] for ids that enter the store.
#[must_use]
pub fn generate_random_id() -> String {
    let mut raw = [0u8; 5];
    OsRng.fill_bytes(&mut raw);
    let bits = u64::from(raw[0]) << 32
        | u64::from(raw[1]) << 24
        | u64::from(raw[2]) << 16
        | u64::from(raw[3]) << 8
        | u64::from(raw[4]);
    let mut id = String::with_capacity(ID_LEN);
    for i in 0..ID_LEN {
        let symbol = (bits >> (35 - 5 * i)) & 0x1f;
        id.push(char::from(ID_ALPHABET[symbol as usize]));
    }
    id
}

/// Canonicalize a human-entered id: lowercase, map 1/l/i to `1`, o to `0`,
/// v to `u`, and strip everything outside `[a-z0-9]`. Idempotent.
#[must_use]
pub fn normalize_id(input: &str) -> String {
    input
        .chars()
        .filter_map(|c| {
            let c = c.to_ascii_lowercase();
            match c {
                'i' | 'l' => Some('1'),
                'o' => Some('0'),
                'v' => Some('u'),
                'a'..='z' | '0'..='9' => Some(c),
                _ => None,
            }
        })
        .collect()
}

/// Only normalized ids pass validation.
#[must_use]
pub fn validate_id(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| ID_ALPHABET.contains(&b))
}
