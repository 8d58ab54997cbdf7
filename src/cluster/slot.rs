//! Redis Cluster slot calculation.
//!
//! Redis Cluster uses CRC16 to map keys to slots (0-16383).
//! This module provides utilities for calculating slot numbers from keys.

use crc::{Crc, CRC_16_XMODEM};

use crate::{Error, Result};

/// Number of hash slots in Redis Cluster.
pub const SLOT_COUNT: u16 = 16384;

/// CRC-16/XMODEM algorithm used by Redis.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the Redis Cluster slot for a given key.
///
/// If the key contains `{...}` with a non-empty body, only the content
/// inside the first such pair is hashed (hash tags).
///
/// # Examples
///
/// ```
/// use slotlink::key_slot;
///
/// assert_eq!(key_slot("somekey"), 11058);
/// assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
/// ```
pub fn key_slot(key: impl AsRef<[u8]>) -> u16 {
    let hash_key = extract_hash_tag(key.as_ref());
    CRC16.checksum(hash_key) % SLOT_COUNT
}

/// Calculates the common slot of several keys.
///
/// # Errors
///
/// Returns [`Error::CrossSlot`] if the keys hash to different slots and
/// [`Error::InvalidArgument`] if no key is given.
pub fn keys_slot<I, K>(keys: I) -> Result<u16>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    let mut slot = None;
    for key in keys {
        let current = key_slot(key);
        match slot {
            None => slot = Some(current),
            Some(s) if s != current => return Err(Error::CrossSlot),
            Some(_) => {}
        }
    }
    slot.ok_or_else(|| Error::InvalidArgument {
        message: "at least one key is required".to_string(),
    })
}

/// Extracts the hash tag from a key.
///
/// - `{user1000}.following` → `user1000`
/// - `foo{bar}{baz}` → `bar`
/// - `foo{}{bar}` → whole key (first pair is empty)
/// - `foo{bar` → whole key
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}
