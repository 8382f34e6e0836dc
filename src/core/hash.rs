//! State Hashing for Snapshots
//!
//! Every full snapshot carries a hash of the canonical JSON encoding of the
//! game state so clients can check a rebuilt state against the server's.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Domain-separated SHA-256 hasher.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for game state snapshots.
    pub fn for_game_state() -> Self {
        Self::new(b"SKIRMISH_STATE_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Hash a serializable state at a given version.
///
/// serde_json emits struct fields in declaration order and the game state
/// only uses ordered maps, so the encoding is canonical.
pub fn hash_state<T: Serialize>(version: u64, state: &T) -> Result<StateHash, serde_json::Error> {
    let bytes = serde_json::to_vec(state)?;
    let mut hasher = StateHasher::for_game_state();
    hasher.update_u64(version);
    hasher.update_bytes(&bytes);
    Ok(hasher.finalize())
}

/// Hex form used on the wire.
pub fn hash_state_hex<T: Serialize>(version: u64, state: &T) -> Result<String, serde_json::Error> {
    hash_state(version, state).map(hex::encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_hash_determinism() {
        let mut state = BTreeMap::new();
        state.insert("b", 2);
        state.insert("a", 1);

        assert_eq!(hash_state(3, &state).unwrap(), hash_state(3, &state).unwrap());
    }

    #[test]
    fn test_version_is_part_of_hash() {
        let state = vec![1, 2, 3];
        assert_ne!(hash_state(1, &state).unwrap(), hash_state(2, &state).unwrap());
    }

    #[test]
    fn test_domain_separation() {
        let mut a = StateHasher::new(b"DOMAIN_A");
        let mut b = StateHasher::new(b"DOMAIN_B");
        a.update_bytes(&[1, 2, 3]);
        b.update_bytes(&[1, 2, 3]);
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_hex_length() {
        let hex = hash_state_hex(1, &"state").unwrap();
        assert_eq!(hex.len(), 64);
    }
}
