//! Entity key hashing.
//!
//! The public, client-visible "key" string is never stored as the primary
//! identity of an entity. Instead it is hashed to a 32-byte [`EntityKey`]
//! (SHA-256 of the UTF-8 bytes); the plaintext is retained only as the
//! `$key` synthetic string attribute (spec.md §6.1, §9).

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 32-byte canonical identity of an entity: SHA-256 of the plaintext key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(pub [u8; 32]);

impl EntityKey {
    /// Hashes a plaintext key string into its canonical [`EntityKey`].
    ///
    /// Collisions are astronomically unlikely; callers that need to
    /// distinguish "already exists" from "hash collision" should treat a
    /// collision as `ErrAlreadyExists` (spec.md §9).
    #[must_use]
    pub fn hash(plaintext: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(plaintext.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Returns the raw 32 bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-case hex representation, used as the map key in storage indexes.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a lower- or upper-case hex string back into an [`EntityKey`].
    pub fn from_hex(s: &str) -> Result<Self, KeyParseError> {
        let bytes = hex::decode(s).map_err(|_| KeyParseError::InvalidHex)?;
        if bytes.len() != 32 {
            return Err(KeyParseError::WrongLength(bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

/// Errors parsing an [`EntityKey`] from its hex wire representation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyParseError {
    #[error("invalid hex encoding")]
    InvalidHex,
    #[error("expected 32 bytes, got {0}")]
    WrongLength(usize),
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey({})", self.to_hex())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for EntityKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EntityKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(EntityKey::hash("alice"), EntityKey::hash("alice"));
    }

    #[test]
    fn hash_distinguishes_inputs() {
        assert_ne!(EntityKey::hash("alice"), EntityKey::hash("bob"));
    }

    #[test]
    fn hex_roundtrip() {
        let key = EntityKey::hash("widget-42");
        let hex = key.to_hex();
        assert_eq!(EntityKey::from_hex(&hex).unwrap(), key);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(matches!(
            EntityKey::from_hex("abcd"),
            Err(KeyParseError::WrongLength(2))
        ));
    }

    #[test]
    fn from_hex_rejects_invalid_hex() {
        assert!(matches!(
            EntityKey::from_hex("not-hex-at-all-zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"),
            Err(KeyParseError::InvalidHex)
        ));
    }

    #[test]
    fn json_roundtrip() {
        let key = EntityKey::hash("json-entity");
        let json = serde_json::to_string(&key).unwrap();
        let decoded: EntityKey = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, key);
    }
}
