//! Content hashes.
//!
//! Wraps Blake3 with a strong type used for resource versions and node keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte Blake3 content hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Compute the Blake3 hash of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// The zero hash (sentinel value).
    pub const ZERO: Self = Self([0u8; 32]);
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for ContentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// A resource name made unique by a hash of its mesh, its name and
/// `values`: `<name>-<16 hex chars>`.
///
/// Used to store resources from several owners side by side when their
/// own names collide.
pub fn hashed_name(mesh: &str, name: &str, values: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [mesh, name].iter().chain(values) {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    format!("{}-{}", name, hex::encode(&hasher.finalize().as_bytes()[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = ContentHash::hash(b"mesh");
        let recovered = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, recovered);
    }

    #[test]
    fn test_from_hex_rejects_short_input() {
        assert!(ContentHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_display_is_prefix() {
        let hash = ContentHash::from_bytes([0xab; 32]);
        assert_eq!(hash.to_string(), "abababababababab");
    }

    #[test]
    fn test_hashed_name_depends_on_values() {
        let a = hashed_name("default", "web", &["zone-1"]);
        let b = hashed_name("default", "web", &["zone-2"]);
        assert!(a.starts_with("web-"));
        assert_eq!(a.len(), "web-".len() + 16);
        assert_ne!(a, b);
        assert_eq!(a, hashed_name("default", "web", &["zone-1"]));
        assert_ne!(a, hashed_name("other", "web", &["zone-1"]));
    }
}
