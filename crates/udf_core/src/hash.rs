//! Content hashes of function sources.
//!
//! Uses BLAKE3 so a redefinition with identical source can be detected
//! without comparing module bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A BLAKE3 hash (256 bits / 32 bytes) of a module source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceHash([u8; 32]);

impl SourceHash {
    /// Compute BLAKE3 hash of a source
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes as hex, for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for SourceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let a = SourceHash::compute(b"(module)");
        let b = SourceHash::compute(b"(module)");
        assert_eq!(a, b);
        assert_ne!(a, SourceHash::compute(b"(module )"));
    }

    #[test]
    fn test_hash_hex() {
        let h = SourceHash::compute(b"abc");
        assert_eq!(h.to_hex().len(), 64);
        assert_eq!(h.short().len(), 16);
        assert!(h.to_hex().starts_with(&h.short()));
    }
}
