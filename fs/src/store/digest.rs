//! Content digests.
//!
//! Objects are addressed by a fixed-width hexadecimal digest of their
//! bytes. The algorithm is chosen when a backend is initialized, recorded
//! in the format marker, and never mixed within one backend.

use sha2::Digest as _;

use crate::error::{CowError, CowResult};

// ============================================================================
// Constants
// ============================================================================

/// Hex characters in a digest (256-bit hash).
pub const DIGEST_HEX_LEN: usize = 64;

/// Shard prefix length for the object store layout.
pub const SHARD_PREFIX_LEN: usize = 2;

// ============================================================================
// Digest Algorithm
// ============================================================================

/// Content hash algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestAlgo {
    /// SHA-256 (default)
    Sha256,
    /// BLAKE3 (faster alternative)
    Blake3,
}

impl DigestAlgo {
    /// Name as recorded in the backend format marker.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    /// Parse a marker value.
    pub fn from_str(s: &str) -> CowResult<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            _ => Err(CowError::Corruption(format!(
                "unknown digest algorithm '{s}'"
            ))),
        }
    }

    /// Hash a byte sequence.
    pub fn hash(&self, bytes: &[u8]) -> Digest {
        let hex = match self {
            Self::Sha256 => hex::encode(sha2::Sha256::digest(bytes)),
            Self::Blake3 => blake3::hash(bytes).to_hex().to_string(),
        };
        Digest(hex)
    }

    /// Digest of the empty byte sequence.
    ///
    /// Every freshly created file points at this object, so `read` on a
    /// new file always succeeds.
    pub fn empty(&self) -> Digest {
        self.hash(&[])
    }
}

impl Default for DigestAlgo {
    fn default() -> Self {
        Self::Sha256
    }
}

impl std::fmt::Display for DigestAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Digest
// ============================================================================

/// A validated lowercase-hex content digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a hex string.
    pub fn from_hex(s: &str) -> CowResult<Self> {
        if s.len() != DIGEST_HEX_LEN
            || !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(CowError::Corruption(format!("malformed digest '{s}'")));
        }
        Ok(Self(s.to_owned()))
    }

    /// Hex form.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First two hex characters: the shard subdirectory name.
    #[inline]
    pub fn shard(&self) -> &str {
        &self.0[..SHARD_PREFIX_LEN]
    }

    /// Remaining hex characters: the blob file name within the shard.
    #[inline]
    pub fn rest(&self) -> &str {
        &self.0[SHARD_PREFIX_LEN..]
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_empty() {
        let d = DigestAlgo::Sha256.empty();
        assert_eq!(
            d.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_blake3_empty() {
        let d = DigestAlgo::Blake3.empty();
        assert_eq!(
            d.as_str(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn test_same_content_same_digest() {
        let a = DigestAlgo::Sha256.hash(b"hello");
        let b = DigestAlgo::Sha256.hash(b"hello");
        let c = DigestAlgo::Sha256.hash(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_shard_split() {
        let d = DigestAlgo::Sha256.hash(b"x");
        assert_eq!(d.shard().len(), 2);
        assert_eq!(d.rest().len(), DIGEST_HEX_LEN - 2);
        assert_eq!(format!("{}{}", d.shard(), d.rest()), d.as_str());
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(Digest::from_hex("abc").is_err());
        assert!(Digest::from_hex(&"Z".repeat(64)).is_err());
        let valid = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert!(Digest::from_hex(valid).is_ok());
    }

    #[test]
    fn test_algo_roundtrip() {
        assert_eq!(DigestAlgo::from_str("sha256").unwrap(), DigestAlgo::Sha256);
        assert_eq!(DigestAlgo::from_str("blake3").unwrap(), DigestAlgo::Blake3);
        assert!(DigestAlgo::from_str("md5").is_err());
    }
}
