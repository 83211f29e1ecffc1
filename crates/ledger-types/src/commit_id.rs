use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Content-addressed identifier of a commit.
///
/// A `CommitId` is the domain-separated BLAKE3 hash of a commit's serialized
/// form. The all-zero id is reserved for the synthetic first commit of every
/// page, which is never serialized.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId([u8; 32]);

impl CommitId {
    /// Id of the first commit: every page starts from it.
    pub const FIRST: Self = Self([0u8; 32]);

    /// Create a `CommitId` from a pre-computed hash.
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Returns `true` if this is the reserved first commit id.
    pub fn is_first(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Parse from raw bytes, which must be exactly 32 long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        if bytes.len() != 32 {
            return Err(TypeError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", self.short_hex())
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for CommitId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for CommitId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_is_all_zeros() {
        assert!(CommitId::FIRST.is_first());
        assert_eq!(CommitId::FIRST.as_bytes(), &[0u8; 32]);
        assert!(!CommitId::from_hash([1; 32]).is_first());
    }

    #[test]
    fn hex_roundtrip() {
        let id = CommitId::from_hash([0xab; 32]);
        let parsed = CommitId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn from_slice_rejects_bad_length() {
        let err = CommitId::from_slice(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 32,
                actual: 3
            }
        );
    }

    #[test]
    fn debug_uses_short_hex() {
        let id = CommitId::from_hash([0x12; 32]);
        assert_eq!(format!("{id:?}"), "CommitId(12121212)");
    }

    #[test]
    fn ordering_is_bytewise() {
        assert!(CommitId::from_hash([0; 32]) < CommitId::from_hash([1; 32]));
    }
}
