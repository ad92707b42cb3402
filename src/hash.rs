//! Content-addressed digest used to identify file content and step identity.

use sha2::{Digest, Sha256};
use std::fmt;

/// Fixed-width binary digest. The all-zero hash means "no file".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const NONE: Hash = Hash([0u8; 32]);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Streaming hash of a reader, used for large files so we never buffer the
    /// whole content in memory.
    pub fn of_reader(mut reader: impl std::io::Read) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// Combines several hashes into one, used to derive a step-hash from a
    /// command string plus its sorted input/output path lists.
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..")
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_all_zero() {
        assert!(Hash::NONE.is_none());
        assert!(!Hash::of_bytes(b"x").is_none());
    }

    #[test]
    fn same_bytes_same_hash() {
        assert_eq!(Hash::of_bytes(b"hello"), Hash::of_bytes(b"hello"));
        assert_ne!(Hash::of_bytes(b"hello"), Hash::of_bytes(b"world"));
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = Hash::combine([b"a".as_slice(), b"b".as_slice()]);
        let b = Hash::combine([b"b".as_slice(), b"a".as_slice()]);
        assert_ne!(a, b);
    }
}
