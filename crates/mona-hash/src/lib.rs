#![deny(clippy::all)]

//! Content hashing for mona.
//!
//! Every durable identity in mona is the SHA-1 of a canonical byte spec,
//! rendered as 40 lowercase hex characters. This crate owns the [`Hash`]
//! newtype and the digesting entry points so that the rest of the workspace
//! never touches a raw digest.

use std::{
    fmt::{self, Debug, Display},
    io::{self, Read},
    sync::Arc,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Number of hex characters in a rendered hash.
pub const HASH_LEN: usize = 40;

/// Number of leading hex characters used for short display tags.
pub const TAG_LEN: usize = 6;

const READ_CHUNK: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("not a {HASH_LEN}-char lowercase hex hash: {0:?}")]
    InvalidHash(String),
}

/// A 40-hex-char SHA-1 digest of a canonical byte spec.
///
/// Cheap to clone; equality and ordering are by digest text.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(Arc<str>);

impl Hash {
    /// Digest a byte slice.
    pub fn of_bytes(content: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(content);
        Self::from_digest(hasher)
    }

    /// Digest a reader by streamed chunks, without buffering the content.
    pub fn of_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::from_digest(hasher))
    }

    /// Adopt an already-rendered hash, validating its shape.
    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        if s.len() != HASH_LEN || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(HashError::InvalidHash(s.to_string()));
        }
        Ok(Hash(Arc::from(s)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for labels and log lines.
    pub fn tag(&self) -> &str {
        &self.0[..TAG_LEN]
    }

    fn from_digest(hasher: Sha1) -> Self {
        Hash(Arc::from(hex::encode(hasher.finalize()).as_str()))
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.tag())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_are_stable() {
        let h = Hash::of_bytes(b"hello");
        assert_eq!(h.as_str(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(h.tag(), "aaf4c6");
    }

    #[test]
    fn reader_matches_bytes() {
        let content = vec![7u8; 3 * READ_CHUNK + 11];
        let by_bytes = Hash::of_bytes(&content);
        let by_reader = Hash::of_reader(&content[..]).unwrap();
        assert_eq!(by_bytes, by_reader);
    }

    #[test]
    fn from_hex_validates() {
        let h = Hash::of_bytes(b"x");
        assert_eq!(Hash::from_hex(h.as_str()).unwrap(), h);
        assert!(Hash::from_hex("abc").is_err());
        assert!(Hash::from_hex(&"A".repeat(40)).is_err());
    }

    #[test]
    fn serde_round_trip() {
        let h = Hash::of_bytes(b"spec");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(serde_json::from_str::<Hash>(&json).unwrap(), h);
    }
}
