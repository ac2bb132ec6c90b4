// src/core/hash.rs

//! Content-addressing primitives: a fixed 64-byte SHA-512 digest that is the
//! sole identity of an [`Object`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;

/// The length in bytes of a SHA-512 digest.
pub const HASH_LENGTH: usize = 64;

/// A fixed 64-byte digest identifying an [`Object`] by content.
///
/// Equality and ordering are byte-wise, which makes `Hash` usable as a
/// `DashMap`/`BTreeMap` key and gives the ascending-hash upload order
/// the update protocol requires for free.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(#[serde(with = "hash_hex")] pub [u8; HASH_LENGTH]);

impl Hash {
    /// Computes the SHA-512 digest of `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; HASH_LENGTH];
        out.copy_from_slice(&digest);
        Hash(out)
    }

    /// Parses a lowercase hex-encoded hash, as used in the persisted
    /// sub-configuration JSON fragments.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; HASH_LENGTH];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Hash(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

mod hash_hex {
    use super::HASH_LENGTH;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; HASH_LENGTH], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; HASH_LENGTH], D::Error> {
        let s = String::deserialize(d)?;
        let mut out = [0u8; HASH_LENGTH];
        hex::decode_to_slice(&s, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}

/// An immutable, content-addressed byte string. Objects carry no metadata;
/// size is implicit in the byte length.
#[derive(Clone)]
pub struct Object(pub bytes::Bytes);

impl Object {
    /// Builds an `Object`, verifying that `bytes` actually hashes to `key`.
    /// The cache must never store a blob under the wrong key.
    pub fn verified(key: Hash, bytes: bytes::Bytes) -> Option<Self> {
        if Hash::of(&bytes) == key {
            Some(Object(bytes))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_of_is_deterministic_and_byte_wise_equal() {
        let a = Hash::of(b"hello world");
        let b = Hash::of(b"hello world");
        assert_eq!(a, b);
        let c = Hash::of(b"hello world!");
        assert_ne!(a, c);
    }

    #[test]
    fn hex_round_trips() {
        let h = Hash::of(b"some content");
        let hex = h.to_hex();
        assert_eq!(Hash::from_hex(&hex).unwrap(), h);
    }

    #[test]
    fn object_verified_rejects_mismatched_hash() {
        let real = Hash::of(b"abc");
        let bogus = Hash::of(b"xyz");
        assert!(Object::verified(real, bytes::Bytes::from_static(b"abc")).is_some());
        assert!(Object::verified(bogus, bytes::Bytes::from_static(b"abc")).is_none());
    }

    #[test]
    fn ordering_is_byte_wise() {
        let mut hashes = vec![Hash::of(b"b"), Hash::of(b"a"), Hash::of(b"c")];
        hashes.sort();
        assert!(hashes[0].0 <= hashes[1].0 && hashes[1].0 <= hashes[2].0);
    }
}
