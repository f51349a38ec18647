//! Collective Crypto -- device keys, Schnorr-family signatures, hashing.
//!
//! Signatures are Ed25519 (ring). Hashes are SHA-256. Public keys and
//! signatures travel as base64 strings inside JSON payloads.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::signature::{UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub mod keys;

pub use keys::{write_private, KeyPair};

/// Length of a SHA-256 digest.
pub const HASH_LENGTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("identity error: {0}")]
    IdentityError(String),
    #[error("base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Raw Ed25519 public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "base64_bytes")] pub Vec<u8>);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a base64-encoded key, as found in config files.
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64.decode(s.trim())?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "expected 32-byte Ed25519 key, got {} bytes",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// Detached signature bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "base64_bytes")] pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0))
    }
}

/// Verify `signature` over `message` against an Ed25519 public key.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    UnparsedPublicKey::new(&ED25519, public_key.as_bytes())
        .verify(message, signature.as_bytes())
        .is_ok()
}

/// SHA-256 of `data`.
pub fn hash(data: &[u8]) -> [u8; HASH_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Incremental SHA-256 over length-prefixed parts, so that ("ab", "c") and
/// ("a", "bc") never collide.
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn part(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update((data.len() as u64).to_be_bytes());
        self.inner.update(data);
        self
    }

    pub fn finish(&mut self) -> [u8; HASH_LENGTH] {
        std::mem::take(&mut self.inner).finalize().into()
    }
}

/// Serialize/deserialize Vec<u8> as base64 string.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
