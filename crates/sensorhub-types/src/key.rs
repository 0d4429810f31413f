//! API key digests.
//!
//! Keys are never stored in plaintext. The database holds the SHA-256 digest
//! of each key, and a presented key is hashed before it is compared.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of a key digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Number of random bytes in a generated key.
const KEY_BYTES: usize = 32;

/// SHA-256 digest of an API key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyDigest([u8; DIGEST_LEN]);

impl KeyDigest {
    /// Hash a presented key.
    ///
    /// Surrounding whitespace is ignored. The empty string is hashed like any
    /// other key, so a missing header still yields a digest that matches no
    /// stored key.
    pub fn of(secret: &str) -> Self {
        let hash = Sha256::digest(secret.trim().as_bytes());
        Self(hash.into())
    }

    /// Rebuild a digest from stored bytes.
    ///
    /// Returns `None` if `bytes` is not exactly [`DIGEST_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; DIGEST_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDigest({})", &self.to_hex()[..12])
    }
}

/// Generate a new URL-safe random key.
pub fn generate_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
