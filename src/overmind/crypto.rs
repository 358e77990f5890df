//! Symmetric encryption for secrets at rest.
//!
//! OAuth refresh tokens and connector credentials never hit the store in the
//! clear: they go through [`SecretBox`], an AES-256-GCM sealer keyed from
//! configuration. The sealed form is `hex(nonce || ciphertext)` so it can sit
//! in any string column or JSON field.
//!
//! The key is derived from the configured key string with SHA-256, which maps
//! arbitrary-length operator input onto the 32 bytes AES-256 requires.
//!
//! # Example
//!
//! ```rust
//! use overmind::overmind::crypto::SecretBox;
//!
//! let secrets = SecretBox::new("correct horse battery staple");
//! let sealed = secrets.seal("refresh-token-123").unwrap();
//! assert_ne!(sealed, "refresh-token-123");
//! assert_eq!(secrets.open(&sealed).unwrap(), "refresh-token-123");
//! ```

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt;

const NONCE_LEN: usize = 12;

/// Errors from sealing/opening secrets.
#[derive(Debug)]
pub enum CryptoError {
    /// The sealed blob is not valid hex or is too short to hold a nonce.
    Malformed,
    /// Decryption failed (wrong key or tampered ciphertext).
    Unsealable,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::Malformed => write!(f, "sealed secret is malformed"),
            CryptoError::Unsealable => write!(f, "sealed secret could not be decrypted"),
        }
    }
}

impl Error for CryptoError {}

/// AES-256-GCM sealer for secrets at rest.
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    /// Build a sealer from the configured key string.
    pub fn new(key_material: &str) -> Self {
        let digest = Sha256::digest(key_material.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt `plaintext`, returning `hex(nonce || ciphertext)`.
    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Unsealable)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(hex_encode(&blob))
    }

    /// Decrypt a blob produced by [`seal`](SecretBox::seal).
    pub fn open(&self, sealed: &str) -> Result<String, CryptoError> {
        let blob = hex_decode(sealed).ok_or(CryptoError::Malformed)?;
        if blob.len() < NONCE_LEN {
            return Err(CryptoError::Malformed);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Unsealable)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Unsealable)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let secrets = SecretBox::new("k");
        let sealed = secrets.seal("hello").unwrap();
        assert_eq!(secrets.open(&sealed).unwrap(), "hello");
    }

    #[test]
    fn test_nonces_differ_between_seals() {
        let secrets = SecretBox::new("k");
        assert_ne!(secrets.seal("x").unwrap(), secrets.seal("x").unwrap());
    }

    #[test]
    fn test_wrong_key_fails_to_open() {
        let sealed = SecretBox::new("right").seal("secret").unwrap();
        assert!(SecretBox::new("wrong").open(&sealed).is_err());
    }

    #[test]
    fn test_malformed_blob_is_rejected() {
        let secrets = SecretBox::new("k");
        assert!(matches!(
            secrets.open("zz-not-hex"),
            Err(CryptoError::Malformed)
        ));
        assert!(matches!(secrets.open("abcd"), Err(CryptoError::Malformed)));
    }
}
