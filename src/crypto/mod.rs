//! Cryptographic primitives for the secure channel
//!
//! This module provides:
//! - AES-GCM record sealing with per-record random nonces
//! - Password to key derivation (SHA-256)
//! - Secure random number generation

mod aead;

pub use aead::Cipher;

use ring::digest::{digest, SHA256};
use thiserror::Error;

/// Length of the default symmetric key in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// Accepted key lengths (AES-128, AES-256)
pub const KEY_LENGTHS: [usize; 2] = [16, 32];

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Bytes a sealed record adds on top of its plaintext
pub const RECORD_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length: {0}")]
    InvalidKeyLength(usize),

    #[error("Random generator failure")]
    Random,
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a random nonce
pub fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce)?;
    Ok(nonce)
}

/// Derive a 32-byte record key from a shared password
pub fn key_from_password(password: &str) -> [u8; KEY_LEN] {
    let hash = digest(&SHA256, password.as_bytes());
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(hash.as_ref());
    key
}

/// Check that a key has a supported length
pub fn validate_key(key: &[u8]) -> Result<(), CryptoError> {
    if KEY_LENGTHS.contains(&key.len()) {
        Ok(())
    } else {
        Err(CryptoError::InvalidKeyLength(key.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_key_from_password_is_sha256() {
        let key = key_from_password("password");
        // sha256("password")
        assert_eq!(&key[..4], &[0x5e, 0x88, 0x48, 0x98]);
        assert_eq!(key, key_from_password("password"));
        assert_ne!(key, key_from_password("Password"));
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key(&[0u8; 16]).is_ok());
        assert!(validate_key(&[0u8; 32]).is_ok());
        assert!(matches!(
            validate_key(&[0u8; 24]),
            Err(CryptoError::InvalidKeyLength(24))
        ));
    }
}
