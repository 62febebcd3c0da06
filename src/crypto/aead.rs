//! AEAD record sealing
//!
//! Record layout:
//! ```text
//! +----------------+---------------------------+----------------+
//! |  Nonce (12B)   |  Ciphertext (plaintext)   |   Tag (16B)    |
//! +----------------+---------------------------+----------------+
//! ```
//!
//! Every record gets a fresh random nonce, so one key can seal any number
//! of records without nonce reuse.

use super::{generate_nonce, validate_key, CryptoError, NONCE_LEN, RECORD_OVERHEAD};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};

/// AES-GCM cipher for sealing/opening secure records
pub struct Cipher {
    key: LessSafeKey,
}

impl Cipher {
    /// Create a new cipher from a 16-byte (AES-128) or 32-byte (AES-256) key
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        validate_key(key)?;
        let algorithm = if key.len() == 16 { &AES_128_GCM } else { &AES_256_GCM };

        let unbound_key =
            UnboundKey::new(algorithm, key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Seal plaintext into a self-contained record (nonce + ciphertext + tag)
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = generate_nonce()?;

        let mut body = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut body)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        let mut record = Vec::with_capacity(plaintext.len() + RECORD_OVERHEAD);
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&body);
        Ok(record)
    }

    /// Authenticate and decrypt a record produced by [`Cipher::seal`]
    pub fn open(&self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if record.len() < RECORD_OVERHEAD {
            return Err(CryptoError::Decryption(format!(
                "record too short: {} bytes",
                record.len()
            )));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&record[..NONCE_LEN]);
        let mut buffer = record[NONCE_LEN..].to_vec();

        let plaintext = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KEY_LEN, TAG_LEN};

    #[test]
    fn test_cipher_seal_open() {
        let key = [0x42u8; KEY_LEN];
        let sealer = Cipher::new(&key).unwrap();
        let opener = Cipher::new(&key).unwrap();

        let plaintext = b"Hello, World!";
        let record = sealer.seal(plaintext).unwrap();
        assert_eq!(record.len(), plaintext.len() + NONCE_LEN + TAG_LEN);

        let opened = opener.open(&record).unwrap();
        assert_eq!(&opened, plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = Cipher::new(&[1u8; 16]).unwrap();
        let record = cipher.seal(&[]).unwrap();
        assert_eq!(record.len(), RECORD_OVERHEAD);
        assert!(cipher.open(&record).unwrap().is_empty());
    }

    #[test]
    fn test_nonces_are_not_reused() {
        let cipher = Cipher::new(&[0x42u8; KEY_LEN]).unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tamper_detection() {
        let cipher = Cipher::new(&[0x42u8; KEY_LEN]).unwrap();
        let mut record = cipher.seal(b"Hello, World!").unwrap();

        // Flip a ciphertext bit
        record[NONCE_LEN] ^= 0xFF;
        assert!(cipher.open(&record).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let record = Cipher::new(&[1u8; KEY_LEN]).unwrap().seal(b"secret").unwrap();
        assert!(Cipher::new(&[2u8; KEY_LEN]).unwrap().open(&record).is_err());
    }

    #[test]
    fn test_short_record_rejected() {
        let cipher = Cipher::new(&[1u8; KEY_LEN]).unwrap();
        assert!(cipher.open(&[0u8; RECORD_OVERHEAD - 1]).is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(Cipher::new(&[0u8; 20]).is_err());
    }
}
