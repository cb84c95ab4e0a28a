//! Sealing of stored payment account details.
//!
//! Account details are serialized to JSON and encrypted with AES-256-GCM.
//! Sealed format (base64): MAGIC (4 bytes) || nonce (12 bytes) || ciphertext
//!
//! Each provider owns the plaintext schema of its details; only the owning
//! adapter opens them.

use crate::error::{PaymentError, Result};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

/// Nonce size for AES-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Key size (256 bits for AES-256)
const KEY_SIZE: usize = 32;

/// Magic bytes to identify sealed data
const SEALED_MAGIC: &[u8] = b"AGP1";

/// Opaque ciphertext of provider account details
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedDetails(String);

impl SealedDetails {
    /// Wrap an already sealed value loaded from storage
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Stored representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SealedDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedDetails(..)")
    }
}

/// AES-256-GCM cipher for account details
#[derive(Clone)]
pub struct DetailsCipher {
    key: [u8; KEY_SIZE],
}

impl DetailsCipher {
    /// Create from a base64-encoded 32 byte key
    pub fn from_base64(encoded: &SecretString) -> Result<Self> {
        let decoded = BASE64
            .decode(encoded.expose_secret().trim())
            .map_err(|e| PaymentError::Encryption(format!("invalid key encoding: {}", e)))?;

        if decoded.len() != KEY_SIZE {
            return Err(PaymentError::Encryption(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                decoded.len()
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&decoded);
        Ok(Self { key })
    }

    /// Create from raw key bytes
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Generate a random key, base64-encoded (initial setup)
    pub fn generate_key() -> String {
        BASE64.encode(Aes256Gcm::generate_key(OsRng))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| PaymentError::Encryption(format!("failed to create cipher: {}", e)))
    }

    /// Serialize and encrypt account details
    pub fn seal<T: Serialize>(&self, details: &T) -> Result<SealedDetails> {
        let plaintext = serde_json::to_vec(details)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()?
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| PaymentError::Encryption(format!("encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(SEALED_MAGIC.len() + NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(SEALED_MAGIC);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(SealedDetails(BASE64.encode(sealed)))
    }

    /// Decrypt and deserialize account details
    pub fn open<T: DeserializeOwned>(&self, sealed: &SealedDetails) -> Result<T> {
        let bytes = BASE64
            .decode(sealed.as_str())
            .map_err(|e| PaymentError::Encryption(format!("invalid sealed encoding: {}", e)))?;

        if bytes.len() < SEALED_MAGIC.len() + NONCE_SIZE + 1 || !bytes.starts_with(SEALED_MAGIC) {
            return Err(PaymentError::Encryption("not a sealed value".into()));
        }

        let (nonce, ciphertext) = bytes[SEALED_MAGIC.len()..].split_at(NONCE_SIZE);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PaymentError::Encryption("decryption failed".into()))?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl fmt::Debug for DetailsCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DetailsCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct CardOnFile {
        card_id: String,
        last4: String,
    }

    fn card() -> CardOnFile {
        CardOnFile {
            card_id: "ccof:abc".into(),
            last4: "4242".into(),
        }
    }

    #[test]
    fn test_seal_and_open() {
        let cipher = DetailsCipher::from_bytes([7u8; 32]);
        let sealed = cipher.seal(&card()).unwrap();

        assert!(!sealed.as_str().contains("4242"));
        let opened: CardOnFile = cipher.open(&sealed).unwrap();
        assert_eq!(opened, card());
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let sealed = DetailsCipher::from_bytes([1u8; 32]).seal(&card()).unwrap();
        let result: Result<CardOnFile> = DetailsCipher::from_bytes([2u8; 32]).open(&sealed);
        assert!(matches!(result, Err(PaymentError::Encryption(_))));
    }

    #[test]
    fn test_key_length_checked() {
        let short = SecretString::from(BASE64.encode([0u8; 16]));
        assert!(DetailsCipher::from_base64(&short).is_err());

        let generated = SecretString::from(DetailsCipher::generate_key());
        assert!(DetailsCipher::from_base64(&generated).is_ok());
    }

    #[test]
    fn test_debug_is_redacted() {
        let sealed = DetailsCipher::from_bytes([3u8; 32]).seal(&card()).unwrap();
        assert_eq!(format!("{:?}", sealed), "SealedDetails(..)");
    }
}
