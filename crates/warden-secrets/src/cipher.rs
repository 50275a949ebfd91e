//! Field-level encryption for audit detail payloads.

use std::fmt;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::EncryptError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EncryptAlgorithm {
    #[default]
    #[serde(rename = "AES-256-GCM", alias = "AES256_GCM")]
    Aes256Gcm,
    #[serde(rename = "AES-128-GCM", alias = "AES128_GCM")]
    Aes128Gcm,
}

impl EncryptAlgorithm {
    pub fn code(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::Aes128Gcm => "AES-128-GCM",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        [Self::Aes256Gcm, Self::Aes128Gcm]
            .into_iter()
            .find(|alg| alg.code().eq_ignore_ascii_case(code.trim()))
    }
}

pub trait FieldEncryptor: Send + Sync {
    fn encrypt(&self, plaintext: &str, algorithm: EncryptAlgorithm)
        -> Result<String, EncryptError>;
}

/// AES-GCM with a random 96-bit nonce per value. Output is
/// `base64(nonce):base64(ciphertext)`.
#[derive(Clone)]
pub struct AesGcmFieldEncryptor {
    key: [u8; KEY_LEN],
}

impl AesGcmFieldEncryptor {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn from_base64(encoded: &str) -> Result<Self, EncryptError> {
        let decoded = BASE64.decode(encoded.trim().as_bytes())?;
        let key: [u8; KEY_LEN] = decoded.try_into().map_err(|raw: Vec<u8>| {
            EncryptError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", raw.len()))
        })?;
        Ok(Self::new(key))
    }

    /// Fresh random key; values encrypted with it are unreadable after restart.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn decrypt(&self, sealed: &str, algorithm: EncryptAlgorithm) -> Result<String, EncryptError> {
        let (nonce_b64, ciphertext_b64) = sealed
            .split_once(':')
            .ok_or_else(|| EncryptError::Encoding("missing nonce separator".to_string()))?;
        let nonce_raw = BASE64.decode(nonce_b64.as_bytes())?;
        if nonce_raw.len() != NONCE_LEN {
            return Err(EncryptError::Encoding(format!(
                "nonce must be {NONCE_LEN} bytes"
            )));
        }
        let nonce = Nonce::from_slice(&nonce_raw);
        let ciphertext = BASE64.decode(ciphertext_b64.as_bytes())?;

        let plaintext = match algorithm {
            EncryptAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|err| EncryptError::InvalidKey(err.to_string()))?
                .decrypt(nonce, ciphertext.as_ref()),
            EncryptAlgorithm::Aes128Gcm => Aes128Gcm::new_from_slice(&self.short_key())
                .map_err(|err| EncryptError::InvalidKey(err.to_string()))?
                .decrypt(nonce, ciphertext.as_ref()),
        }
        .map_err(|_| EncryptError::Cipher("decryption failed".to_string()))?;

        String::from_utf8(plaintext).map_err(|err| EncryptError::Encoding(err.to_string()))
    }

    fn short_key(&self) -> [u8; 16] {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(b"aes-128-gcm");
        let digest = hasher.finalize();
        let mut short = [0u8; 16];
        short.copy_from_slice(&digest[..16]);
        short
    }
}

impl FieldEncryptor for AesGcmFieldEncryptor {
    fn encrypt(
        &self,
        plaintext: &str,
        algorithm: EncryptAlgorithm,
    ) -> Result<String, EncryptError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = match algorithm {
            EncryptAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|err| EncryptError::InvalidKey(err.to_string()))?
                .encrypt(nonce, plaintext.as_bytes()),
            EncryptAlgorithm::Aes128Gcm => Aes128Gcm::new_from_slice(&self.short_key())
                .map_err(|err| EncryptError::InvalidKey(err.to_string()))?
                .encrypt(nonce, plaintext.as_bytes()),
        }
        .map_err(|_| EncryptError::Cipher("encryption failed".to_string()))?;

        Ok(format!(
            "{}:{}",
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        ))
    }
}

impl fmt::Debug for AesGcmFieldEncryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmFieldEncryptor")
            .field("key", &"<redacted>")
            .finish()
    }
}
