//! Sensitive data handling for audit payloads: masking and field encryption.

pub mod cipher;
pub mod mask;

use thiserror::Error;

pub use cipher::{AesGcmFieldEncryptor, EncryptAlgorithm, FieldEncryptor};
pub use mask::{mask, MaskFields, Masked, DEFAULT_MASK_FIELDS, MASK_TOKEN};

#[derive(Debug, Error)]
pub enum EncryptError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("encoding failure: {0}")]
    Encoding(String),
}

impl From<base64::DecodeError> for EncryptError {
    fn from(value: base64::DecodeError) -> Self {
        Self::Encoding(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn masked_payload_can_be_encrypted_without_leaking_values() {
        let masked = mask(
            json!({"password": "hunter2", "user": "ana"}),
            &MaskFields::with_defaults(),
        );
        let plaintext = masked.value.to_string();
        assert!(!plaintext.contains("hunter2"));

        let encryptor = AesGcmFieldEncryptor::generate();
        let sealed = encryptor
            .encrypt(&plaintext, EncryptAlgorithm::default())
            .expect("encrypt");
        assert!(!sealed.contains("ana"));
        assert_eq!(
            encryptor
                .decrypt(&sealed, EncryptAlgorithm::default())
                .expect("decrypt"),
            plaintext
        );
    }
}
