use std::fmt;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::IntegrityError;

/// Produces the per-record signature from its content hash.
pub trait RecordSigner: Send + Sync {
    fn sign(&self, content_hash: &str) -> String;
    fn verify(&self, content_hash: &str, signature: &str) -> bool;
}

type HmacSha256 = Hmac<Sha256>;

/// `salt:hex(HMAC-SHA256(key, content_hash ":" salt))`, salted with the sealing
/// time in nanoseconds.
#[derive(Clone)]
pub struct KeyedDigestSigner {
    keyed: HmacSha256,
}

impl KeyedDigestSigner {
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, IntegrityError> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(IntegrityError::InvalidKey(
                "signing key must not be empty".to_string(),
            ));
        }
        let keyed = HmacSha256::new_from_slice(key)
            .map_err(|e| IntegrityError::InvalidKey(format!("unusable signing key: {e}")))?;
        Ok(Self { keyed })
    }

    fn mac(&self, content_hash: &str, salt: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(content_hash.as_bytes());
        mac.update(b":");
        mac.update(salt.as_bytes());
        mac
    }
}

impl RecordSigner for KeyedDigestSigner {
    fn sign(&self, content_hash: &str) -> String {
        let now = Utc::now();
        let salt = now
            .timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros())
            .to_string();
        let tag = self.mac(content_hash, &salt).finalize().into_bytes();
        format!("{salt}:{}", hex::encode(tag))
    }

    fn verify(&self, content_hash: &str, signature: &str) -> bool {
        let Some((salt, digest)) = signature.split_once(':') else {
            return false;
        };
        let Ok(tag) = hex::decode(digest) else {
            return false;
        };
        self.mac(content_hash, salt).verify_slice(&tag).is_ok()
    }
}

impl fmt::Debug for KeyedDigestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedDigestSigner")
            .field("key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_only_with_same_key_and_hash() {
        let signer = KeyedDigestSigner::new(b"k1").expect("signer");
        let signature = signer.sign("abc");

        assert!(signer.verify("abc", &signature));
        assert!(!signer.verify("abd", &signature));
        assert!(!KeyedDigestSigner::new(b"k2")
            .expect("signer")
            .verify("abc", &signature));
        assert!(!signer.verify("abc", "no-separator"));
    }

    #[test]
    fn signature_is_standard_hmac_sha256() {
        // HMAC-SHA256("Jefe", "what do ya want for nothing?:1700000000")
        let signer = KeyedDigestSigner::new(b"Jefe").expect("signer");
        let signature =
            "1700000000:3776ddb74dc9060ea653831f04f6b7608f0924eeafee27b777615f954bdb653a";
        assert!(signer.verify("what do ya want for nothing?", signature));
    }

    #[test]
    fn altered_or_malformed_signature_is_rejected() {
        let signer = KeyedDigestSigner::new(b"k1").expect("signer");
        let signature = signer.sign("abc");
        let (salt, digest) = signature.split_once(':').expect("separator");

        let mut flipped = digest.to_string();
        let last = if flipped.ends_with('0') { "1" } else { "0" };
        flipped.replace_range(flipped.len() - 1.., last);
        assert!(!signer.verify("abc", &format!("{salt}:{flipped}")));
        assert!(!signer.verify("abc", &format!("{salt}1:{digest}")));
        assert!(!signer.verify("abc", &format!("{salt}:{}", &digest[..32])));
        assert!(!signer.verify("abc", &format!("{salt}:not-hex")));
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            KeyedDigestSigner::new(b""),
            Err(IntegrityError::InvalidKey(_))
        ));
    }
}
