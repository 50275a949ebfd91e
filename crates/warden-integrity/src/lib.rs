//! Append-only hash chain over audit records.
//!
//! Each sealed record carries its own content hash and the content hash of
//! the record sealed immediately before it. The "last hash" cell lives in one
//! [`Chainer`]; every update goes through its lock.

pub mod signer;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use warden_audit::AuditRecord;

pub use signer::{KeyedDigestSigner, RecordSigner};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

#[derive(Serialize)]
struct CanonicalContent<'a> {
    category: &'a str,
    subcategory: &'a str,
    operation: &'a str,
    user_id: &'a str,
    event_time: String,
    prev_hash: &'a str,
}

/// SHA-256 over category, subcategory, operation name, actor id, event time
/// and the previous link, so relinking a record changes its hash.
/// Falls back to a digest of the record's `Debug` text if the canonical form
/// cannot be produced.
pub fn compute_content_hash(record: &AuditRecord) -> String {
    let canonical = CanonicalContent {
        category: record.category().code(),
        subcategory: record.subcategory(),
        operation: &record.operation_name,
        user_id: record.user_id.as_deref().unwrap_or_default(),
        event_time: record
            .event_time
            .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        prev_hash: record.prev_hash.as_deref().unwrap_or_default(),
    };
    match serde_json::to_vec(&canonical) {
        Ok(bytes) => sha256_hex(&bytes),
        Err(err) => {
            tracing::warn!(error = %err, "canonical audit content unavailable, using fallback hash");
            fallback_hash(record)
        }
    }
}

pub fn fallback_hash(record: &AuditRecord) -> String {
    sha256_hex(format!("{record:?}").as_bytes())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Fills in the content hash, link and signature.
pub fn seal_with(
    mut record: AuditRecord,
    previous_hash: Option<String>,
    signer: &dyn RecordSigner,
) -> AuditRecord {
    record.prev_hash = previous_hash;
    let content_hash = compute_content_hash(&record);
    record.signature = Some(signer.sign(&content_hash));
    record.content_hash = Some(content_hash);
    record
}

/// Single owner of the chain head.
pub struct Chainer {
    last_hash: Mutex<Option<String>>,
    signer: Arc<dyn RecordSigner>,
}

impl Chainer {
    pub fn new(signer: Arc<dyn RecordSigner>) -> Self {
        Self::resume(signer, None)
    }

    /// Continues an existing chain whose newest content hash is `last_hash`.
    pub fn resume(signer: Arc<dyn RecordSigner>, last_hash: Option<String>) -> Self {
        Self {
            last_hash: Mutex::new(last_hash),
            signer,
        }
    }

    pub fn last_hash(&self) -> Option<String> {
        self.last_hash.lock().clone()
    }

    pub fn signer(&self) -> &dyn RecordSigner {
        self.signer.as_ref()
    }

    /// Seals and advances the head in one step.
    pub fn seal(&self, record: AuditRecord) -> AuditRecord {
        let mut last_hash = self.last_hash.lock();
        let sealed = seal_with(record, last_hash.take(), self.signer.as_ref());
        *last_hash = sealed.content_hash.clone();
        sealed
    }

    /// Seals against the current head without moving it. Only a single writer
    /// may pair this with [`commit`](Self::commit).
    pub fn prepare(&self, record: AuditRecord) -> AuditRecord {
        seal_with(record, self.last_hash(), self.signer.as_ref())
    }

    /// Moves the head to a prepared record's content hash once it is stored.
    pub fn commit(&self, content_hash: String) {
        *self.last_hash.lock() = Some(content_hash);
    }
}

impl std::fmt::Debug for Chainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chainer")
            .field("last_hash", &self.last_hash())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ChainVerification {
    pub valid: bool,
    pub records_checked: usize,
    /// Position in the checked slice of the first bad record.
    pub broken_at: Option<usize>,
    pub message: Option<String>,
}

impl ChainVerification {
    fn broken(index: usize, message: String) -> Self {
        tracing::warn!(index, %message, "audit hash chain broken");
        Self {
            valid: false,
            records_checked: index + 1,
            broken_at: Some(index),
            message: Some(message),
        }
    }
}

/// Re-checks links and content hashes for records in chain order, and
/// signatures when a signer is supplied. The first record must start the chain.
pub fn verify_chain(
    records: &[AuditRecord],
    signer: Option<&dyn RecordSigner>,
) -> ChainVerification {
    let mut expected_prev: Option<&str> = None;

    for (index, record) in records.iter().enumerate() {
        let label = record
            .id
            .map_or_else(|| format!("#{index}"), |id| format!("id {id}"));

        let Some(content_hash) = record.content_hash.as_deref() else {
            return ChainVerification::broken(index, format!("record {label} is not sealed"));
        };
        if record.prev_hash.as_deref() != expected_prev {
            return ChainVerification::broken(
                index,
                format!("previous hash mismatch at record {label}"),
            );
        }
        let recomputed = compute_content_hash(record);
        if recomputed != content_hash && fallback_hash_of_unsealed(record) != content_hash {
            return ChainVerification::broken(
                index,
                format!("content hash mismatch at record {label}"),
            );
        }
        if let Some(signer) = signer {
            let signed = record
                .signature
                .as_deref()
                .is_some_and(|sig| signer.verify(content_hash, sig));
            if !signed {
                return ChainVerification::broken(
                    index,
                    format!("signature mismatch at record {label}"),
                );
            }
        }
        expected_prev = Some(content_hash);
    }

    ChainVerification {
        valid: true,
        records_checked: records.len(),
        broken_at: None,
        message: None,
    }
}

// A fallback hash is taken after linking but before hashing and signing.
fn fallback_hash_of_unsealed(record: &AuditRecord) -> String {
    let mut unsealed = record.clone();
    unsealed.id = None;
    unsealed.content_hash = None;
    unsealed.signature = None;
    fallback_hash(&unsealed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::thread;

    use chrono::{Duration, Utc};
    use warden_audit::{AuditStatus, EventType, RiskLevel};

    use super::*;

    fn signer() -> Arc<dyn RecordSigner> {
        Arc::new(KeyedDigestSigner::new(b"chain-test").expect("signer"))
    }

    fn record(n: i64) -> AuditRecord {
        let mut record = AuditRecord::new(
            Utc::now() + Duration::milliseconds(n),
            EventType::DataUpdate,
            format!("OrderService.update{n}"),
            AuditStatus::Success,
            RiskLevel::Medium,
        );
        record.user_id = Some(format!("user-{n}"));
        record
    }

    #[test]
    fn content_hash_is_stable_and_field_sensitive() {
        let base = record(1);
        assert_eq!(compute_content_hash(&base), compute_content_hash(&base.clone()));
        assert_eq!(compute_content_hash(&base).len(), 64);

        let mut other = base.clone();
        other.user_id = Some("someone-else".to_string());
        assert_ne!(compute_content_hash(&base), compute_content_hash(&other));
    }

    #[test]
    fn sequential_seals_form_a_chain() {
        let chainer = Chainer::new(signer());
        let sealed: Vec<AuditRecord> = (0..5).map(|n| chainer.seal(record(n))).collect();

        assert!(sealed[0].prev_hash.is_none());
        for pair in sealed.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].content_hash);
        }
        assert_eq!(chainer.last_hash(), sealed[4].content_hash);

        let signer = signer();
        let result = verify_chain(&sealed, Some(signer.as_ref()));
        assert!(result.valid, "{result:?}");
        assert_eq!(result.records_checked, 5);
    }

    #[test]
    fn resumed_chain_links_to_previous_head() {
        let chainer = Chainer::resume(signer(), Some("f".repeat(64)));
        let sealed = chainer.seal(record(1));
        assert_eq!(sealed.prev_hash.as_deref(), Some("f".repeat(64).as_str()));
    }

    #[test]
    fn concurrent_seals_keep_a_single_line() {
        let chainer = Arc::new(Chainer::new(signer()));
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let chainer = Arc::clone(&chainer);
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for n in 0..25 {
                        let sealed = chainer.seal(record(t * 100 + n));
                        log.lock().push(sealed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        // Threads log out of order; walk the links from the first record.
        let mut by_prev: HashMap<Option<String>, AuditRecord> = log
            .lock()
            .drain(..)
            .map(|r| (r.prev_hash.clone(), r))
            .collect();
        assert_eq!(by_prev.len(), 200, "two records share a predecessor");
        let mut ordered = Vec::new();
        let mut prev = None;
        while let Some(next) = by_prev.remove(&prev) {
            prev = next.content_hash.clone();
            ordered.push(next);
        }
        assert_eq!(ordered.len(), 200);
        assert!(verify_chain(&ordered, None).valid);
        assert_eq!(chainer.last_hash(), prev);
    }

    #[test]
    fn prepared_record_only_advances_on_commit() {
        let chainer = Chainer::new(signer());
        let first = chainer.seal(record(0));

        let lost = chainer.prepare(record(1));
        assert_eq!(lost.prev_hash, first.content_hash);
        assert_eq!(chainer.last_hash(), first.content_hash);

        let kept = chainer.prepare(record(2));
        chainer.commit(kept.content_hash.clone().expect("sealed"));
        assert_eq!(chainer.last_hash(), kept.content_hash);

        let signer = signer();
        assert!(verify_chain(&[first, kept], Some(signer.as_ref())).valid);
    }

    #[test]
    fn removed_and_relinked_record_is_detected() {
        let chainer = Chainer::new(signer());
        let mut sealed: Vec<AuditRecord> = (0..3).map(|n| chainer.seal(record(n))).collect();
        sealed.remove(1);
        sealed[1].prev_hash = sealed[0].content_hash.clone();

        let signer = signer();
        for checker in [None, Some(signer.as_ref())] {
            let result = verify_chain(&sealed, checker);
            assert!(!result.valid);
            assert_eq!(result.broken_at, Some(1));
        }
    }

    #[test]
    fn tampering_is_detected() {
        let chainer = Chainer::new(signer());
        let mut sealed: Vec<AuditRecord> = (0..3).map(|n| chainer.seal(record(n))).collect();

        let mut edited = sealed.clone();
        edited[1].operation_name = "OrderService.cover".to_string();
        let result = verify_chain(&edited, None);
        assert!(!result.valid);
        assert_eq!(result.broken_at, Some(1));

        sealed.remove(1);
        let result = verify_chain(&sealed, None);
        assert_eq!(result.broken_at, Some(1));
        assert!(result.message.unwrap_or_default().contains("previous hash"));
    }

    #[test]
    fn forged_signature_is_detected() {
        let chainer = Chainer::new(signer());
        let mut sealed = vec![chainer.seal(record(0))];
        sealed[0].signature = Some("0:deadbeef".to_string());

        let signer = signer();
        assert!(verify_chain(&sealed, None).valid);
        assert!(!verify_chain(&sealed, Some(signer.as_ref())).valid);
    }
}
