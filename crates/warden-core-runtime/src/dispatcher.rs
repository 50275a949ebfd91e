//! Seals records and hands them to storage on a background task.
//!
//! One bounded queue feeds one worker, so records reach storage in the order
//! they were submitted. The caller never waits on storage: a full queue drops
//! the record and counts it. When a [`Chainer`] is attached, the worker is its
//! only writer and moves the chain head only after a save succeeds.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio::task::JoinHandle;
use warden_audit::{AuditDetail, AuditError, AuditRecord, AuditStorage};
use warden_integrity::Chainer;

/// Told about every persistence failure, keyed by [`AuditError::kind`].
pub trait FailureHook: Send + Sync {
    fn record_failure(&self, kind: &'static str);
}

#[derive(Debug, Default)]
pub struct FailureCounters {
    counts: Mutex<BTreeMap<&'static str, u64>>,
}

impl FailureCounters {
    pub fn count(&self, kind: &str) -> u64 {
        self.counts.lock().get(kind).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.counts.lock().clone()
    }
}

impl FailureHook for FailureCounters {
    fn record_failure(&self, kind: &'static str) {
        *self.counts.lock().entry(kind).or_insert(0) += 1;
    }
}

/// Receives records that storage rejected. Nothing is retried automatically.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn accept(&self, record: AuditRecord, details: Vec<AuditDetail>, error: &AuditError);
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct DispatcherStats {
    pub submitted: u64,
    pub persisted: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct Envelope {
    record: AuditRecord,
    details: Vec<AuditDetail>,
}

/// A reserved place in the queue. Sending through it cannot fail or block.
pub struct DispatchSlot {
    permit: OwnedPermit<Envelope>,
    counters: Arc<Counters>,
}

impl DispatchSlot {
    pub fn send(self, record: AuditRecord, details: Vec<AuditDetail>) {
        self.permit.send(Envelope { record, details });
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct AuditDispatcher {
    sender: RwLock<Option<mpsc::Sender<Envelope>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl AuditDispatcher {
    /// Must be called from inside a tokio runtime.
    pub fn spawn(storage: Arc<dyn AuditStorage>, queue_capacity: usize) -> Self {
        Self::spawn_with(
            storage,
            queue_capacity,
            None,
            Arc::new(FailureCounters::default()),
            None,
        )
    }

    /// Must be called from inside a tokio runtime. With a `chainer`, records
    /// are sealed at insert time; nothing else may seal through it meanwhile.
    pub fn spawn_with(
        storage: Arc<dyn AuditStorage>,
        queue_capacity: usize,
        chainer: Option<Arc<Chainer>>,
        failure_hook: Arc<dyn FailureHook>,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run_worker(
            rx,
            storage,
            chainer,
            failure_hook,
            dead_letter,
            Arc::clone(&counters),
        ));

        Self {
            sender: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            counters,
        }
    }

    /// `None` when the queue is full or the dispatcher has shut down; the
    /// record is then counted as dropped.
    pub fn reserve(&self) -> Option<DispatchSlot> {
        let Some(sender) = self.sender.read().clone() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("audit dispatcher is shut down, dropping record");
            return None;
        };
        match sender.try_reserve_owned() {
            Ok(permit) => Some(DispatchSlot {
                permit,
                counters: Arc::clone(&self.counters),
            }),
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped, "audit queue full, dropping record");
                None
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("audit worker stopped, dropping record");
                None
            }
        }
    }

    /// Fire and forget. Returns whether the record was queued.
    pub fn submit(&self, record: AuditRecord, details: Vec<AuditDetail>) -> bool {
        match self.reserve() {
            Some(slot) => {
                slot.send(record, details);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting records and waits until everything queued is handled.
    pub async fn shutdown(&self) {
        drop(self.sender.write().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "audit dispatcher worker ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for AuditDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditDispatcher")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Envelope>,
    storage: Arc<dyn AuditStorage>,
    chainer: Option<Arc<Chainer>>,
    failure_hook: Arc<dyn FailureHook>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    counters: Arc<Counters>,
) {
    while let Some(Envelope { record, details }) = rx.recv().await {
        let operation = record.operation_name.clone();
        let record = match &chainer {
            Some(chainer) => chainer.prepare(record),
            None => record,
        };
        let head = record.content_hash.clone();
        let backup = dead_letter
            .as_ref()
            .map(|_| (record.clone(), details.clone()));

        match storage.save(record, details).await {
            Ok(saved) => {
                if let (Some(chainer), Some(head)) = (&chainer, head) {
                    chainer.commit(head);
                }
                counters.persisted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(id = ?saved.id, %operation, "audit record persisted");
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    kind = err.kind(),
                    error = %err,
                    %operation,
                    "audit record not persisted"
                );
                failure_hook.record_failure(err.kind());
                if let (Some(sink), Some((record, details))) = (&dead_letter, backup) {
                    sink.accept(record, details, &err).await;
                }
            }
        }
    }
    tracing::info!("audit dispatcher stopped");
}
