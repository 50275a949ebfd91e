//! Filter, build, dispatch. The dispatcher worker seals each record as it stores it.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use warden_audit::{
    validate_detail, validate_record, AuditStatus, AuditStorage, CallContext, CapturedError,
    NoopAuditStorage,
};
use warden_integrity::{Chainer, KeyedDigestSigner, RecordSigner};
use warden_policy_engine::{AuditFilter, ConditionFilter};
use warden_secrets::{AesGcmFieldEncryptor, FieldEncryptor};
use warden_storage_sqlite::SqliteAuditStorage;

use crate::builder::EventBuilder;
use crate::config::{AuditConfig, StorageBackend};
use crate::dispatcher::{AuditDispatcher, DispatcherStats, FailureCounters};
use crate::{PipelineError, PipelineResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    Disabled,
    Filtered,
    /// Queue full or dispatcher stopped; the chain did not advance.
    Dropped,
    /// Queued; sealed and linked once storage accepts it.
    Submitted,
}

/// Storage chosen by configuration, plus the newest content hash it already holds.
pub struct StorageHandle {
    pub storage: Arc<dyn AuditStorage>,
    pub chain_head: Option<String>,
}

pub async fn storage_from_config(config: &AuditConfig) -> PipelineResult<StorageHandle> {
    match config.storage.backend {
        StorageBackend::Noop => Ok(StorageHandle {
            storage: Arc::new(NoopAuditStorage),
            chain_head: None,
        }),
        StorageBackend::Database => {
            let sqlite = SqliteAuditStorage::connect(&config.storage.database_url).await?;
            let chain_head = sqlite.last_content_hash().await?;
            tracing::info!(
                url = %config.storage.database_url,
                resumed = chain_head.is_some(),
                "audit storage ready"
            );
            Ok(StorageHandle {
                storage: Arc::new(sqlite),
                chain_head,
            })
        }
    }
}

pub struct AuditPipeline<F = ConditionFilter, E = AesGcmFieldEncryptor> {
    enabled: bool,
    filter: F,
    builder: EventBuilder<E>,
    chainer: Arc<Chainer>,
    dispatcher: AuditDispatcher,
    failures: Arc<FailureCounters>,
}

impl AuditPipeline<ConditionFilter, AesGcmFieldEncryptor> {
    /// Must be called from inside a tokio runtime.
    pub async fn from_config(config: &AuditConfig) -> PipelineResult<Self> {
        config.validate()?;
        let handle = storage_from_config(config).await?;
        Self::with_storage(config, handle)
    }

    /// Must be called from inside a tokio runtime.
    pub fn with_storage(config: &AuditConfig, handle: StorageHandle) -> PipelineResult<Self> {
        config.validate()?;
        let filter = ConditionFilter::new(&config.filter)?;

        let encryptor = match config.security.encryption_key.as_deref() {
            Some(key) => AesGcmFieldEncryptor::from_base64(key)?,
            None => {
                tracing::warn!("no audit encryption key configured, using a per-process key");
                AesGcmFieldEncryptor::generate()
            }
        };
        let builder = EventBuilder::new(encryptor)
            .with_mask_fields(&config.mask_fields)
            .with_transport_prefixes(config.transport_type_prefixes.clone())
            .with_app_name(config.app_name.clone());

        let signer: Arc<dyn RecordSigner> = match config.security.signing_key.as_deref() {
            Some(key) => Arc::new(KeyedDigestSigner::new(key)?),
            None => {
                tracing::warn!("no audit signing key configured, using a per-process key");
                let mut key = [0u8; 32];
                OsRng.fill_bytes(&mut key);
                Arc::new(KeyedDigestSigner::new(key)?)
            }
        };
        let chainer = Arc::new(Chainer::resume(signer, handle.chain_head));

        let failures = Arc::new(FailureCounters::default());
        let dispatcher = AuditDispatcher::spawn_with(
            handle.storage,
            config.dispatcher.queue_capacity,
            Some(chainer.clone()),
            failures.clone(),
            None,
        );

        Ok(Self::new(filter, builder, chainer, dispatcher, failures).with_enabled(config.enabled))
    }
}

impl<F, E> AuditPipeline<F, E>
where
    F: AuditFilter,
    E: FieldEncryptor,
{
    /// `chainer` and `failures` should be the ones the dispatcher was spawned with.
    pub fn new(
        filter: F,
        builder: EventBuilder<E>,
        chainer: Arc<Chainer>,
        dispatcher: AuditDispatcher,
        failures: Arc<FailureCounters>,
    ) -> Self {
        Self {
            enabled: true,
            filter,
            builder,
            chainer,
            dispatcher,
            failures,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Runs the synchronous half of the pipeline and queues the result.
    /// Only validation problems reach the caller.
    pub fn record(&self, ctx: &CallContext) -> PipelineResult<RecordOutcome> {
        if !self.enabled {
            return Ok(RecordOutcome::Disabled);
        }
        if !self.filter.should_record(ctx) {
            return Ok(RecordOutcome::Filtered);
        }

        let (record, details) = self.builder.build(ctx);
        validate_record(&record)?;
        for detail in &details {
            validate_detail(detail)?;
        }

        if !self.dispatcher.submit(record, details) {
            return Ok(RecordOutcome::Dropped);
        }
        Ok(RecordOutcome::Submitted)
    }

    fn emit(&self, ctx: &CallContext) {
        if let Err(err) = self.record(ctx) {
            tracing::warn!(
                operation = %ctx.operation.qualified_name(),
                error = %err,
                "audit record rejected"
            );
        }
    }

    /// Runs `call`, audits its outcome, and hands the outcome back untouched.
    pub fn observe<T, Er, C>(&self, ctx: CallContext, call: C) -> Result<T, Er>
    where
        C: FnOnce() -> Result<T, Er>,
        T: Serialize,
        Er: std::error::Error + 'static,
    {
        let started = Instant::now();
        let outcome = call();
        self.emit(&complete(ctx, &outcome, started.elapsed()));
        outcome
    }

    /// Async form of [`observe`](Self::observe). If the returned future is
    /// dropped before finishing, a `CANCELLED` record is emitted instead.
    pub async fn observe_future<T, Er, Fut>(&self, ctx: CallContext, fut: Fut) -> Result<T, Er>
    where
        Fut: Future<Output = Result<T, Er>>,
        T: Serialize,
        Er: std::error::Error + 'static,
    {
        let mut guard = CancelGuard {
            pipeline: self,
            ctx: Some(ctx),
            started: Instant::now(),
        };
        let outcome = fut.await;
        if let Some(ctx) = guard.ctx.take() {
            self.emit(&complete(ctx, &outcome, guard.started.elapsed()));
        }
        outcome
    }

    /// Like [`observe_future`](Self::observe_future) with a deadline; a
    /// timed-out call is recorded with status `TIMEOUT`.
    pub async fn observe_timeout<T, Er, Fut>(
        &self,
        ctx: CallContext,
        limit: Duration,
        fut: Fut,
    ) -> Result<Result<T, Er>, tokio::time::error::Elapsed>
    where
        Fut: Future<Output = Result<T, Er>>,
        T: Serialize,
        Er: std::error::Error + 'static,
    {
        let mut guard = CancelGuard {
            pipeline: self,
            ctx: Some(ctx),
            started: Instant::now(),
        };
        let outcome = tokio::time::timeout(limit, fut).await;
        if let Some(ctx) = guard.ctx.take() {
            let elapsed = guard.started.elapsed();
            match &outcome {
                Ok(inner) => self.emit(&complete(ctx, inner, elapsed)),
                Err(_) => {
                    let ctx = ctx.with_status(AuditStatus::Timeout).with_elapsed(elapsed);
                    self.emit(&ctx);
                }
            }
        }
        outcome
    }

    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    pub fn failures(&self) -> &FailureCounters {
        &self.failures
    }

    /// Content hash of the newest stored record.
    pub fn chain_head(&self) -> Option<String> {
        self.chainer.last_hash()
    }

    /// Drains queued records into storage.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}

fn complete<T, Er>(ctx: CallContext, outcome: &Result<T, Er>, elapsed: Duration) -> CallContext
where
    T: Serialize,
    Er: std::error::Error + 'static,
{
    let ctx = ctx.with_elapsed(elapsed);
    match outcome {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => ctx.with_return_value(value),
            Err(err) => {
                tracing::warn!(error = %err, "return value not serializable, omitted from audit");
                ctx
            }
        },
        Err(err) => ctx.with_error(CapturedError::from_error(err)),
    }
}

struct CancelGuard<'a, F, E>
where
    F: AuditFilter,
    E: FieldEncryptor,
{
    pipeline: &'a AuditPipeline<F, E>,
    ctx: Option<CallContext>,
    started: Instant,
}

impl<F, E> Drop for CancelGuard<'_, F, E>
where
    F: AuditFilter,
    E: FieldEncryptor,
{
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let ctx = ctx
                .with_status(AuditStatus::Cancelled)
                .with_elapsed(self.started.elapsed());
            self.pipeline.emit(&ctx);
        }
    }
}
