//! Audit pipeline runtime: configuration, event building, dispatch.

pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod pipeline;

use thiserror::Error;
use warden_audit::AuditError;
use warden_integrity::IntegrityError;
use warden_policy_engine::PolicyError;
use warden_secrets::EncryptError;

pub use builder::{DetailError, EventBuilder};
pub use config::{AuditConfig, ConfigError, StorageBackend};
pub use dispatcher::{
    AuditDispatcher, DeadLetterSink, DispatchSlot, DispatcherStats, FailureCounters, FailureHook,
};
pub use pipeline::{storage_from_config, AuditPipeline, RecordOutcome, StorageHandle};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failure: {0}")]
    Validation(String),
    #[error("config failure: {0}")]
    Config(String),
    #[error("policy failure: {0}")]
    Policy(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("integrity failure: {0}")]
    Integrity(String),
    #[error("encryption failure: {0}")]
    Encryption(String),
}

impl From<AuditError> for PipelineError {
    fn from(value: AuditError) -> Self {
        match value {
            AuditError::Validation(msg) => PipelineError::Validation(msg),
            other => PipelineError::Storage(other.to_string()),
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(value: ConfigError) -> Self {
        PipelineError::Config(value.to_string())
    }
}

impl From<PolicyError> for PipelineError {
    fn from(value: PolicyError) -> Self {
        PipelineError::Policy(value.to_string())
    }
}

impl From<IntegrityError> for PipelineError {
    fn from(value: IntegrityError) -> Self {
        PipelineError::Integrity(value.to_string())
    }
}

impl From<EncryptError> for PipelineError {
    fn from(value: EncryptError) -> Self {
        PipelineError::Encryption(value.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
