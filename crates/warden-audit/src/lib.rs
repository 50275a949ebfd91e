//! Audit record model, detail taxonomy, and the storage port.

pub mod classify;
pub mod context;
pub mod record;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use classify::{classify, infer_event_type, Classification};
pub use context::{Actor, AuditPolicy, CallContext, CapturedError, OperationRef, Parameter, Transport};
pub use record::{AuditDetail, AuditRecord};
pub use types::{
    is_failure, is_high_risk, is_high_risk_event, is_security_event, is_success, needs_alert,
    risk_for_event, AuditStatus, DetailKey, DetailKeySpec, DetailType, EventCategory, EventType,
    RiskLevel, DETAIL_KEYS,
};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("invalid audit record: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl AuditError {
    /// Stable label used for failure accounting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Column limits shared by every backend.
pub const MAX_OPERATION_NAME: usize = 200;
pub const MAX_USER_ID: usize = 64;
pub const MAX_TENANT_ID: usize = 50;
pub const MAX_SESSION_ID: usize = 128;
pub const MAX_CLIENT_IP: usize = 45;
pub const MAX_USER_AGENT: usize = 100;
pub const MAX_URI: usize = 500;
pub const MAX_HTTP_METHOD: usize = 10;
pub const MAX_TRACE_ID: usize = 100;

/// Persists one record together with its details as a single unit.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    async fn save(
        &self,
        record: AuditRecord,
        details: Vec<AuditDetail>,
    ) -> Result<AuditRecord, AuditError>;
}

#[async_trait]
impl<T: AuditStorage + ?Sized> AuditStorage for Arc<T> {
    async fn save(
        &self,
        record: AuditRecord,
        details: Vec<AuditDetail>,
    ) -> Result<AuditRecord, AuditError> {
        (**self).save(record, details).await
    }
}

#[derive(Clone, Debug, Default)]
pub struct NoopAuditStorage;

#[async_trait]
impl AuditStorage for NoopAuditStorage {
    async fn save(
        &self,
        record: AuditRecord,
        details: Vec<AuditDetail>,
    ) -> Result<AuditRecord, AuditError> {
        tracing::trace!(
            operation = %record.operation_name,
            details = details.len(),
            "audit record discarded by noop storage"
        );
        Ok(record)
    }
}

pub fn validate_record(record: &AuditRecord) -> Result<(), AuditError> {
    if record.event_time.timestamp() <= 0 {
        return Err(AuditError::Validation("event time is missing".to_string()));
    }
    if record.category().code().trim().is_empty() || record.subcategory().trim().is_empty() {
        return Err(AuditError::Validation("event category is blank".to_string()));
    }
    if record.status.code().trim().is_empty() {
        return Err(AuditError::Validation("status is blank".to_string()));
    }
    if record.risk_level.code().trim().is_empty() {
        return Err(AuditError::Validation("risk level is blank".to_string()));
    }
    if record.operation_name.trim().is_empty() {
        return Err(AuditError::Validation("operation name is blank".to_string()));
    }
    if record.elapsed_ms < 0 {
        return Err(AuditError::Validation(format!(
            "elapsed time is negative: {}",
            record.elapsed_ms
        )));
    }

    check_len("operation_name", Some(&record.operation_name), MAX_OPERATION_NAME)?;
    check_len("user_id", record.user_id.as_deref(), MAX_USER_ID)?;
    check_len("tenant_id", record.tenant_id.as_deref(), MAX_TENANT_ID)?;
    check_len("session_id", record.session_id.as_deref(), MAX_SESSION_ID)?;
    check_len("client_ip", record.client_ip.as_deref(), MAX_CLIENT_IP)?;
    check_len("user_agent", record.user_agent.as_deref(), MAX_USER_AGENT)?;
    check_len("uri", record.uri.as_deref(), MAX_URI)?;
    check_len("http_method", record.http_method.as_deref(), MAX_HTTP_METHOD)?;
    check_len("trace_id", record.trace_id.as_deref(), MAX_TRACE_ID)?;
    Ok(())
}

pub fn validate_detail(detail: &AuditDetail) -> Result<(), AuditError> {
    let declared = detail.detail_key.detail_type();
    if detail.detail_type != declared {
        return Err(AuditError::Validation(format!(
            "detail {} declared as {} but keyed under {}",
            detail.detail_key.code(),
            detail.detail_type.code(),
            declared.code()
        )));
    }
    Ok(())
}

fn check_len(field: &str, value: Option<&str>, max: usize) -> Result<(), AuditError> {
    match value {
        Some(value) if value.chars().count() > max => Err(AuditError::Validation(format!(
            "{field} exceeds {max} characters"
        ))),
        _ => Ok(()),
    }
}
