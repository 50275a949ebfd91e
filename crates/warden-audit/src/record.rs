use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_secrets::EncryptAlgorithm;

use crate::types::{
    is_failure, is_high_risk, is_security_event, is_success, needs_alert, AuditStatus, DetailKey,
    DetailType, EventCategory, EventType, RiskLevel,
};

/// One audited event. Built once by the event builder and never mutated after
/// it has been sealed and handed to the dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct AuditRecord {
    #[serde(default)]
    pub id: Option<i64>,
    pub event_time: DateTime<Utc>,
    pub event_type: EventType,
    pub operation_name: String,
    pub status: AuditStatus,
    pub risk_level: RiskLevel,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub tenant_id: Option<String>,
    pub session_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub uri: Option<String>,
    pub http_method: Option<String>,
    pub http_status: Option<u16>,
    pub trace_id: Option<String>,
    pub server_ip: Option<String>,
    pub app_name: Option<String>,
    pub elapsed_ms: i64,
    pub content_hash: Option<String>,
    pub prev_hash: Option<String>,
    pub signature: Option<String>,
}

impl AuditRecord {
    /// Bare record with every optional field empty.
    pub fn new(
        event_time: DateTime<Utc>,
        event_type: EventType,
        operation_name: impl Into<String>,
        status: AuditStatus,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            id: None,
            event_time,
            event_type,
            operation_name: operation_name.into(),
            status,
            risk_level,
            user_id: None,
            user_name: None,
            tenant_id: None,
            session_id: None,
            client_ip: None,
            user_agent: None,
            uri: None,
            http_method: None,
            http_status: None,
            trace_id: None,
            server_ip: None,
            app_name: None,
            elapsed_ms: 0,
            content_hash: None,
            prev_hash: None,
            signature: None,
        }
    }

    pub fn category(&self) -> EventCategory {
        self.event_type.category()
    }

    pub fn subcategory(&self) -> &'static str {
        self.event_type.subcategory()
    }

    pub fn is_failure(&self) -> bool {
        is_failure(self.status)
    }

    pub fn is_success(&self) -> bool {
        is_success(self.status)
    }

    pub fn is_high_risk(&self) -> bool {
        is_high_risk(self.risk_level)
    }

    pub fn needs_alert(&self) -> bool {
        needs_alert(self.risk_level)
    }

    pub fn is_security_event(&self) -> bool {
        is_security_event(self.event_type)
    }

    pub fn is_sealed(&self) -> bool {
        self.content_hash.is_some()
    }
}

/// Auxiliary payload attached to one record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct AuditDetail {
    #[serde(default)]
    pub record_id: Option<i64>,
    pub detail_type: DetailType,
    pub detail_key: DetailKey,
    pub value: String,
    pub is_sensitive: bool,
    pub is_encrypted: bool,
    pub encrypt_algorithm: Option<EncryptAlgorithm>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditDetail {
    /// The detail type always comes from the key's static declaration.
    pub fn new(key: DetailKey, value: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            record_id: None,
            detail_type: key.detail_type(),
            detail_key: key,
            value: value.into(),
            is_sensitive: false,
            is_encrypted: false,
            encrypt_algorithm: None,
            tenant_id: None,
            created_at,
        }
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_predicates_delegate_to_free_functions() {
        let mut record = AuditRecord::new(
            Utc::now(),
            EventType::DataDelete,
            "Files.remove",
            AuditStatus::Denied,
            RiskLevel::High,
        );
        assert!(record.is_failure());
        assert!(!record.is_success());
        assert!(record.is_high_risk());
        assert!(record.needs_alert());
        assert_eq!(record.category(), EventCategory::Data);
        assert_eq!(record.subcategory(), "Delete");

        record.risk_level = RiskLevel::Medium;
        assert!(!record.is_high_risk());
        assert!(record.needs_alert());
    }

    #[test]
    fn detail_type_follows_key() {
        let detail = AuditDetail::new(DetailKey::ExceptionStack, "{}", Utc::now());
        assert_eq!(detail.detail_type, DetailType::SystemTech);
        assert!(!detail.is_sensitive);
        assert!(!detail.is_encrypted);
    }
}
