//! Status, risk, event classification, and detail-key taxonomy.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Success,
    Failure,
    Pending,
    Timeout,
    Cancelled,
    Denied,
}

impl AuditStatus {
    pub const ALL: [AuditStatus; 6] = [
        AuditStatus::Success,
        AuditStatus::Failure,
        AuditStatus::Pending,
        AuditStatus::Timeout,
        AuditStatus::Cancelled,
        AuditStatus::Denied,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Pending => "PENDING",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Denied => "DENIED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }
}

pub fn is_success(status: AuditStatus) -> bool {
    matches!(status, AuditStatus::Success)
}

pub fn is_failure(status: AuditStatus) -> bool {
    matches!(
        status,
        AuditStatus::Failure | AuditStatus::Timeout | AuditStatus::Cancelled | AuditStatus::Denied
    )
}

/// Totally ordered: `Low < Medium < High < Critical`.
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|level| level.code().eq_ignore_ascii_case(code))
    }
}

pub fn is_high_risk(level: RiskLevel) -> bool {
    level >= RiskLevel::High
}

pub fn needs_alert(level: RiskLevel) -> bool {
    level >= RiskLevel::Medium
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Auth,
    Authz,
    Data,
    System,
    Security,
}

impl EventCategory {
    pub fn code(self) -> &'static str {
        match self {
            Self::Auth => "Auth",
            Self::Authz => "Authz",
            Self::Data => "Data",
            Self::System => "System",
            Self::Security => "Security",
        }
    }
}

/// Two-level technical classification of an audited event.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AuthLogin,
    AuthLogout,
    AuthPasswordChange,
    AuthPasswordReset,
    AuthSessionTimeout,
    AuthzPermissionDenied,
    AuthzChange,
    DataCreate,
    DataRead,
    DataUpdate,
    DataDelete,
    DataBatchOperation,
    DataExport,
    DataImport,
    DataSensitiveAccess,
    #[default]
    DataOther,
    SysConfigChange,
    SysServiceControl,
    SysFileOperation,
    SysMaintenance,
    SysExternalRequest,
    SecAttackDetection,
    SecAbnormalBehavior,
}

const EVENT_TYPES: [(EventType, EventCategory, &str); 23] = [
    (EventType::AuthLogin, EventCategory::Auth, "Login"),
    (EventType::AuthLogout, EventCategory::Auth, "Logout"),
    (EventType::AuthPasswordChange, EventCategory::Auth, "PasswordChange"),
    (EventType::AuthPasswordReset, EventCategory::Auth, "PasswordReset"),
    (EventType::AuthSessionTimeout, EventCategory::Auth, "SessionTimeout"),
    (EventType::AuthzPermissionDenied, EventCategory::Authz, "PermissionDenied"),
    (EventType::AuthzChange, EventCategory::Authz, "Change"),
    (EventType::DataCreate, EventCategory::Data, "Create"),
    (EventType::DataRead, EventCategory::Data, "Read"),
    (EventType::DataUpdate, EventCategory::Data, "Update"),
    (EventType::DataDelete, EventCategory::Data, "Delete"),
    (EventType::DataBatchOperation, EventCategory::Data, "BatchOperation"),
    (EventType::DataExport, EventCategory::Data, "Export"),
    (EventType::DataImport, EventCategory::Data, "Import"),
    (EventType::DataSensitiveAccess, EventCategory::Data, "SensitiveAccess"),
    (EventType::DataOther, EventCategory::Data, "Other"),
    (EventType::SysConfigChange, EventCategory::System, "ConfigChange"),
    (EventType::SysServiceControl, EventCategory::System, "ServiceControl"),
    (EventType::SysFileOperation, EventCategory::System, "FileOperation"),
    (EventType::SysMaintenance, EventCategory::System, "Maintenance"),
    (EventType::SysExternalRequest, EventCategory::System, "ExternalRequest"),
    (EventType::SecAttackDetection, EventCategory::Security, "AttackDetection"),
    (EventType::SecAbnormalBehavior, EventCategory::Security, "AbnormalBehavior"),
];

impl EventType {
    fn entry(self) -> &'static (EventType, EventCategory, &'static str) {
        &EVENT_TYPES[self as usize]
    }

    pub fn all() -> impl Iterator<Item = EventType> {
        EVENT_TYPES.iter().map(|(event_type, _, _)| *event_type)
    }

    pub fn category(self) -> EventCategory {
        self.entry().1
    }

    pub fn subcategory(self) -> &'static str {
        self.entry().2
    }

    pub fn from_parts(category: &str, subcategory: &str) -> Option<Self> {
        EVENT_TYPES
            .iter()
            .find(|(_, cat, sub)| cat.code() == category && *sub == subcategory)
            .map(|(event_type, _, _)| *event_type)
    }
}

pub fn is_security_event(event_type: EventType) -> bool {
    event_type.category() == EventCategory::Security
}

pub fn is_high_risk_event(event_type: EventType) -> bool {
    is_security_event(event_type)
        || matches!(
            event_type,
            EventType::DataSensitiveAccess
                | EventType::DataDelete
                | EventType::SysConfigChange
                | EventType::AuthzChange
        )
}

/// Risk implied by the event classification alone.
pub fn risk_for_event(event_type: EventType) -> RiskLevel {
    if is_security_event(event_type) {
        RiskLevel::Critical
    } else if is_high_risk_event(event_type) {
        RiskLevel::High
    } else if event_type.category() == EventCategory::Data {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetailType {
    HttpRequest,
    OperationTarget,
    DataChange,
    SystemTech,
    Security,
}

impl DetailType {
    pub const ALL: [DetailType; 5] = [
        DetailType::HttpRequest,
        DetailType::OperationTarget,
        DetailType::DataChange,
        DetailType::SystemTech,
        DetailType::Security,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::HttpRequest => "HTTP_REQUEST",
            Self::OperationTarget => "OPERATION_TARGET",
            Self::DataChange => "DATA_CHANGE",
            Self::SystemTech => "SYSTEM_TECH",
            Self::Security => "SECURITY",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetailKey {
    RequestParams,
    RequestHeaders,
    ResponseResult,
    ResponseHeaders,
    TargetInfo,
    OperationContext,
    BusinessData,
    DataChangeBefore,
    DataChangeAfter,
    DataChangeDiff,
    SqlStatement,
    SqlParameters,
    SystemEnv,
    PerformanceMetrics,
    ErrorDetail,
    ExceptionStack,
    DebugInfo,
    SecurityContext,
    PermissionCheck,
    RiskAssessment,
    ThreatIndicators,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetailKeySpec {
    pub key: DetailKey,
    pub code: &'static str,
    pub detail_type: DetailType,
    pub sensitive: bool,
    pub encrypted: bool,
}

const fn spec(
    key: DetailKey,
    code: &'static str,
    detail_type: DetailType,
    sensitive: bool,
    encrypted: bool,
) -> DetailKeySpec {
    DetailKeySpec {
        key,
        code,
        detail_type,
        sensitive,
        encrypted,
    }
}

// Indexed by discriminant.
pub const DETAIL_KEYS: [DetailKeySpec; 21] = [
    spec(DetailKey::RequestParams, "REQUEST_PARAMS", DetailType::HttpRequest, true, false),
    spec(DetailKey::RequestHeaders, "REQUEST_HEADERS", DetailType::HttpRequest, false, false),
    spec(DetailKey::ResponseResult, "RESPONSE_RESULT", DetailType::HttpRequest, false, false),
    spec(DetailKey::ResponseHeaders, "RESPONSE_HEADERS", DetailType::HttpRequest, false, true),
    spec(DetailKey::TargetInfo, "TARGET_INFO", DetailType::OperationTarget, false, false),
    spec(DetailKey::OperationContext, "OPERATION_CONTEXT", DetailType::OperationTarget, false, false),
    spec(DetailKey::BusinessData, "BUSINESS_DATA", DetailType::OperationTarget, true, false),
    spec(DetailKey::DataChangeBefore, "DATA_CHANGE_BEFORE", DetailType::DataChange, true, false),
    spec(DetailKey::DataChangeAfter, "DATA_CHANGE_AFTER", DetailType::DataChange, true, false),
    spec(DetailKey::DataChangeDiff, "DATA_CHANGE_DIFF", DetailType::DataChange, false, false),
    spec(DetailKey::SqlStatement, "SQL_STATEMENT", DetailType::DataChange, false, false),
    spec(DetailKey::SqlParameters, "SQL_PARAMETERS", DetailType::DataChange, true, false),
    spec(DetailKey::SystemEnv, "SYSTEM_ENV", DetailType::SystemTech, false, false),
    spec(DetailKey::PerformanceMetrics, "PERFORMANCE_METRICS", DetailType::SystemTech, false, false),
    spec(DetailKey::ErrorDetail, "ERROR_DETAIL", DetailType::SystemTech, false, false),
    spec(DetailKey::ExceptionStack, "EXCEPTION_STACK", DetailType::SystemTech, false, false),
    spec(DetailKey::DebugInfo, "DEBUG_INFO", DetailType::SystemTech, false, false),
    spec(DetailKey::SecurityContext, "SECURITY_CONTEXT", DetailType::Security, true, false),
    spec(DetailKey::PermissionCheck, "PERMISSION_CHECK", DetailType::Security, false, false),
    spec(DetailKey::RiskAssessment, "RISK_ASSESSMENT", DetailType::Security, false, false),
    spec(DetailKey::ThreatIndicators, "THREAT_INDICATORS", DetailType::Security, true, false),
];

impl DetailKey {
    pub fn spec(self) -> &'static DetailKeySpec {
        &DETAIL_KEYS[self as usize]
    }

    pub fn code(self) -> &'static str {
        self.spec().code
    }

    pub fn detail_type(self) -> DetailType {
        self.spec().detail_type
    }

    pub fn is_sensitive(self) -> bool {
        self.spec().sensitive
    }

    pub fn is_encrypted_by_default(self) -> bool {
        self.spec().encrypted
    }

    pub fn from_code(code: &str) -> Option<Self> {
        DETAIL_KEYS
            .iter()
            .find(|entry| entry.code == code)
            .map(|entry| entry.key)
    }

    pub fn keys_for(detail_type: DetailType) -> impl Iterator<Item = DetailKey> {
        DETAIL_KEYS
            .iter()
            .filter(move |entry| entry.detail_type == detail_type)
            .map(|entry| entry.key)
    }
}
