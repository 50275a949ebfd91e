//! Captured inputs and outputs of one intercepted invocation.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_secrets::EncryptAlgorithm;

use crate::types::{AuditStatus, EventType, RiskLevel};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRef {
    pub type_name: String,
    pub method_name: String,
}

impl OperationRef {
    pub fn new(type_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method_name: method_name.into(),
        }
    }

    /// `{TypeName}.{method}` using the last path segment of the declaring type.
    pub fn qualified_name(&self) -> String {
        let simple = self
            .type_name
            .rsplit("::")
            .next()
            .unwrap_or(&self.type_name);
        format!("{simple}.{}", self.method_name)
    }
}

/// Per-call overrides supplied by whatever intercepts the call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditPolicy {
    pub operation_name: Option<String>,
    pub event_type: Option<EventType>,
    pub risk_level: Option<RiskLevel>,
    pub condition: Option<String>,
    pub record_params: bool,
    pub record_return_value: bool,
    pub record_exception: bool,
    pub mask_fields: Vec<String>,
    pub encrypt_algorithm: EncryptAlgorithm,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self {
            operation_name: None,
            event_type: None,
            risk_level: None,
            condition: None,
            record_params: true,
            record_return_value: false,
            record_exception: true,
            mask_fields: Vec::new(),
            encrypt_algorithm: EncryptAlgorithm::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub value: Value,
}

impl Parameter {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            value,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturedError {
    pub type_name: String,
    pub message: String,
    pub trace: String,
}

impl CapturedError {
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let mut trace = format!("{}: {err}", std::any::type_name::<E>());
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push_str("\ncaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }

        Self {
            type_name: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            trace,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Actor {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub tenant_id: Option<String>,
    pub session_id: Option<String>,
}

/// Request-scoped metadata; absent for batch jobs and other non-request work.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Transport {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub uri: Option<String>,
    pub http_method: Option<String>,
    pub http_status: Option<u16>,
    pub trace_id: Option<String>,
    pub server_ip: Option<String>,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallContext {
    pub operation: OperationRef,
    pub policy: AuditPolicy,
    pub params: Vec<Parameter>,
    pub return_value: Option<Value>,
    pub error: Option<CapturedError>,
    pub status: AuditStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub actor: Actor,
    pub transport: Option<Transport>,
}

impl CallContext {
    pub fn new(operation: OperationRef, started_at: DateTime<Utc>) -> Self {
        Self {
            operation,
            policy: AuditPolicy::default(),
            params: Vec::new(),
            return_value: None,
            error: None,
            status: AuditStatus::Success,
            started_at,
            elapsed: Duration::ZERO,
            actor: Actor::default(),
            transport: None,
        }
    }

    pub fn with_policy(mut self, policy: AuditPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_param(
        mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        value: Value,
    ) -> Self {
        self.params.push(Parameter::new(name, type_name, value));
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_return_value(mut self, value: Value) -> Self {
        self.return_value = Some(value);
        self
    }

    pub fn with_error(mut self, error: CapturedError) -> Self {
        self.error = Some(error);
        if self.status == AuditStatus::Success {
            self.status = AuditStatus::Failure;
        }
        self
    }

    pub fn with_status(mut self, status: AuditStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.actor.user_id.as_deref()
    }

    pub fn client_ip(&self) -> Option<&str> {
        self.transport.as_ref()?.client_ip.as_deref()
    }

    pub fn uri(&self) -> Option<&str> {
        self.transport.as_ref()?.uri.as_deref()
    }
}
