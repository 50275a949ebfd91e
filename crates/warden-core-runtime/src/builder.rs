//! Turns a call context into an audit record and its details.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use warden_audit::{
    classify, AuditDetail, AuditRecord, CallContext, DetailKey, MAX_USER_AGENT,
};
use warden_secrets::{mask, AesGcmFieldEncryptor, EncryptAlgorithm, FieldEncryptor, MaskFields};

use crate::config::DEFAULT_TRANSPORT_PREFIXES;

/// Why a single detail was left out of a record.
#[derive(Debug, Error)]
pub enum DetailError {
    #[error("serialization failed: {0}")]
    Serialize(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
}

pub struct EventBuilder<E = AesGcmFieldEncryptor> {
    encryptor: E,
    mask_fields: MaskFields,
    transport_prefixes: Vec<String>,
    app_name: Option<String>,
}

impl<E: FieldEncryptor> EventBuilder<E> {
    pub fn new(encryptor: E) -> Self {
        Self {
            encryptor,
            mask_fields: MaskFields::with_defaults(),
            transport_prefixes: DEFAULT_TRANSPORT_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            app_name: None,
        }
    }

    /// Extra globally masked fields, on top of the built-in ones.
    pub fn with_mask_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.mask_fields = self.mask_fields.with(fields);
        self
    }

    /// Parameters whose declared type starts with one of these are never recorded.
    pub fn with_transport_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.transport_prefixes = prefixes;
        self
    }

    pub fn with_app_name(mut self, app_name: Option<String>) -> Self {
        self.app_name = app_name;
        self
    }

    pub fn build(&self, ctx: &CallContext) -> (AuditRecord, Vec<AuditDetail>) {
        let record = self.build_record(ctx);
        let details = self.build_details(ctx, Utc::now());
        (record, details)
    }

    fn build_record(&self, ctx: &CallContext) -> AuditRecord {
        let class = classify(ctx);
        let mut record = AuditRecord::new(
            ctx.started_at,
            class.event_type,
            class.operation_name,
            ctx.status,
            class.risk_level,
        );

        record.user_id = ctx.actor.user_id.clone();
        record.user_name = ctx.actor.user_name.clone();
        record.tenant_id = ctx.actor.tenant_id.clone();
        record.session_id = ctx.actor.session_id.clone();
        if let Some(transport) = &ctx.transport {
            record.client_ip = transport.client_ip.clone();
            record.user_agent = transport
                .user_agent
                .as_deref()
                .map(|ua| ua.chars().take(MAX_USER_AGENT).collect());
            record.uri = transport.uri.clone();
            record.http_method = transport.http_method.clone();
            record.http_status = transport.http_status;
            record.trace_id = transport.trace_id.clone();
            record.server_ip = transport.server_ip.clone();
        }
        record.app_name = self.app_name.clone();
        record.elapsed_ms = i64::try_from(ctx.elapsed.as_millis()).unwrap_or(i64::MAX);
        record
    }

    fn build_details(&self, ctx: &CallContext, now: DateTime<Utc>) -> Vec<AuditDetail> {
        let fields = self.mask_fields.clone().with(&ctx.policy.mask_fields);
        let algorithm = ctx.policy.encrypt_algorithm;
        let mut payloads: Vec<(DetailKey, Value)> = Vec::new();

        if ctx.policy.record_params {
            let params: Map<String, Value> = ctx
                .params
                .iter()
                .filter(|param| !self.is_transport_artifact(&param.type_name))
                .map(|param| (param.name.clone(), param.value.clone()))
                .collect();
            if !params.is_empty() {
                payloads.push((DetailKey::RequestParams, Value::Object(params)));
            }
        }

        if ctx.policy.record_return_value {
            if let Some(result) = ctx.return_value.as_ref().filter(|v| !v.is_null()) {
                payloads.push((DetailKey::ResponseResult, result.clone()));
            }
        }

        if let Some(transport) = &ctx.transport {
            if !transport.request_headers.is_empty() {
                payloads.push((DetailKey::RequestHeaders, headers(&transport.request_headers)));
            }
            if !transport.response_headers.is_empty() {
                payloads.push((
                    DetailKey::ResponseHeaders,
                    headers(&transport.response_headers),
                ));
            }
        }

        if ctx.policy.record_exception {
            if let Some(error) = &ctx.error {
                payloads.push((
                    DetailKey::ErrorDetail,
                    serde_json::json!({
                        "type": error.type_name,
                        "message": error.message,
                    }),
                ));
                payloads.push((
                    DetailKey::ExceptionStack,
                    serde_json::json!({
                        "type": error.type_name,
                        "message": error.message,
                        "stackTrace": error.trace,
                    }),
                ));
            }
        }

        payloads
            .into_iter()
            .filter_map(|(key, payload)| {
                match self.detail(key, payload, &fields, algorithm, now) {
                    Ok(detail) => Some(detail.with_tenant(ctx.actor.tenant_id.clone())),
                    Err(err) => {
                        tracing::warn!(
                            detail = key.code(),
                            operation = %ctx.operation.qualified_name(),
                            error = %err,
                            "audit detail skipped"
                        );
                        None
                    }
                }
            })
            .collect()
    }

    /// Masks sensitive keys, then encrypts keys that are encrypted by default.
    pub fn detail(
        &self,
        key: DetailKey,
        payload: Value,
        fields: &MaskFields,
        algorithm: EncryptAlgorithm,
        now: DateTime<Utc>,
    ) -> Result<AuditDetail, DetailError> {
        let (payload, redacted) = if key.is_sensitive() {
            if !matches!(payload, Value::Object(_) | Value::Array(_) | Value::Null) {
                tracing::warn!(
                    detail = key.code(),
                    "sensitive payload has no field names to mask, stored as is"
                );
            }
            let masked = mask(payload, fields);
            let altered = masked.altered();
            (masked.value, altered)
        } else {
            (payload, false)
        };

        let text =
            serde_json::to_string(&payload).map_err(|e| DetailError::Serialize(e.to_string()))?;

        let mut detail = if key.is_encrypted_by_default() {
            let sealed = self
                .encryptor
                .encrypt(&text, algorithm)
                .map_err(|e| DetailError::Encrypt(e.to_string()))?;
            let mut detail = AuditDetail::new(key, sealed, now);
            detail.is_encrypted = true;
            detail.encrypt_algorithm = Some(algorithm);
            detail
        } else {
            AuditDetail::new(key, text, now)
        };
        detail.is_sensitive = redacted;
        Ok(detail)
    }

    fn is_transport_artifact(&self, type_name: &str) -> bool {
        self.transport_prefixes
            .iter()
            .any(|prefix| type_name.starts_with(prefix.as_str()))
    }
}

fn headers(map: &std::collections::BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fmt;
    use std::time::Duration;

    use serde_json::json;
    use warden_audit::{
        Actor, AuditPolicy, AuditStatus, CapturedError, DetailType, EventType, OperationRef,
        RiskLevel, Transport,
    };
    use warden_secrets::EncryptError;

    use super::*;

    struct FailingEncryptor;

    impl FieldEncryptor for FailingEncryptor {
        fn encrypt(&self, _plaintext: &str, _alg: EncryptAlgorithm) -> Result<String, EncryptError> {
            Err(EncryptError::Cipher("hsm offline".to_string()))
        }
    }

    #[derive(Debug)]
    struct Timeout;

    impl fmt::Display for Timeout {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "upstream timed out")
        }
    }

    impl std::error::Error for Timeout {}

    fn builder() -> EventBuilder {
        EventBuilder::new(AesGcmFieldEncryptor::new([3u8; 32]))
    }

    fn ctx() -> CallContext {
        CallContext::new(OperationRef::new("app::UserService", "updateProfile"), Utc::now())
            .with_actor(Actor {
                user_id: Some("u-17".to_string()),
                tenant_id: Some("acme".to_string()),
                ..Actor::default()
            })
            .with_param("req", "axum::extract::Request", json!("opaque"))
            .with_param("profile", "Profile", json!({"name": "ana", "password": "hunter2"}))
            .with_elapsed(Duration::from_millis(42))
    }

    fn find(details: &[AuditDetail], key: DetailKey) -> Option<&AuditDetail> {
        details.iter().find(|d| d.detail_key == key)
    }

    #[test]
    fn record_fields_come_from_context() {
        let call = ctx().with_transport(Transport {
            client_ip: Some("10.1.1.1".to_string()),
            user_agent: Some("x".repeat(300)),
            uri: Some("/profile".to_string()),
            http_method: Some("PUT".to_string()),
            ..Transport::default()
        });
        let (record, _) = builder().with_app_name(Some("crm".to_string())).build(&call);

        assert_eq!(record.operation_name, "UserService.updateProfile");
        assert_eq!(record.event_type, EventType::DataUpdate);
        assert_eq!(record.risk_level, RiskLevel::Medium);
        assert_eq!(record.status, AuditStatus::Success);
        assert_eq!(record.user_id.as_deref(), Some("u-17"));
        assert_eq!(record.client_ip.as_deref(), Some("10.1.1.1"));
        assert_eq!(record.user_agent.as_ref().map(|ua| ua.len()), Some(MAX_USER_AGENT));
        assert_eq!(record.app_name.as_deref(), Some("crm"));
        assert_eq!(record.elapsed_ms, 42);
        assert!(record.content_hash.is_none());
        warden_audit::validate_record(&record).expect("valid");
    }

    #[test]
    fn sensitive_params_are_masked_and_artifacts_skipped() {
        let (_, details) = builder().build(&ctx());
        let params = find(&details, DetailKey::RequestParams).expect("params detail");

        assert!(!params.value.contains("hunter2"));
        assert!(!params.value.contains("opaque"));
        assert!(params.value.contains("ana"));
        assert!(params.is_sensitive);
        assert!(!params.is_encrypted);
        assert_eq!(params.detail_type, DetailType::HttpRequest);
        assert_eq!(params.tenant_id.as_deref(), Some("acme"));
    }

    #[test]
    fn sensitive_flag_only_set_when_something_was_redacted() {
        let call = CallContext::new(OperationRef::new("Svc", "listUsers"), Utc::now())
            .with_param("page", "u32", json!(2));
        let (_, details) = builder().build(&call);
        let params = find(&details, DetailKey::RequestParams).expect("params detail");
        assert!(!params.is_sensitive);
        assert_eq!(params.value, r#"{"page":2}"#);
    }

    #[test]
    fn per_call_mask_fields_are_unioned() {
        let call = ctx()
            .with_param("card", "Card", json!({"pan": "4111111111111111"}))
            .with_policy(AuditPolicy {
                mask_fields: vec!["PAN".to_string()],
                ..AuditPolicy::default()
            });
        let (_, details) = builder().build(&call);
        let params = find(&details, DetailKey::RequestParams).expect("params detail");
        assert!(!params.value.contains("4111111111111111"));
        assert!(!params.value.contains("hunter2"));
    }

    #[test]
    fn record_params_false_skips_params() {
        let call = ctx().with_policy(AuditPolicy {
            record_params: false,
            ..AuditPolicy::default()
        });
        let (_, details) = builder().build(&call);
        assert!(find(&details, DetailKey::RequestParams).is_none());
    }

    #[test]
    fn return_value_recorded_only_when_enabled() {
        let call = ctx().with_return_value(json!({"id": 7}));
        let (_, details) = builder().build(&call);
        assert!(find(&details, DetailKey::ResponseResult).is_none());

        let call = call.with_policy(AuditPolicy {
            record_return_value: true,
            ..AuditPolicy::default()
        });
        let (_, details) = builder().build(&call);
        assert_eq!(
            find(&details, DetailKey::ResponseResult).map(|d| d.value.as_str()),
            Some(r#"{"id":7}"#)
        );
    }

    #[test]
    fn response_headers_are_encrypted() {
        let encryptor = AesGcmFieldEncryptor::new([3u8; 32]);
        let mut response_headers = BTreeMap::new();
        response_headers.insert("set-cookie".to_string(), "sid=abc".to_string());
        let call = ctx().with_transport(Transport {
            response_headers,
            ..Transport::default()
        });
        let (_, details) = builder().build(&call);
        let detail = find(&details, DetailKey::ResponseHeaders).expect("headers detail");

        let plaintext = r#"{"set-cookie":"sid=abc"}"#;
        assert!(detail.is_encrypted);
        assert_eq!(detail.encrypt_algorithm, Some(EncryptAlgorithm::Aes256Gcm));
        assert_ne!(detail.value, plaintext);
        assert_eq!(
            encryptor
                .decrypt(&detail.value, EncryptAlgorithm::Aes256Gcm)
                .expect("decrypt"),
            plaintext
        );
    }

    #[test]
    fn failed_call_produces_one_exception_trace() {
        let call = ctx().with_error(CapturedError::from_error(&Timeout));
        let (record, details) = builder().build(&call);

        assert!(record.is_failure());
        let stacks: Vec<_> = details
            .iter()
            .filter(|d| d.detail_key == DetailKey::ExceptionStack)
            .collect();
        assert_eq!(stacks.len(), 1);
        assert!(stacks[0].value.contains("Timeout"));
        assert!(stacks[0].value.contains("upstream timed out"));
        assert!(find(&details, DetailKey::ErrorDetail).is_some());
    }

    #[test]
    fn record_exception_false_skips_error_details() {
        let call = ctx()
            .with_error(CapturedError::from_error(&Timeout))
            .with_policy(AuditPolicy {
                record_exception: false,
                ..AuditPolicy::default()
            });
        let (_, details) = builder().build(&call);
        assert!(find(&details, DetailKey::ExceptionStack).is_none());
        assert!(find(&details, DetailKey::ErrorDetail).is_none());
    }

    #[test]
    fn scalar_sensitive_payload_is_kept_unmasked() {
        let detail = builder()
            .detail(
                DetailKey::BusinessData,
                json!("4111111111111111"),
                &MaskFields::with_defaults(),
                EncryptAlgorithm::Aes256Gcm,
                Utc::now(),
            )
            .expect("detail");
        assert_eq!(detail.value, r#""4111111111111111""#);
        assert!(!detail.is_sensitive);
        assert!(!detail.is_encrypted);
    }

    #[test]
    fn failing_detail_is_skipped_without_losing_the_rest() {
        let mut request_headers = BTreeMap::new();
        request_headers.insert("accept".to_string(), "json".to_string());
        let mut response_headers = BTreeMap::new();
        response_headers.insert("x-id".to_string(), "1".to_string());
        let call = ctx().with_transport(Transport {
            request_headers,
            response_headers,
            ..Transport::default()
        });

        let (record, details) = EventBuilder::new(FailingEncryptor).build(&call);
        assert_eq!(record.operation_name, "UserService.updateProfile");
        assert!(find(&details, DetailKey::ResponseHeaders).is_none());
        assert!(find(&details, DetailKey::RequestHeaders).is_some());
        assert!(find(&details, DetailKey::RequestParams).is_some());
    }
}
