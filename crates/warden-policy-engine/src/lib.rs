//! Decides, per invocation, whether an audit record is produced.

pub mod condition;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_audit::{classify, CallContext, RiskLevel};

pub use condition::{Condition, ConditionError, VariableScope};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

pub type PolicyResult<T> = Result<T, PolicyError>;

pub trait AuditFilter: Send + Sync {
    fn should_record(&self, ctx: &CallContext) -> bool;
}

/// Filter that records everything.
#[derive(Clone, Debug, Default)]
pub struct RecordAllFilter;

impl AuditFilter for RecordAllFilter {
    fn should_record(&self, _ctx: &CallContext) -> bool {
        true
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct FilterRules {
    pub ignore_users: Vec<String>,
    pub ignore_ips: Vec<String>,
    pub ignore_uri_patterns: Vec<String>,
    pub min_risk_level: RiskLevel,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            ignore_users: vec!["system".to_string(), "admin".to_string()],
            ignore_ips: vec!["127.0.0.1".to_string(), "::1".to_string()],
            ignore_uri_patterns: vec![
                "/health/**".to_string(),
                "/actuator/**".to_string(),
                "/favicon.ico".to_string(),
            ],
            min_risk_level: RiskLevel::Low,
        }
    }
}

impl FilterRules {
    /// Rules that ignore nothing.
    pub fn permissive() -> Self {
        Self {
            ignore_users: Vec::new(),
            ignore_ips: Vec::new(),
            ignore_uri_patterns: Vec::new(),
            min_risk_level: RiskLevel::Low,
        }
    }
}

/// Ignore lists, a risk floor, then the call's own condition; checked in that order.
#[derive(Debug)]
pub struct ConditionFilter {
    ignore_users: HashSet<String>,
    ignore_ips: HashSet<String>,
    ignore_uris: GlobSet,
    min_risk_level: RiskLevel,
    parsed: RwLock<HashMap<String, Arc<Result<Condition, ConditionError>>>>,
}

impl ConditionFilter {
    pub fn new(rules: &FilterRules) -> PolicyResult<Self> {
        Ok(Self {
            ignore_users: rules.ignore_users.iter().cloned().collect(),
            ignore_ips: rules.ignore_ips.iter().cloned().collect(),
            ignore_uris: build_uri_set(&rules.ignore_uri_patterns)?,
            min_risk_level: rules.min_risk_level,
            parsed: RwLock::new(HashMap::new()),
        })
    }

    pub fn min_risk_level(&self) -> RiskLevel {
        self.min_risk_level
    }

    fn condition(&self, source: &str) -> Arc<Result<Condition, ConditionError>> {
        if let Some(hit) = self.parsed.read().get(source) {
            return Arc::clone(hit);
        }
        let parsed = Arc::new(Condition::parse(source));
        self.parsed
            .write()
            .entry(source.to_string())
            .or_insert(parsed)
            .clone()
    }

    fn evaluate_condition(&self, source: &str, ctx: &CallContext) -> bool {
        let outcome = match self.condition(source).as_ref() {
            Ok(condition) => condition.evaluate(&VariableScope::from_context(ctx)),
            Err(err) => Err(err.clone()),
        };
        match outcome {
            Ok(keep) => keep,
            Err(err) => {
                tracing::warn!(
                    condition = source,
                    operation = %ctx.operation.qualified_name(),
                    error = %err,
                    "audit condition failed; recording anyway"
                );
                true
            }
        }
    }
}

impl AuditFilter for ConditionFilter {
    fn should_record(&self, ctx: &CallContext) -> bool {
        if let Some(user) = ctx.user_id().filter(|u| self.ignore_users.contains(*u)) {
            tracing::debug!(user, "audit skipped: ignored user");
            return false;
        }
        if let Some(ip) = ctx.client_ip().filter(|ip| self.ignore_ips.contains(*ip)) {
            tracing::debug!(ip, "audit skipped: ignored client ip");
            return false;
        }
        if let Some(uri) = ctx.uri().filter(|uri| self.ignore_uris.is_match(uri)) {
            tracing::debug!(uri, "audit skipped: ignored uri");
            return false;
        }

        let risk = classify(ctx).risk_level;
        if risk < self.min_risk_level {
            tracing::debug!(
                risk = risk.code(),
                floor = self.min_risk_level.code(),
                "audit skipped: below risk floor"
            );
            return false;
        }

        match ctx.policy.condition.as_deref().map(str::trim) {
            Some(source) if !source.is_empty() => self.evaluate_condition(source, ctx),
            _ => true,
        }
    }
}

fn build_uri_set(patterns: &[String]) -> PolicyResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        add_glob(&mut builder, pattern)?;
        // "/health/**" also covers "/health" itself.
        if let Some(prefix) = pattern.strip_suffix("/**") {
            if !prefix.is_empty() {
                add_glob(&mut builder, prefix)?;
            }
        }
    }
    builder
        .build()
        .map_err(|e| PolicyError::InvalidPattern(format!("failed to build uri globset: {e}")))
}

fn add_glob(builder: &mut GlobSetBuilder, pattern: &str) -> PolicyResult<()> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| PolicyError::InvalidPattern(format!("invalid uri pattern '{pattern}': {e}")))?;
    builder.add(glob);
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use warden_audit::{Actor, AuditPolicy, EventType, OperationRef, Transport};

    use super::*;

    fn ctx(method: &str) -> CallContext {
        CallContext::new(OperationRef::new("OrderService", method), Utc::now())
    }

    fn with_transport(ctx: CallContext, ip: &str, uri: &str) -> CallContext {
        ctx.with_transport(Transport {
            client_ip: Some(ip.to_string()),
            uri: Some(uri.to_string()),
            ..Transport::default()
        })
    }

    fn with_condition(ctx: CallContext, condition: &str) -> CallContext {
        ctx.with_policy(AuditPolicy {
            condition: Some(condition.to_string()),
            ..AuditPolicy::default()
        })
    }

    fn default_filter() -> ConditionFilter {
        ConditionFilter::new(&FilterRules::default()).expect("filter")
    }

    #[test]
    fn ignored_users_are_dropped() {
        let filter = default_filter();
        let call = ctx("updateOrder").with_actor(Actor {
            user_id: Some("system".to_string()),
            ..Actor::default()
        });
        assert!(!filter.should_record(&call));
    }

    #[test]
    fn ignored_ips_are_dropped() {
        let filter = default_filter();
        assert!(!filter.should_record(&with_transport(ctx("updateOrder"), "::1", "/orders")));
        assert!(filter.should_record(&with_transport(ctx("updateOrder"), "10.0.0.8", "/orders")));
    }

    #[test]
    fn uri_globs_cross_segments_and_cover_prefix() {
        let filter = default_filter();
        for uri in ["/health", "/health/live", "/actuator/metrics/jvm", "/favicon.ico"] {
            assert!(
                !filter.should_record(&with_transport(ctx("getStatus"), "10.0.0.1", uri)),
                "{uri} should be ignored"
            );
        }
        assert!(filter.should_record(&with_transport(ctx("getStatus"), "10.0.0.1", "/healthz")));
    }

    #[test]
    fn risk_floor_uses_effective_level() {
        let rules = FilterRules {
            min_risk_level: RiskLevel::Medium,
            ..FilterRules::permissive()
        };
        let filter = ConditionFilter::new(&rules).expect("filter");

        let low = ctx("run").with_policy(AuditPolicy {
            event_type: Some(EventType::SysMaintenance),
            ..AuditPolicy::default()
        });
        assert!(!filter.should_record(&low));

        let high = ctx("run").with_policy(AuditPolicy {
            risk_level: Some(RiskLevel::High),
            event_type: Some(EventType::SysMaintenance),
            ..AuditPolicy::default()
        });
        assert!(filter.should_record(&high));

        // "delete" infers DataDelete, which is high risk.
        assert!(filter.should_record(&ctx("deleteOrder")));
    }

    #[test]
    fn condition_sees_params_and_result() {
        let filter = ConditionFilter::new(&FilterRules::permissive()).expect("filter");
        let call = with_condition(
            ctx("updateOrder").with_param("amount", "u64", json!(50)),
            "#amount > 100 || #result.flagged == true",
        );
        assert!(!filter.should_record(&call));
        assert!(filter.should_record(&call.with_return_value(json!({"flagged": true}))));
    }

    #[test]
    fn broken_condition_fails_open() {
        let filter = ConditionFilter::new(&FilterRules::permissive()).expect("filter");
        assert!(filter.should_record(&with_condition(ctx("updateOrder"), "#amount >")));
        assert!(filter.should_record(&with_condition(
            ctx("updateOrder").with_param("amount", "u64", json!(5)),
            "#amount"
        )));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let rules = FilterRules {
            ignore_uri_patterns: vec!["/api/[".to_string()],
            ..FilterRules::permissive()
        };
        assert!(matches!(
            ConditionFilter::new(&rules),
            Err(PolicyError::InvalidPattern(_))
        ));
    }

    #[test]
    fn record_all_filter_keeps_everything() {
        assert!(RecordAllFilter.should_record(&ctx("anything")));
    }
}
