//! Operation naming and event classification shared by filtering and building.

use crate::context::CallContext;
use crate::types::{risk_for_event, EventType, RiskLevel};

/// Scanned in order; the first rule with a matching keyword wins.
pub const KEYWORD_RULES: &[(&[&str], EventType)] = &[
    (&["login", "logout", "auth"], EventType::AuthLogin),
    (&["create", "add", "insert"], EventType::DataCreate),
    (&["update", "modify", "edit"], EventType::DataUpdate),
    (&["delete", "remove"], EventType::DataDelete),
    (&["query", "find", "get", "list"], EventType::DataRead),
];

pub fn infer_event_type(operation_name: &str) -> EventType {
    let normalized = operation_name.to_lowercase();
    KEYWORD_RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|kw| normalized.contains(kw)))
        .map(|(_, event_type)| *event_type)
        .unwrap_or(EventType::DataOther)
}

pub fn resolve_operation_name(ctx: &CallContext) -> String {
    match ctx.policy.operation_name.as_deref() {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => ctx.operation.qualified_name(),
    }
}

/// Explicit override unless it is the `DataOther` placeholder.
pub fn resolve_event_type(ctx: &CallContext, operation_name: &str) -> EventType {
    match ctx.policy.event_type {
        Some(event_type) if event_type != EventType::DataOther => event_type,
        _ => infer_event_type(operation_name),
    }
}

/// Explicit override when above `Low`, otherwise derived from the event type.
pub fn resolve_risk_level(ctx: &CallContext, event_type: EventType) -> RiskLevel {
    match ctx.policy.risk_level {
        Some(level) if level > RiskLevel::Low => level,
        _ => risk_for_event(event_type),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub operation_name: String,
    pub event_type: EventType,
    pub risk_level: RiskLevel,
}

pub fn classify(ctx: &CallContext) -> Classification {
    let operation_name = resolve_operation_name(ctx);
    let event_type = resolve_event_type(ctx, &operation_name);
    let risk_level = resolve_risk_level(ctx, event_type);
    Classification {
        operation_name,
        event_type,
        risk_level,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::context::{AuditPolicy, OperationRef};

    fn ctx(type_name: &str, method: &str) -> CallContext {
        CallContext::new(OperationRef::new(type_name, method), Utc::now())
    }

    #[test]
    fn keyword_scan_is_case_insensitive() {
        assert_eq!(infer_event_type("UserService.LOGIN"), EventType::AuthLogin);
        assert_eq!(infer_event_type("OrderService.addItem"), EventType::DataCreate);
        assert_eq!(infer_event_type("Profile.editBio"), EventType::DataUpdate);
        assert_eq!(infer_event_type("Files.removeAll"), EventType::DataDelete);
        assert_eq!(infer_event_type("Report.listAll"), EventType::DataRead);
        assert_eq!(infer_event_type("Jobs.run"), EventType::DataOther);
    }

    #[test]
    fn first_matching_rule_wins() {
        // "auth" precedes "update" in the table.
        assert_eq!(
            infer_event_type("AuthService.updateToken"),
            EventType::AuthLogin
        );
        // "create" precedes "delete".
        assert_eq!(
            infer_event_type("Batch.createThenDelete"),
            EventType::DataCreate
        );
    }

    #[test]
    fn explicit_overrides_take_precedence() {
        let call = ctx("UserService", "findUser").with_policy(AuditPolicy {
            operation_name: Some("Reset password".to_string()),
            event_type: Some(EventType::AuthPasswordReset),
            risk_level: Some(RiskLevel::Critical),
            ..AuditPolicy::default()
        });
        let class = classify(&call);
        assert_eq!(class.operation_name, "Reset password");
        assert_eq!(class.event_type, EventType::AuthPasswordReset);
        assert_eq!(class.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn placeholder_overrides_fall_back_to_inference() {
        let call = ctx("app::UserService", "deleteUser").with_policy(AuditPolicy {
            event_type: Some(EventType::DataOther),
            risk_level: Some(RiskLevel::Low),
            ..AuditPolicy::default()
        });
        let class = classify(&call);
        assert_eq!(class.operation_name, "UserService.deleteUser");
        assert_eq!(class.event_type, EventType::DataDelete);
        assert_eq!(class.risk_level, RiskLevel::High);
    }
}
