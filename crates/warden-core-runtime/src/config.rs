//! Pipeline configuration: YAML file plus `WARDEN_AUDIT_*` environment overrides.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_audit::RiskLevel;
use warden_policy_engine::FilterRules;

pub const ENV_ENABLED: &str = "WARDEN_AUDIT_ENABLED";
pub const ENV_STORAGE: &str = "WARDEN_AUDIT_STORAGE";
pub const ENV_DATABASE_URL: &str = "WARDEN_AUDIT_DATABASE_URL";
pub const ENV_MIN_RISK_LEVEL: &str = "WARDEN_AUDIT_MIN_RISK_LEVEL";
pub const ENV_ENCRYPTION_KEY: &str = "WARDEN_AUDIT_ENCRYPTION_KEY";
pub const ENV_SIGNING_KEY: &str = "WARDEN_AUDIT_SIGNING_KEY";

pub const DEFAULT_TRANSPORT_PREFIXES: [&str; 5] =
    ["http::", "axum::", "hyper::", "tower::", "actix_web::"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed: {0}")]
    Io(String),
    #[error("config parse failed: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Database,
    Noop,
}

impl StorageBackend {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "database" | "db" | "sqlite" => Some(Self::Database),
            "noop" | "none" => Some(Self::Noop),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Database,
            database_url: "sqlite://warden-audit.db".to_string(),
        }
    }
}

/// Documentary only; cleanup scheduling lives outside the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct RetentionConfig {
    pub days: u32,
    pub auto_cleanup: bool,
    pub cleanup_cron: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 365,
            auto_cleanup: true,
            cleanup_cron: "0 0 2 * * ?".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct SecurityConfig {
    /// Base64 of a 32-byte key. A random per-process key is used when absent.
    pub encryption_key: Option<String>,
    pub signing_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct AuditConfig {
    pub enabled: bool,
    pub app_name: Option<String>,
    pub mask_fields: Vec<String>,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub filter: FilterRules,
    pub dispatcher: DispatcherConfig,
    pub security: SecurityConfig,
    pub transport_type_prefixes: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            app_name: None,
            mask_fields: Vec::new(),
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            filter: FilterRules::default(),
            dispatcher: DispatcherConfig::default(),
            security: SecurityConfig::default(),
            transport_type_prefixes: DEFAULT_TRANSPORT_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl AuditConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&raw)
    }

    /// File (when present), then process environment, then validation.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        let config = base.with_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_ENABLED) {
            self.enabled = parse_bool(&raw).ok_or_else(|| {
                ConfigError::Invalid(format!("{ENV_ENABLED} must be true or false, got '{raw}'"))
            })?;
        }
        if let Some(raw) = lookup(ENV_STORAGE) {
            self.storage.backend = StorageBackend::parse(&raw).ok_or_else(|| {
                ConfigError::Invalid(format!("{ENV_STORAGE} must be database or noop, got '{raw}'"))
            })?;
        }
        if let Some(raw) = lookup(ENV_DATABASE_URL) {
            self.storage.database_url = raw;
        }
        if let Some(raw) = lookup(ENV_MIN_RISK_LEVEL) {
            self.filter.min_risk_level = RiskLevel::from_code(&raw).ok_or_else(|| {
                ConfigError::Invalid(format!("{ENV_MIN_RISK_LEVEL} is not a risk level: '{raw}'"))
            })?;
        }
        if let Some(raw) = lookup(ENV_ENCRYPTION_KEY) {
            self.security.encryption_key = Some(raw);
        }
        if let Some(raw) = lookup(ENV_SIGNING_KEY) {
            self.security.signing_key = Some(raw);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=3650).contains(&self.retention.days) {
            return Err(ConfigError::Invalid(format!(
                "retention.days must be within 1..=3650, got {}",
                self.retention.days
            )));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.queue_capacity must be positive".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Database
            && self.storage.database_url.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "storage.database_url is required for the database backend".to_string(),
            ));
        }
        if self
            .security
            .signing_key
            .as_deref()
            .is_some_and(|key| key.is_empty())
        {
            return Err(ConfigError::Invalid(
                "security.signing_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
