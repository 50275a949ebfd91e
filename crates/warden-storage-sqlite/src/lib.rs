//! SQLite audit storage. A record and its details are written in one transaction.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use warden_audit::{
    validate_detail, validate_record, AuditDetail, AuditError, AuditRecord, AuditStatus,
    AuditStorage, DetailKey, DetailType, EventType, RiskLevel,
};
use warden_secrets::EncryptAlgorithm;

#[derive(Clone, Debug)]
pub struct SqliteAuditStorage {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct AuditLogRow {
    id: i64,
    event_time: String,
    category: String,
    subcategory: String,
    operation_name: String,
    status: String,
    risk_level: String,
    user_id: Option<String>,
    user_name: Option<String>,
    tenant_id: Option<String>,
    session_id: Option<String>,
    client_ip: Option<String>,
    user_agent: Option<String>,
    uri: Option<String>,
    http_method: Option<String>,
    http_status: Option<i64>,
    trace_id: Option<String>,
    server_ip: Option<String>,
    app_name: Option<String>,
    elapsed_ms: i64,
    content_hash: Option<String>,
    prev_hash: Option<String>,
    signature: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct AuditDetailRow {
    audit_log_id: i64,
    detail_type: String,
    detail_key: String,
    detail_value: String,
    is_sensitive: i64,
    is_encrypted: i64,
    encrypt_algorithm: Option<String>,
    tenant_id: Option<String>,
    created_at: String,
}

impl TryFrom<AuditLogRow> for AuditRecord {
    type Error = AuditError;

    fn try_from(row: AuditLogRow) -> Result<Self, Self::Error> {
        let event_type = EventType::from_parts(&row.category, &row.subcategory).ok_or_else(|| {
            AuditError::Storage(format!(
                "unknown event type {}/{} in row {}",
                row.category, row.subcategory, row.id
            ))
        })?;
        let status = AuditStatus::from_code(&row.status)
            .ok_or_else(|| AuditError::Storage(format!("unknown status '{}'", row.status)))?;
        let risk_level = RiskLevel::from_code(&row.risk_level).ok_or_else(|| {
            AuditError::Storage(format!("unknown risk level '{}'", row.risk_level))
        })?;
        let http_status = row
            .http_status
            .map(u16::try_from)
            .transpose()
            .map_err(|e| AuditError::Storage(format!("invalid http_status: {e}")))?;

        Ok(AuditRecord {
            id: Some(row.id),
            event_time: parse_time(&row.event_time)?,
            event_type,
            operation_name: row.operation_name,
            status,
            risk_level,
            user_id: row.user_id,
            user_name: row.user_name,
            tenant_id: row.tenant_id,
            session_id: row.session_id,
            client_ip: row.client_ip,
            user_agent: row.user_agent,
            uri: row.uri,
            http_method: row.http_method,
            http_status,
            trace_id: row.trace_id,
            server_ip: row.server_ip,
            app_name: row.app_name,
            elapsed_ms: row.elapsed_ms,
            content_hash: row.content_hash,
            prev_hash: row.prev_hash,
            signature: row.signature,
        })
    }
}

impl TryFrom<AuditDetailRow> for AuditDetail {
    type Error = AuditError;

    fn try_from(row: AuditDetailRow) -> Result<Self, Self::Error> {
        let detail_key = DetailKey::from_code(&row.detail_key)
            .ok_or_else(|| AuditError::Storage(format!("unknown detail key '{}'", row.detail_key)))?;
        let detail_type = DetailType::from_code(&row.detail_type).ok_or_else(|| {
            AuditError::Storage(format!("unknown detail type '{}'", row.detail_type))
        })?;
        let encrypt_algorithm = row
            .encrypt_algorithm
            .as_deref()
            .map(|code| {
                EncryptAlgorithm::from_code(code)
                    .ok_or_else(|| AuditError::Storage(format!("unknown algorithm '{code}'")))
            })
            .transpose()?;

        Ok(AuditDetail {
            record_id: Some(row.audit_log_id),
            detail_type,
            detail_key,
            value: row.detail_value,
            is_sensitive: row.is_sensitive != 0,
            is_encrypted: row.is_encrypted != 0,
            encrypt_algorithm,
            tenant_id: row.tenant_id,
            created_at: parse_time(&row.created_at)?,
        })
    }
}

impl SqliteAuditStorage {
    /// Opens (creating if needed) the database at `url` and applies migrations.
    pub async fn connect(url: &str) -> Result<Self, AuditError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| AuditError::Unavailable(format!("invalid database url '{url}': {e}")))?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database.
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| db_error("failed to open database", e))?;

        let storage = Self::new(pool);
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), AuditError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AuditError::Storage(format!("migration failed: {e}")))
    }

    /// Content hash of the newest record, used to resume the chain.
    pub async fn last_content_hash(&self) -> Result<Option<String>, AuditError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT content_hash FROM audit_log ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("failed to read chain head", e))?;
        Ok(row.and_then(|(hash,)| hash))
    }

    /// Every record in insertion order.
    pub async fn load_chain(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let rows: Vec<AuditLogRow> = sqlx::query_as(
            r#"SELECT id, event_time, category, subcategory, operation_name, status,
                risk_level, user_id, user_name, tenant_id, session_id, client_ip,
                user_agent, uri, http_method, http_status, trace_id, server_ip,
                app_name, elapsed_ms, content_hash, prev_hash, signature
            FROM audit_log ORDER BY id ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("failed to load audit records", e))?;

        rows.into_iter().map(AuditRecord::try_from).collect()
    }

    pub async fn load_details(&self, record_id: i64) -> Result<Vec<AuditDetail>, AuditError> {
        let rows: Vec<AuditDetailRow> = sqlx::query_as(
            r#"SELECT audit_log_id, detail_type, detail_key, detail_value, is_sensitive,
                is_encrypted, encrypt_algorithm, tenant_id, created_at
            FROM audit_detail WHERE audit_log_id = ? ORDER BY id ASC"#,
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("failed to load audit details", e))?;

        rows.into_iter().map(AuditDetail::try_from).collect()
    }

    pub async fn count(&self) -> Result<i64, AuditError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("failed to count audit records", e))?;
        Ok(count)
    }
}

#[async_trait]
impl AuditStorage for SqliteAuditStorage {
    async fn save(
        &self,
        record: AuditRecord,
        details: Vec<AuditDetail>,
    ) -> Result<AuditRecord, AuditError> {
        validate_record(&record)?;
        for detail in &details {
            validate_detail(detail)?;
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("failed to begin transaction", e))?;

        let result = sqlx::query(
            r#"INSERT INTO audit_log (
                event_time, category, subcategory, operation_name, status, risk_level,
                user_id, user_name, tenant_id, session_id, client_ip, user_agent,
                uri, http_method, http_status, trace_id, server_ip, app_name,
                elapsed_ms, content_hash, prev_hash, signature
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(format_time(&record.event_time))
        .bind(record.category().code())
        .bind(record.subcategory())
        .bind(&record.operation_name)
        .bind(record.status.code())
        .bind(record.risk_level.code())
        .bind(&record.user_id)
        .bind(&record.user_name)
        .bind(&record.tenant_id)
        .bind(&record.session_id)
        .bind(&record.client_ip)
        .bind(&record.user_agent)
        .bind(&record.uri)
        .bind(&record.http_method)
        .bind(record.http_status.map(i64::from))
        .bind(&record.trace_id)
        .bind(&record.server_ip)
        .bind(&record.app_name)
        .bind(record.elapsed_ms)
        .bind(&record.content_hash)
        .bind(&record.prev_hash)
        .bind(&record.signature)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("failed to insert audit record", e))?;
        let id = result.last_insert_rowid();

        for detail in &details {
            sqlx::query(
                r#"INSERT INTO audit_detail (
                    audit_log_id, detail_type, detail_key, detail_value, is_sensitive,
                    is_encrypted, encrypt_algorithm, tenant_id, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(id)
            .bind(detail.detail_type.code())
            .bind(detail.detail_key.code())
            .bind(&detail.value)
            .bind(i64::from(detail.is_sensitive))
            .bind(i64::from(detail.is_encrypted))
            .bind(detail.encrypt_algorithm.map(|alg| alg.code()))
            .bind(&detail.tenant_id)
            .bind(format_time(&detail.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("failed to insert audit detail", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("failed to commit audit record", e))?;

        tracing::debug!(id, details = details.len(), "audit record stored");
        Ok(AuditRecord {
            id: Some(id),
            ..record
        })
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, AuditError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuditError::Storage(format!("failed to parse timestamp '{raw}': {e}")))
}

fn db_error(context: &str, err: sqlx::Error) -> AuditError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            AuditError::Unavailable(format!("{context}: {err}"))
        }
        other => AuditError::Storage(format!("{context}: {other}")),
    }
}
