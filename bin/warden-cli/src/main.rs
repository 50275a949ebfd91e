use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use warden_audit::{Actor, AuditPolicy, CallContext, OperationRef, Transport};
use warden_core_runtime::{AuditConfig, AuditPipeline, StorageBackend};
use warden_integrity::{verify_chain, KeyedDigestSigner, RecordSigner};
use warden_secrets::{mask, MaskFields};
use warden_storage_sqlite::SqliteAuditStorage;

#[derive(Clone, Debug, Parser)]
#[command(name = "warden-cli")]
#[command(about = "Audit pipeline tooling: config checks, chain verification, masking")]
struct Cli {
    /// YAML config file; environment overrides still apply.
    #[arg(long = "config", global = true)]
    config_path: Option<PathBuf>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Clone, Debug, Subcommand)]
enum CliCommand {
    /// Load, override and validate the configuration.
    CheckConfig,
    /// Re-check the hash chain stored in a database.
    Verify {
        #[arg(long)]
        database: Option<String>,
    },
    /// Push sample calls through the full pipeline.
    Demo {
        #[arg(long)]
        database: Option<String>,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// Mask a JSON document with the configured field list.
    Mask { json: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> anyhow::Result<AuditConfig> {
    AuditConfig::resolve(cli.config_path.as_deref()).context("failed to load audit config")
}

fn signer_for(config: &AuditConfig) -> anyhow::Result<Option<KeyedDigestSigner>> {
    config
        .security
        .signing_key
        .as_deref()
        .map(KeyedDigestSigner::new)
        .transpose()
        .context("invalid signing key")
}

fn check_config(config: &AuditConfig) {
    let storage = match config.storage.backend {
        StorageBackend::Database => "database",
        StorageBackend::Noop => "noop",
    };
    println!(
        "config ok enabled={} storage={storage} min_risk={} queue_capacity={} retention_days={}",
        config.enabled,
        config.filter.min_risk_level.code(),
        config.dispatcher.queue_capacity,
        config.retention.days,
    );
    println!(
        "encryption_key={} signing_key={}",
        if config.security.encryption_key.is_some() { "set" } else { "ephemeral" },
        if config.security.signing_key.is_some() { "set" } else { "ephemeral" },
    );
}

async fn verify(config: &AuditConfig, database: Option<String>) -> anyhow::Result<()> {
    let url = database.unwrap_or_else(|| config.storage.database_url.clone());
    let storage = SqliteAuditStorage::connect(&url)
        .await
        .with_context(|| format!("failed to open {url}"))?;
    let chain = storage.load_chain().await.context("failed to load audit chain")?;

    let signer = signer_for(config)?;
    let report = verify_chain(&chain, signer.as_ref().map(|s| s as &dyn RecordSigner));
    if report.valid {
        println!(
            "chain valid records={} signatures={}",
            report.records_checked,
            if signer.is_some() { "checked" } else { "skipped" }
        );
        Ok(())
    } else {
        bail!(
            "chain broken at={} message={}",
            report.broken_at.map(|i| i.to_string()).unwrap_or_default(),
            report.message.unwrap_or_default()
        )
    }
}

fn sample_call(n: usize) -> CallContext {
    let (type_name, method) = match n % 4 {
        0 => ("shop::orders::OrderService", "createOrder"),
        1 => ("shop::accounts::AccountService", "updatePassword"),
        2 => ("shop::orders::OrderService", "listOrders"),
        _ => ("shop::accounts::AccountService", "deleteAccount"),
    };
    CallContext::new(OperationRef::new(type_name, method), Utc::now())
        .with_policy(AuditPolicy {
            record_return_value: true,
            ..AuditPolicy::default()
        })
        .with_param("request_id", "String", json!(format!("req-{n}")))
        .with_param(
            "form",
            "shop::Form",
            json!({"email": "demo@example.com", "password": "demo-password"}),
        )
        .with_param("request", "http::Request", json!({"raw": "ignored"}))
        .with_actor(Actor {
            user_id: Some(format!("user-{}", n % 3)),
            tenant_id: Some("demo".to_string()),
            ..Actor::default()
        })
        .with_transport(Transport {
            client_ip: Some("203.0.113.10".to_string()),
            uri: Some(format!("/api/{method}")),
            http_method: Some("POST".to_string()),
            http_status: Some(200),
            ..Transport::default()
        })
        .with_return_value(json!({"ok": true}))
}

async fn demo(mut config: AuditConfig, database: Option<String>, count: usize) -> anyhow::Result<()> {
    if let Some(url) = database {
        config.storage.backend = StorageBackend::Database;
        config.storage.database_url = url;
    }
    let pipeline = AuditPipeline::from_config(&config)
        .await
        .context("failed to start audit pipeline")?;

    for n in 0..count {
        let outcome = pipeline.record(&sample_call(n)).context("sample call rejected")?;
        tracing::debug!(n, ?outcome, "sample call recorded");
    }
    pipeline.shutdown().await;

    let stats = pipeline.stats();
    println!("{}", serde_json::to_string(&stats)?);
    if let Some(head) = pipeline.chain_head() {
        println!("chain head={head}");
    }
    Ok(())
}

fn mask_document(config: &AuditConfig, raw: &str) -> anyhow::Result<()> {
    let value: Value = serde_json::from_str(raw).context("input is not valid JSON")?;
    let fields = MaskFields::with_defaults().with(&config.mask_fields);
    let masked = mask(value, &fields);
    println!("{}", serde_json::to_string(&masked.value)?);
    tracing::info!(redactions = masked.redactions, "document masked");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        CliCommand::CheckConfig => {
            check_config(&config);
            Ok(())
        }
        CliCommand::Verify { database } => verify(&config, database).await,
        CliCommand::Demo { database, count } => demo(config, database, count).await,
        CliCommand::Mask { json } => mask_document(&config, &json),
    }
}
