use std::fs;
use std::path::Path;
use std::time::Duration;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

fn warden() -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("warden-cli");
    cmd.timeout(Duration::from_secs(20));
    for key in [
        "WARDEN_AUDIT_ENABLED",
        "WARDEN_AUDIT_STORAGE",
        "WARDEN_AUDIT_DATABASE_URL",
        "WARDEN_AUDIT_MIN_RISK_LEVEL",
        "WARDEN_AUDIT_ENCRYPTION_KEY",
        "WARDEN_AUDIT_SIGNING_KEY",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

fn write_config(dir: &Path, signing_key: &str) -> String {
    let db = dir.join("audit.db");
    let path = dir.join("audit.yaml");
    let yaml = format!(
        "app_name: cli-test\nmask_fields:\n  - cardNumber\nstorage:\n  backend: database\n  database_url: \"sqlite://{}\"\nsecurity:\n  signing_key: {signing_key}\n",
        db.display()
    );
    fs::write(&path, yaml).expect("write config");
    path.display().to_string()
}

#[test]
fn check_config_reports_defaults() {
    warden()
        .arg("check-config")
        .assert()
        .success()
        .stdout(contains("config ok enabled=true storage=database min_risk=LOW"))
        .stdout(contains("signing_key=ephemeral"));
}

#[test]
fn check_config_applies_environment_overrides() {
    warden()
        .arg("check-config")
        .env("WARDEN_AUDIT_STORAGE", "noop")
        .env("WARDEN_AUDIT_MIN_RISK_LEVEL", "high")
        .assert()
        .success()
        .stdout(contains("storage=noop min_risk=HIGH"));
}

#[test]
fn invalid_config_fails() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("bad.yaml");
    fs::write(&path, "retention:\n  days: 0\n").expect("write");

    warden()
        .args(["--config", &path.display().to_string(), "check-config"])
        .assert()
        .failure()
        .stderr(contains("retention.days"));
}

#[test]
fn mask_redacts_default_and_configured_fields() {
    let dir = TempDir::new().expect("tempdir");
    let config = write_config(dir.path(), "k1");

    warden()
        .args([
            "--config",
            &config,
            "mask",
            r#"{"user":"bob","password":"pw","card":{"cardNumber":"4111"}}"#,
        ])
        .assert()
        .success()
        .stdout(contains(r#""password":"******""#))
        .stdout(contains(r#""cardNumber":"******""#))
        .stdout(contains(r#""user":"bob""#));
}

#[test]
fn demo_then_verify_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let config = write_config(dir.path(), "cli-signing-key");

    warden()
        .args(["--config", &config, "demo", "--count", "4"])
        .assert()
        .success()
        .stdout(contains(r#""persisted":4"#))
        .stdout(contains("chain head="));

    warden()
        .args(["--config", &config, "verify"])
        .assert()
        .success()
        .stdout(contains("chain valid records=4 signatures=checked"));
}

#[test]
fn verify_rejects_wrong_signing_key() {
    let dir = TempDir::new().expect("tempdir");
    let config = write_config(dir.path(), "original-key");
    warden()
        .args(["--config", &config, "demo", "--count", "2"])
        .assert()
        .success();

    let other = write_config(dir.path(), "rotated-key");
    warden()
        .args(["--config", &other, "verify"])
        .assert()
        .failure()
        .stderr(contains("signature mismatch"));
}
