//! Environment healthcheck.
//!
//! Pure check functions returning structured results; nothing here
//! raises or mutates state beyond probe files that are removed again.
//! Missing optional dependencies (gateway, worker binary) warn instead
//! of failing.

use std::path::Path;

use serde::Serialize;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::ledger::Ledger;
use crate::registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warn,
    Fail,
}

/// Result of a single healthcheck.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl CheckResult {
    fn ok(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Ok,
            message: message.into(),
            remediation: None,
        }
    }

    fn warn(name: &'static str, message: impl Into<String>, remediation: &str) -> Self {
        Self {
            name,
            status: CheckStatus::Warn,
            message: message.into(),
            remediation: Some(remediation.to_string()),
        }
    }

    fn fail(name: &'static str, message: impl Into<String>, remediation: &str) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            message: message.into(),
            remediation: Some(remediation.to_string()),
        }
    }
}

/// Aggregate report from all healthchecks.
#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,
    pub timestamp: String,
}

impl DoctorReport {
    pub fn overall_status(&self) -> CheckStatus {
        self.checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Ok)
    }
}

/// Run every healthcheck against the configured environment.
pub fn run_doctor(config: &Config, project_root: &Path) -> DoctorReport {
    let checks = vec![
        check_writable_dir("data_root", &project_root.join(&config.paths.data_root)),
        check_ledger(config, project_root),
        check_registry(config, project_root),
        check_binary("git", "git", "install git"),
        check_binary("ruff", "ruff", "pip install ruff"),
        check_binary("mypy", "mypy", "pip install mypy"),
        check_binary("pytest", "pytest", "pip install pytest"),
        check_worker(config),
        check_writable_dir("scratch_root", &config.paths.scratch_root),
        check_gateway(config),
    ];
    DoctorReport {
        checks,
        timestamp: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    }
}

fn check_writable_dir(name: &'static str, dir: &Path) -> CheckResult {
    if let Err(err) = std::fs::create_dir_all(dir) {
        return CheckResult::fail(
            name,
            format!("cannot create {}: {err}", dir.display()),
            &format!("mkdir -p {}", dir.display()),
        );
    }
    let probe = dir.join(".kiln-doctor-probe");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            CheckResult::ok(name, format!("writable: {}", dir.display()))
        }
        Err(err) => CheckResult::fail(
            name,
            format!("not writable: {} ({err})", dir.display()),
            &format!("chmod +w {}", dir.display()),
        ),
    }
}

fn check_ledger(config: &Config, project_root: &Path) -> CheckResult {
    let path = project_root.join(&config.paths.ledger_db);
    match Ledger::open(&path) {
        Ok(ledger) => CheckResult::ok(
            "ledger",
            format!(
                "opens at {} (schema v{})",
                path.display(),
                ledger.schema_version()
            ),
        ),
        Err(err) => CheckResult::fail(
            "ledger",
            format!("cannot open {}: {err}", path.display()),
            "check permissions on the data root",
        ),
    }
}

fn check_registry(config: &Config, project_root: &Path) -> CheckResult {
    let path = project_root.join(&config.paths.registry_file);
    match registry::load_registry(&path) {
        Ok(entries) => CheckResult::ok(
            "registry",
            format!("{} trusted skill(s) at {}", entries.len(), path.display()),
        ),
        Err(err) => CheckResult::fail(
            "registry",
            format!("unreadable: {err}"),
            "restore the registry file or re-promote skills",
        ),
    }
}

fn check_binary(name: &'static str, bin: &str, remediation: &str) -> CheckResult {
    match which::which(bin) {
        Ok(path) => CheckResult::ok(name, format!("found: {}", path.display())),
        Err(_) => CheckResult::warn(name, format!("'{bin}' not on PATH"), remediation),
    }
}

fn check_worker(config: &Config) -> CheckResult {
    match which::which(&config.sandbox.worker_bin) {
        Ok(path) => CheckResult::ok("worker", format!("found: {}", path.display())),
        Err(_) => CheckResult::warn(
            "worker",
            format!("worker binary '{}' not on PATH", config.sandbox.worker_bin),
            "install the build worker or set sandbox.worker_bin",
        ),
    }
}

fn check_gateway(config: &Config) -> CheckResult {
    if !config.gateway.enabled {
        return CheckResult::ok("gateway", "disabled by configuration");
    }
    match Gateway::from_config(&config.gateway) {
        Ok(gateway) if gateway.is_available() => {
            CheckResult::ok("gateway", format!("reachable at {}", config.gateway.base_url))
        }
        _ => CheckResult::warn(
            "gateway",
            format!("unreachable at {}", config.gateway.base_url),
            "start the gateway or disable it (retries degrade to deterministic)",
        ),
    }
}
