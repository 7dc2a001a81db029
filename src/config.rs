//! Configuration for kiln.
//!
//! Defaults are overlaid with an optional `kiln.toml` patch from the
//! project root and then `KILN_*` environment overrides. Every path is
//! resolved against the project root by the consumer.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// On-disk layout. Relative paths are resolved against the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Data root holding the ledger database and blob store.
    pub data_root: PathBuf,
    /// Ledger database file, under the data root.
    pub ledger_db: PathBuf,
    /// Content-addressed blob directory, under the data root.
    pub blob_dir: PathBuf,
    /// Registry file mapping trusted skill names to entries.
    pub registry_file: PathBuf,
    /// Scratch root for sandbox workspaces.
    pub scratch_root: PathBuf,
    /// Append-only execution log (JSONL).
    pub execution_log: PathBuf,
    /// Directory holding governed skill sources, relative to project root.
    pub skill_root: String,
    /// Directory holding governed skill tests, relative to project root.
    pub test_root: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from(".kiln"),
            ledger_db: PathBuf::from(".kiln/ledger.db"),
            blob_dir: PathBuf::from(".kiln/blobs"),
            registry_file: PathBuf::from("skills/registry.yaml"),
            scratch_root: std::env::temp_dir().join("kiln-build"),
            execution_log: PathBuf::from(".kiln/executions.jsonl"),
            skill_root: "skills".to_string(),
            test_root: "tests".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Build worker binary, resolved on PATH.
    pub worker_bin: String,
    /// Capability flags passed to the worker. No shell tool.
    pub allowed_tools: Vec<String>,
    /// Wall-clock bound on a worker invocation, in seconds.
    pub timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on timeout, in seconds.
    pub kill_grace_secs: u64,
    /// Optional allowlist entries beyond the required skill + test paths.
    pub optional_allowlist: Vec<String>,
    /// Keep failed sandbox workspaces on disk for debugging.
    pub retain_failed: bool,
    /// Most failed workspaces retained before the oldest are pruned.
    pub retain_max: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            worker_bin: "claude".to_string(),
            allowed_tools: ["Edit", "Write", "Glob", "Grep", "Read"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_secs: 600,
            kill_grace_secs: 5,
            optional_allowlist: vec![
                "runtime/gateway.py".to_string(),
                "runtime/settings.py".to_string(),
                "tests/test_gateway_client.py".to_string(),
            ],
            retain_failed: true,
            retain_max: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// OpenAI-compatible endpoint.
    pub base_url: String,
    /// Chat model used for the retry advisory.
    pub model: String,
    /// Request timeout, in seconds.
    pub timeout_secs: u64,
    /// Prompts are truncated to this many characters before sending.
    pub max_prompt_chars: usize,
    /// Disable to force deterministic-only retries.
    pub enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            model: "gpt-oss-20b".to_string(),
            timeout_secs: 30,
            max_prompt_chars: 12_000,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Declarative rules file; the embedded default is used when absent.
    pub rules_file: Option<PathBuf>,
    /// Keywords whose appearance in a proposed packet (but not the
    /// original) raises the permission-widening escalation trigger.
    pub escalating_keywords: Vec<String>,
    /// Import prefixes the runtime support files must never reach into.
    pub governance_prefixes: Vec<String>,
    /// Base class every skill must extend.
    pub skill_base_class: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules_file: None,
            escalating_keywords: ["network", "money", "messaging", "secret"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            governance_prefixes: ["forge", "ledger", "policies"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            skill_base_class: "BaseSkill".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Python interpreter used to execute trusted skills.
    pub python_bin: String,
    /// Wall-clock bound on one skill execution, in seconds.
    pub timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            python_bin: "python3".to_string(),
            timeout_secs: 120,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then an optional `kiln.toml` patch,
    /// then environment overrides.
    pub fn load(explicit_path: Option<&Path>, project_root: &Path) -> Result<Self> {
        let mut config = Self::default();

        let explicit = explicit_path
            .map(PathBuf::from)
            .or_else(|| std::env::var("KILN_CONFIG").ok().map(PathBuf::from));

        let path = explicit.unwrap_or_else(|| project_root.join("kiln.toml"));
        if let Some(patch) = Self::load_patch(&path)? {
            config.merge_patch(patch);
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn load_patch(path: &Path) -> Result<Option<ConfigPatch>> {
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|err| KilnError::Config(format!("read config {}: {err}", path.display())))?;
        let patch = toml::from_str(&raw)
            .map_err(|err| KilnError::Config(format!("parse config {}: {err}", path.display())))?;
        Ok(Some(patch))
    }

    fn merge_patch(&mut self, patch: ConfigPatch) {
        if let Some(paths) = patch.paths {
            self.paths = paths;
        }
        if let Some(sandbox) = patch.sandbox {
            self.sandbox = sandbox;
        }
        if let Some(gateway) = patch.gateway {
            self.gateway = gateway;
        }
        if let Some(policy) = patch.policy {
            self.policy = policy;
        }
        if let Some(runtime) = patch.runtime {
            self.runtime = runtime;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("KILN_GATEWAY_URL") {
            self.gateway.base_url = url;
        }
        if let Ok(v) = std::env::var("KILN_GATEWAY_DISABLED") {
            if matches!(v.as_str(), "1" | "true" | "yes") {
                self.gateway.enabled = false;
            }
        }
        if let Ok(bin) = std::env::var("KILN_WORKER_BIN") {
            self.sandbox.worker_bin = bin;
        }
        if let Ok(root) = std::env::var("KILN_SCRATCH_ROOT") {
            self.paths.scratch_root = PathBuf::from(root);
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    paths: Option<PathsConfig>,
    sandbox: Option<SandboxConfig>,
    gateway: Option<GatewayConfig>,
    policy: Option<PolicyConfig>,
    runtime: Option<RuntimeConfig>,
}
