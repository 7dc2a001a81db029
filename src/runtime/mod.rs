//! Runtime loader: trust-verified, schema-validated skill execution.
//!
//! Execution never starts before the trust check passes: the registry
//! entry is looked up, the source re-hashed, declared secrets checked,
//! and the input validated, all before the executor touches the skill.
//! Every call returns a structured `ExecutionRecord`; load-phase and
//! validation failures are distinguished from execution failures.

pub mod log;
pub mod schema;

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::{KilnError, Result};
use crate::ledger::Ledger;
use crate::registry::{self, RegistryEntry};
use crate::runtime::schema::SimpleSchema;

/// Where a failed execution went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    /// Registry lookup, trust verification, or secret availability.
    Load,
    /// Input rejected by the declared input schema.
    InputValidation,
    /// The skill itself failed.
    Execution,
    /// Output rejected by the declared output schema.
    OutputValidation,
}

/// Auditable record of a single skill execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub skill_name: String,
    pub source_hash: String,
    pub side_effect_class: String,
    pub input_json: JsonValue,
    pub output_json: Option<JsonValue>,
    pub success: bool,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_phase: Option<FailurePhase>,
    pub started_at: String,
    pub finished_at: String,
}

/// Structured metadata for one trusted skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInfo {
    pub name: String,
    pub module: String,
    pub side_effect_class: String,
    pub source_hash: Option<String>,
    pub required_secrets: Vec<String>,
    pub input_schema: JsonValue,
    pub output_schema: JsonValue,
}

/// Capability interface for executing a loaded skill.
///
/// Production uses `PythonExecutor`; tests inject scripted executors.
pub trait SkillExecutor {
    fn execute(
        &self,
        entry: &RegistryEntry,
        project_root: &Path,
        input: &JsonValue,
    ) -> Result<JsonValue>;
}

/// Executes skills through a Python driver subprocess.
///
/// The driver imports the module by reference, instantiates the skill
/// class, and runs its validate-and-run entry point with the input JSON
/// on stdin, printing the output JSON on stdout.
#[derive(Debug, Clone)]
pub struct PythonExecutor {
    python_bin: String,
    timeout: Duration,
}

const DRIVER: &str = r#"
import importlib
import json
import sys

module_name, class_name = sys.argv[1].rsplit(".", 1)
module = importlib.import_module(module_name)
cls = getattr(module, class_name)
skill = cls()
raw_input = json.load(sys.stdin)
print(json.dumps(skill.validate_and_run(raw_input)))
"#;

impl PythonExecutor {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            python_bin: config.python_bin.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl SkillExecutor for PythonExecutor {
    fn execute(
        &self,
        entry: &RegistryEntry,
        project_root: &Path,
        input: &JsonValue,
    ) -> Result<JsonValue> {
        use std::io::{Read, Write};
        use std::process::{Command, Stdio};

        let mut child = Command::new(&self.python_bin)
            .args(["-c", DRIVER, entry.module.as_str()])
            .current_dir(project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| KilnError::ToolFailure(format!("spawn {}: {err}", self.python_bin)))?;

        let payload = serde_json::to_vec(input)?;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let writer = std::thread::spawn(move || {
            let _ = stdin.write_all(&payload);
        });
        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stdout_pipe.read_to_string(&mut buf);
            buf
        });
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf);
            buf
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(KilnError::Timeout(format!(
                        "skill '{}' exceeded {}s",
                        entry.name,
                        self.timeout.as_secs()
                    )));
                }
                None => std::thread::sleep(Duration::from_millis(25)),
            }
        };

        let _ = writer.join();
        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            return Err(KilnError::ToolFailure(format!(
                "skill '{}' exited {}: {}",
                entry.name,
                status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let last_line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("");
        serde_json::from_str(last_line).map_err(|err| {
            KilnError::ToolFailure(format!("skill '{}' produced non-JSON output: {err}", entry.name))
        })
    }
}

/// Shared context for runtime execution.
pub struct RuntimeContext<'a> {
    pub ledger: &'a Ledger,
    pub project_root: &'a Path,
    pub registry_path: &'a Path,
    pub executor: &'a dyn SkillExecutor,
}

fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn failure_record(
    name: &str,
    entry: Option<&RegistryEntry>,
    input: &JsonValue,
    phase: FailurePhase,
    error: String,
    started_at: &str,
) -> ExecutionRecord {
    ExecutionRecord {
        skill_name: name.to_string(),
        source_hash: entry.and_then(|e| e.hash.clone()).unwrap_or_default(),
        side_effect_class: entry
            .map(|e| e.side_effect_class.as_str().to_string())
            .unwrap_or_default(),
        input_json: input.clone(),
        output_json: None,
        success: false,
        error: Some(error),
        failure_phase: Some(phase),
        started_at: started_at.to_string(),
        finished_at: now_iso(),
    }
}

/// Execute a trusted skill by name. Never returns `Err` for skill-level
/// problems; every failure lands in the record.
pub fn run_skill(ctx: &RuntimeContext<'_>, name: &str, input: JsonValue) -> ExecutionRecord {
    let started_at = now_iso();

    // Load phase: registry entry, trust verification, declared secrets.
    let entry = match registry::find_entry(ctx.registry_path, name) {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            return failure_record(
                name,
                None,
                &input,
                FailurePhase::Load,
                format!("skill '{name}' not found in registry"),
                &started_at,
            )
        }
        Err(err) => {
            return failure_record(
                name,
                None,
                &input,
                FailurePhase::Load,
                err.to_string(),
                &started_at,
            )
        }
    };
    if let Err(err) = registry::verify_trust(ctx.project_root, &entry) {
        return failure_record(
            name,
            Some(&entry),
            &input,
            FailurePhase::Load,
            err.to_string(),
            &started_at,
        );
    }
    let missing_secrets: Vec<&String> = entry
        .required_secrets
        .iter()
        .filter(|secret| std::env::var(secret.as_str()).is_err())
        .collect();
    if !missing_secrets.is_empty() {
        return failure_record(
            name,
            Some(&entry),
            &input,
            FailurePhase::Load,
            format!("missing required secrets: {missing_secrets:?}"),
            &started_at,
        );
    }

    // Declared schemas come from the promoted proposal.
    let (input_schema, output_schema) = match schemas_for(ctx.ledger, name) {
        Ok(schemas) => schemas,
        Err(err) => {
            return failure_record(
                name,
                Some(&entry),
                &input,
                FailurePhase::Load,
                err.to_string(),
                &started_at,
            )
        }
    };

    if let Err(err) = input_schema.validate(&input) {
        return failure_record(
            name,
            Some(&entry),
            &input,
            FailurePhase::InputValidation,
            err.to_string(),
            &started_at,
        );
    }

    let output = match ctx.executor.execute(&entry, ctx.project_root, &input) {
        Ok(output) => output,
        Err(err) => {
            return failure_record(
                name,
                Some(&entry),
                &input,
                FailurePhase::Execution,
                err.to_string(),
                &started_at,
            )
        }
    };

    if let Err(err) = output_schema.validate(&output) {
        return failure_record(
            name,
            Some(&entry),
            &input,
            FailurePhase::OutputValidation,
            err.to_string(),
            &started_at,
        );
    }

    info!(skill = %name, "execution succeeded");
    ExecutionRecord {
        skill_name: name.to_string(),
        source_hash: entry.hash.clone().unwrap_or_default(),
        side_effect_class: entry.side_effect_class.as_str().to_string(),
        input_json: input,
        output_json: Some(output),
        success: true,
        error: None,
        failure_phase: None,
        started_at,
        finished_at: now_iso(),
    }
}

fn schemas_for(ledger: &Ledger, name: &str) -> Result<(SimpleSchema, SimpleSchema)> {
    let Some(proposal) = ledger.trusted_proposal_by_name(name)? else {
        return Err(KilnError::UnknownEntity(format!(
            "no TRUSTED proposal named '{name}'"
        )));
    };
    Ok((
        SimpleSchema::parse(&proposal.input_schema_json)?,
        SimpleSchema::parse(&proposal.output_schema_json)?,
    ))
}

/// Structured metadata for every registry entry, schemas included.
pub fn trusted_skills(ctx: &RuntimeContext<'_>) -> Result<Vec<SkillInfo>> {
    let entries = registry::load_registry(ctx.registry_path)?;
    let mut out = Vec::new();
    for entry in entries {
        let (input_schema, output_schema) = match ctx.ledger.trusted_proposal_by_name(&entry.name)?
        {
            Some(proposal) => (
                serde_json::from_str(&proposal.input_schema_json)?,
                serde_json::from_str(&proposal.output_schema_json)?,
            ),
            None => (JsonValue::Null, JsonValue::Null),
        };
        out.push(SkillInfo {
            name: entry.name.clone(),
            module: entry.module.clone(),
            side_effect_class: entry.side_effect_class.as_str().to_string(),
            source_hash: entry.hash.clone(),
            required_secrets: entry.required_secrets.clone(),
            input_schema,
            output_schema,
        });
    }
    Ok(out)
}
