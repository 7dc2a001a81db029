//! Shared fixture for the integration suites: a governed project tree
//! with ledger, blob store, and scripted worker/runner/executor stand-ins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use tempfile::TempDir;

use kiln::artifacts::ArtifactStore;
use kiln::config::Config;
use kiln::error::{KilnError, Result};
use kiln::forge::build::BuildContext;
use kiln::forge::paths::PathConvention;
use kiln::forge::verify::{ToolOutput, ToolRunner, VerifyContext};
use kiln::forge::worker::{BuildWorker, WorkerOutput};
use kiln::ledger::{Ledger, ProposalLocks, ProposalSpec, SideEffectClass};
use kiln::policy::PolicyRules;
use kiln::registry::RegistryEntry;
use kiln::runtime::{RuntimeContext, SkillExecutor};

pub const GOOD_SKILL: &str = r#"from pydantic import BaseModel
from skills.base import BaseSkill


class WriteNoteInput(BaseModel):
    title: str
    body: str


class WriteNoteOutput(BaseModel):
    path: str


class WriteNoteSkill(BaseSkill):
    name = "write_note"
    side_effect_class = "FILE_WRITE"
    input_model = WriteNoteInput
    output_model = WriteNoteOutput

    def execute(self, input_data):
        return WriteNoteOutput(path=f"vault/{input_data.title}.md")
"#;

pub const GOOD_TEST: &str = r#"from skills.write_note import WriteNoteSkill


def test_write_note_returns_path():
    skill = WriteNoteSkill()
    result = skill.validate_and_run({"title": "Hi", "body": "x"})
    assert result["path"].endswith("Hi.md")
"#;

/// A build worker that writes scripted files into the sandbox repo.
pub struct ScriptedWorker {
    pub files: Vec<(String, String)>,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ScriptedWorker {
    pub fn writing(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(path, content)| (path.to_string(), content.to_string()))
                .collect(),
            exit_code: 0,
            timed_out: false,
        }
    }

    pub fn timing_out() -> Self {
        Self {
            files: Vec::new(),
            exit_code: 0,
            timed_out: true,
        }
    }
}

impl BuildWorker for ScriptedWorker {
    fn invoke(&self, workspace: &Path, _packet: &str) -> Result<WorkerOutput> {
        if self.timed_out {
            return Ok(WorkerOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
            });
        }
        for (rel, content) in &self.files {
            let path = workspace.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        Ok(WorkerOutput {
            exit_code: Some(self.exit_code),
            stdout: "scripted worker done".to_string(),
            stderr: String::new(),
            timed_out: false,
        })
    }

    fn describe(&self) -> String {
        "scripted-worker".to_string()
    }
}

/// Tool runner with per-program canned results; unscripted tools pass.
pub struct StubRunner {
    outputs: HashMap<&'static str, ToolOutput>,
}

impl StubRunner {
    pub fn all_passing() -> Self {
        Self {
            outputs: HashMap::new(),
        }
    }

    pub fn failing(program: &'static str, log: &str) -> Self {
        let mut outputs = HashMap::new();
        outputs.insert(
            program,
            ToolOutput {
                exit_code: 1,
                stdout: log.to_string(),
                stderr: String::new(),
            },
        );
        Self { outputs }
    }
}

impl ToolRunner for StubRunner {
    fn run(&self, program: &str, _args: &[String], _cwd: &Path) -> Result<ToolOutput> {
        Ok(self.outputs.get(program).cloned().unwrap_or(ToolOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }
}

/// Skill executor returning a canned output.
pub struct StubExecutor {
    pub output: JsonValue,
}

impl SkillExecutor for StubExecutor {
    fn execute(
        &self,
        _entry: &RegistryEntry,
        _project_root: &Path,
        _input: &JsonValue,
    ) -> Result<JsonValue> {
        Ok(self.output.clone())
    }
}

/// A failing advisor for gateway-disabled retry scenarios.
pub struct UnavailableAdvisor;

impl kiln::forge::retry::Advisor for UnavailableAdvisor {
    fn advise(&self, _prompt: &str) -> Result<String> {
        Err(KilnError::GatewayUnavailable("connection refused".into()))
    }
}

/// The whole governed environment rooted in one temp dir. Scratch
/// workspaces live in a sibling temp dir so sandbox copies never walk
/// into their own output.
pub struct Forge {
    pub _temp: TempDir,
    pub _scratch: TempDir,
    pub root: PathBuf,
    pub config: Config,
    pub ledger: Ledger,
    pub store: ArtifactStore,
    pub locks: ProposalLocks,
    pub paths: PathConvention,
    pub rules: PolicyRules,
}

impl Forge {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        std::fs::create_dir_all(root.join("skills")).unwrap();
        std::fs::create_dir_all(root.join("tests")).unwrap();
        std::fs::write(
            root.join("skills/base.py"),
            "class BaseSkill:\n    def validate_and_run(self, raw):\n        raise NotImplementedError\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.paths.scratch_root = scratch.path().to_path_buf();
        config.gateway.enabled = false;
        config.sandbox.retain_failed = false;

        let ledger = Ledger::open(root.join(".kiln/ledger.db")).unwrap();
        let store = ArtifactStore::open(root.join(".kiln/blobs")).unwrap();
        let paths = PathConvention::new(&config.paths.skill_root, &config.paths.test_root);

        Self {
            _temp: temp,
            _scratch: scratch,
            root,
            config,
            ledger,
            store,
            locks: ProposalLocks::new(),
            paths,
            rules: PolicyRules::embedded(),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(&self.config.paths.registry_file)
    }

    pub fn write_note_spec(&self) -> ProposalSpec {
        ProposalSpec {
            name: "write_note".to_string(),
            description: "Write a markdown note into the vault".to_string(),
            input_schema_json: r#"{"title": "str", "body": "str"}"#.to_string(),
            output_schema_json: r#"{"path": "str"}"#.to_string(),
            side_effect_class: SideEffectClass::FileWrite,
            required_secrets: vec![],
        }
    }

    pub fn build_ctx<'a>(&'a self, worker: &'a dyn BuildWorker) -> BuildContext<'a> {
        BuildContext {
            ledger: &self.ledger,
            store: &self.store,
            locks: &self.locks,
            config: &self.config,
            project_root: &self.root,
            paths: &self.paths,
            worker,
        }
    }

    pub fn verify_ctx<'a>(&'a self, runner: &'a dyn ToolRunner) -> VerifyContext<'a> {
        VerifyContext {
            ledger: &self.ledger,
            store: &self.store,
            project_root: &self.root,
            paths: &self.paths,
            rules: &self.rules,
            policy_config: &self.config.policy,
            optional_allowlist: &self.config.sandbox.optional_allowlist,
            runner,
        }
    }

    pub fn runtime_ctx<'a>(
        &'a self,
        registry_path: &'a Path,
        executor: &'a dyn SkillExecutor,
    ) -> RuntimeContext<'a> {
        RuntimeContext {
            ledger: &self.ledger,
            project_root: &self.root,
            registry_path,
            executor,
        }
    }
}

pub fn git_available() -> bool {
    kiln::utils::git::git_available()
}
