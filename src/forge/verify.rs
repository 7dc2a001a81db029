//! Verification battery: five gates behind an injectable tool runner.
//!
//! Lint, type-check, and unit-test gates shell out through `ToolRunner`;
//! the policy and invariant gates run in process. All five gates run
//! regardless of earlier failures, every gate's output lands in the
//! report artifact, and the verification row is recorded exactly once
//! per build.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::info;

use crate::artifacts::ArtifactStore;
use crate::config::PolicyConfig;
use crate::error::{KilnError, Result};
use crate::forge::gate::Allowlist;
use crate::forge::invariants::{check_invariants, InvariantContext};
use crate::forge::paths::PathConvention;
use crate::ledger::{ArtifactKind, ArtifactRecord, Ledger, VerificationGates, VerificationRecord};
use crate::policy::{self, PolicyRules};

/// Result of one external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Capability interface for running verification tools.
///
/// Production uses `SubprocessRunner`; tests inject scripted outputs so
/// the battery is deterministic without mocking system calls.
pub trait ToolRunner {
    fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<ToolOutput>;
}

/// Runs real tools via subprocess, with a per-invocation timeout.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    pub timeout: Duration,
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
        }
    }
}

impl ToolRunner for SubprocessRunner {
    fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<ToolOutput> {
        use std::process::{Command, Stdio};

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| KilnError::ToolFailure(format!("spawn {program}: {err}")))?;

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_reader = std::thread::spawn(move || {
            use std::io::Read;
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf);
            buf
        });
        let stderr_reader = std::thread::spawn(move || {
            use std::io::Read;
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf);
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
                        "{program} exceeded {}s",
                        self.timeout.as_secs()
                    )));
                }
                None => std::thread::sleep(Duration::from_millis(25)),
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        Ok(ToolOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// One gate's structured result.
#[derive(Debug, Clone)]
pub struct GateReport {
    pub name: &'static str,
    pub ok: bool,
    pub log: String,
}

/// Shared context for a verification run.
pub struct VerifyContext<'a> {
    pub ledger: &'a Ledger,
    pub store: &'a ArtifactStore,
    pub project_root: &'a Path,
    pub paths: &'a PathConvention,
    pub rules: &'a PolicyRules,
    pub policy_config: &'a PolicyConfig,
    pub optional_allowlist: &'a [String],
    pub runner: &'a dyn ToolRunner,
}

/// Run all five gates for a completed build and record the result.
///
/// Returns the verification record and the report artifact.
pub fn verify_build(
    ctx: &VerifyContext<'_>,
    build_id: &str,
    changed_files: Option<&[String]>,
) -> Result<(VerificationRecord, ArtifactRecord)> {
    let build = ctx.ledger.build(build_id)?;
    let proposal = ctx.ledger.proposal(&build.proposal_id)?;

    let skill_rel = ctx.paths.skill_rel(&proposal.name);
    let test_rel = ctx.paths.test_rel(&proposal.name);
    let skill_file = ctx.project_root.join(&skill_rel);

    let lint = run_tool_gate(
        ctx,
        "ruff",
        "ruff",
        &["check".to_string(), skill_rel.clone(), test_rel.clone()],
    );
    let types = run_tool_gate(ctx, "mypy", "mypy", &[skill_rel.clone()]);
    let tests = run_tool_gate(
        ctx,
        "pytest",
        "pytest",
        &["-q".to_string(), "--tb=short".to_string(), test_rel.clone()],
    );

    let policy_gate = {
        let result = match policy::scan_file(&skill_file, ctx.rules) {
            Ok(result) => result,
            Err(err) => policy::ScanResult {
                violations: vec![crate::policy::PolicyViolation {
                    rule: "scan_error".to_string(),
                    line: 0,
                    excerpt: err.to_string(),
                }],
                files_scanned: 0,
            },
        };
        GateReport {
            name: "policy",
            ok: result.ok(),
            log: if result.ok() {
                String::new()
            } else {
                policy::format_report(&result)
            },
        }
    };

    let invariants_gate = {
        let allowlist =
            Allowlist::for_proposal(&proposal.name, ctx.paths, ctx.optional_allowlist);
        let report = check_invariants(&InvariantContext {
            skill_file: &skill_file,
            proposal_name: &proposal.name,
            expected_side_effect: proposal.side_effect_class.as_str(),
            base_class: &ctx.policy_config.skill_base_class,
            project_root: ctx.project_root,
            allowlist: &allowlist,
            governance_prefixes: &ctx.policy_config.governance_prefixes,
            changed_files,
        });
        let log = report
            .violations
            .iter()
            .map(|v| match v.line {
                Some(line) => format!("[{}] line {line}: {}", v.check, v.message),
                None => format!("[{}] {}", v.check, v.message),
            })
            .collect::<Vec<_>>()
            .join("\n");
        GateReport {
            name: "invariants",
            ok: report.ok,
            log,
        }
    };

    let gates = VerificationGates {
        ruff_ok: lint.ok,
        mypy_ok: types.ok,
        pytest_ok: tests.ok,
        policy_ok: policy_gate.ok,
        invariants_ok: invariants_gate.ok,
    };

    let report_content = render_report(
        &proposal.id,
        &proposal.name,
        &[&lint, &types, &tests, &policy_gate, &invariants_gate],
        gates.all_ok(),
    );
    let report_artifact = ctx.store.put_text(
        ctx.ledger,
        &report_content,
        ArtifactKind::VerificationReport,
        Some(&proposal.id),
    )?;

    let record = ctx
        .ledger
        .record_verification(build_id, &gates, Some(&report_artifact.id))?;
    info!(
        build = %build_id,
        all_ok = record.all_ok,
        "verification recorded"
    );
    Ok((record, report_artifact))
}

fn run_tool_gate(
    ctx: &VerifyContext<'_>,
    name: &'static str,
    program: &str,
    args: &[String],
) -> GateReport {
    match ctx.runner.run(program, args, ctx.project_root) {
        Ok(output) => GateReport {
            name,
            ok: output.ok(),
            log: output.combined(),
        },
        // A tool that cannot run at all is a failed gate, not a crash.
        Err(err) => GateReport {
            name,
            ok: false,
            log: err.to_string(),
        },
    }
}

fn render_report(
    proposal_id: &str,
    proposal_name: &str,
    gates: &[&GateReport],
    all_ok: bool,
) -> String {
    let mut lines = vec![
        "# Verification Report".to_string(),
        String::new(),
        format!("Proposal: {proposal_id} ({proposal_name})"),
        String::new(),
        "## Results".to_string(),
        String::new(),
    ];
    for gate in gates {
        lines.push(format!(
            "- {}: {}",
            gate.name,
            if gate.ok { "PASS" } else { "FAIL" }
        ));
    }
    lines.push(String::new());
    lines.push(format!(
        "## Overall: {}",
        if all_ok { "PASSED" } else { "FAILED" }
    ));
    for gate in gates {
        if !gate.ok && !gate.log.trim().is_empty() {
            lines.push(String::new());
            lines.push(format!("## {} output", gate.name));
            lines.push("```".to_string());
            lines.push(gate.log.trim_end().to_string());
            lines.push("```".to_string());
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{BuildOutcome, ProposalSpec, SideEffectClass};
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Scripted runner: maps program name to a canned result.
    struct StubRunner {
        outputs: HashMap<&'static str, ToolOutput>,
    }

    impl StubRunner {
        fn all_passing() -> Self {
            let ok = ToolOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            };
            let mut outputs = HashMap::new();
            outputs.insert("ruff", ok.clone());
            outputs.insert("mypy", ok.clone());
            outputs.insert("pytest", ok);
            Self { outputs }
        }

        fn failing(program: &'static str, log: &str) -> Self {
            let mut runner = Self::all_passing();
            runner.outputs.insert(
                program,
                ToolOutput {
                    exit_code: 1,
                    stdout: log.to_string(),
                    stderr: String::new(),
                },
            );
            runner
        }
    }

    impl ToolRunner for StubRunner {
        fn run(&self, program: &str, _args: &[String], _cwd: &Path) -> Result<ToolOutput> {
            Ok(self
                .outputs
                .get(program)
                .cloned()
                .unwrap_or_else(|| ToolOutput {
                    exit_code: 127,
                    stdout: String::new(),
                    stderr: format!("{program}: not scripted"),
                }))
        }
    }

    struct Fixture {
        _temp: TempDir,
        root: std::path::PathBuf,
        ledger: Ledger,
        store: ArtifactStore,
        rules: PolicyRules,
        policy_config: PolicyConfig,
        build_id: String,
        proposal_id: String,
    }

    fn fixture(skill_source: &str) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        std::fs::create_dir_all(root.join("skills")).unwrap();
        std::fs::create_dir_all(root.join("tests")).unwrap();
        std::fs::write(root.join("skills/write_note.py"), skill_source).unwrap();
        std::fs::write(root.join("tests/test_skill_write_note.py"), "def test_ok():\n    pass\n")
            .unwrap();

        let ledger = Ledger::open_in_memory().unwrap();
        let store = ArtifactStore::open(root.join(".kiln/blobs")).unwrap();
        let proposal = ledger
            .create_proposal(&ProposalSpec {
                name: "write_note".to_string(),
                description: "write a note".to_string(),
                input_schema_json: r#"{"title": "str"}"#.to_string(),
                output_schema_json: r#"{"path": "str"}"#.to_string(),
                side_effect_class: SideEffectClass::FileWrite,
                required_secrets: vec![],
            })
            .unwrap();
        let build = ledger.open_build(&proposal.id, None).unwrap();
        ledger
            .record_build_result(&build.id, BuildOutcome::Succeeded, None, None, None)
            .unwrap();

        Fixture {
            _temp: temp,
            root,
            ledger,
            store,
            rules: PolicyRules::embedded(),
            policy_config: PolicyConfig::default(),
            build_id: build.id,
            proposal_id: proposal.id,
        }
    }

    const GOOD_SKILL: &str = r#"from pydantic import BaseModel
from skills.base import BaseSkill


class WriteNoteInput(BaseModel):
    title: str


class WriteNoteSkill(BaseSkill):
    name = "write_note"
    side_effect_class = "FILE_WRITE"
    input_model = WriteNoteInput
    output_model = WriteNoteInput

    def execute(self, input_data):
        return input_data
"#;

    fn changed() -> Vec<String> {
        vec![
            "skills/write_note.py".to_string(),
            "tests/test_skill_write_note.py".to_string(),
        ]
    }

    fn verify_with(fixture: &Fixture, runner: &dyn ToolRunner) -> VerificationRecord {
        let paths = PathConvention::new("skills", "tests");
        let ctx = VerifyContext {
            ledger: &fixture.ledger,
            store: &fixture.store,
            project_root: &fixture.root,
            paths: &paths,
            rules: &fixture.rules,
            policy_config: &fixture.policy_config,
            optional_allowlist: &[],
            runner,
        };
        let changed = changed();
        verify_build(&ctx, &fixture.build_id, Some(&changed)).unwrap().0
    }

    #[test]
    fn all_gates_passing_yields_all_ok_and_verified_status() {
        let fixture = fixture(GOOD_SKILL);
        let record = verify_with(&fixture, &StubRunner::all_passing());

        assert!(record.all_ok);
        assert!(record.gates.ruff_ok && record.gates.invariants_ok);
        assert_eq!(
            fixture.ledger.query_status(&fixture.proposal_id).unwrap(),
            crate::ledger::ProposalStatus::Verified
        );
    }

    #[test]
    fn failing_lint_gate_fails_verification_but_all_gates_run() {
        let fixture = fixture(GOOD_SKILL);
        let record = verify_with(&fixture, &StubRunner::failing("ruff", "F401 unused import"));

        assert!(!record.all_ok);
        assert!(!record.gates.ruff_ok);
        // The other gates still ran and recorded their results.
        assert!(record.gates.mypy_ok);
        assert!(record.gates.pytest_ok);
        assert!(record.gates.policy_ok);
        assert!(record.gates.invariants_ok);
    }

    #[test]
    fn forbidden_import_fails_policy_gate_only() {
        let source = format!("import subprocess\n{GOOD_SKILL}");
        let fixture = fixture(&source);
        let record = verify_with(&fixture, &StubRunner::all_passing());

        assert!(!record.all_ok);
        assert!(!record.gates.policy_ok);
        assert!(record.gates.ruff_ok);
    }

    #[test]
    fn structural_break_fails_invariants_gate() {
        let fixture = fixture("class NotASkill:\n    pass\n");
        let record = verify_with(&fixture, &StubRunner::all_passing());

        assert!(!record.all_ok);
        assert!(!record.gates.invariants_ok);
    }

    #[test]
    fn report_artifact_records_gate_output() {
        let fixture = fixture(GOOD_SKILL);
        let record = verify_with(&fixture, &StubRunner::failing("pytest", "FAILED tests/test_skill_write_note.py::test_ok"));

        let report = fixture
            .store
            .get_text(&fixture.ledger, record.report_artifact_id.as_deref().unwrap())
            .unwrap();
        assert!(report.contains("- pytest: FAIL"));
        assert!(report.contains("- ruff: PASS"));
        assert!(report.contains("## Overall: FAILED"));
        assert!(report.contains("FAILED tests/test_skill_write_note.py::test_ok"));
    }

    #[test]
    fn second_verification_for_same_build_is_rejected() {
        let fixture = fixture(GOOD_SKILL);
        verify_with(&fixture, &StubRunner::all_passing());

        let paths = PathConvention::new("skills", "tests");
        let ctx = VerifyContext {
            ledger: &fixture.ledger,
            store: &fixture.store,
            project_root: &fixture.root,
            paths: &paths,
            rules: &fixture.rules,
            policy_config: &fixture.policy_config,
            optional_allowlist: &[],
            runner: &StubRunner::all_passing(),
        };
        let changed = changed();
        assert!(matches!(
            verify_build(&ctx, &fixture.build_id, Some(&changed)),
            Err(KilnError::InvalidTransition(_))
        ));
    }
}
