//! Invariant checker: structural, scope, safety, and boundary gates.
//!
//! Four sub-checks over the skill source and the build's change set:
//! 1. Structural conformance: exactly one public class extending the
//!    declared base, with the required class-level attributes, and a
//!    side-effect class equal to the proposal's.
//! 2. Scope containment: files changed by the build stay inside the
//!    allowlist. Recomputed here because verification can be invoked
//!    independently of the build gate.
//! 3. Extended safety: no dynamic import calls.
//! 4. Runtime boundary: modified runtime support files must not import
//!    from governance modules.

use std::path::Path;

use crate::forge::gate::Allowlist;
use crate::policy::pysrc;
use crate::utils::git;

const REQUIRED_ATTRS: [&str; 4] = ["name", "side_effect_class", "input_model", "output_model"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub check: String,
    pub message: String,
    pub line: Option<usize>,
}

impl InvariantViolation {
    fn new(check: &str, message: impl Into<String>, line: Option<usize>) -> Self {
        Self {
            check: check.to_string(),
            message: message.into(),
            line,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvariantReport {
    pub ok: bool,
    pub structural_ok: bool,
    pub scope_ok: bool,
    pub safety_ok: bool,
    pub boundary_ok: bool,
    pub violations: Vec<InvariantViolation>,
}

/// Everything the checker needs to know about one skill build.
#[derive(Debug, Clone)]
pub struct InvariantContext<'a> {
    pub skill_file: &'a Path,
    pub proposal_name: &'a str,
    pub expected_side_effect: &'a str,
    pub base_class: &'a str,
    pub project_root: &'a Path,
    pub allowlist: &'a Allowlist,
    /// Import prefixes runtime support files must not reach into.
    pub governance_prefixes: &'a [String],
    /// Changed files from the sandbox diff, when the caller has them.
    /// Without them the scope check falls back to the project-root git
    /// diff, flagging governance paths only.
    pub changed_files: Option<&'a [String]>,
}

/// Run all invariant checks and return the combined report.
pub fn check_invariants(ctx: &InvariantContext<'_>) -> InvariantReport {
    let structural = check_structural(ctx);
    let scope = check_scope(ctx);
    let safety = check_safety(ctx);
    let boundary = check_boundary(ctx);

    let structural_ok = structural.is_empty();
    let scope_ok = scope.is_empty();
    let safety_ok = safety.is_empty();
    let boundary_ok = boundary.is_empty();

    let mut violations = structural;
    violations.extend(scope);
    violations.extend(safety);
    violations.extend(boundary);

    InvariantReport {
        ok: structural_ok && scope_ok && safety_ok && boundary_ok,
        structural_ok,
        scope_ok,
        safety_ok,
        boundary_ok,
        violations,
    }
}

// ---------------------------------------------------------------------------
// Check 1: structural conformance
// ---------------------------------------------------------------------------

fn check_structural(ctx: &InvariantContext<'_>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let source = match std::fs::read_to_string(ctx.skill_file) {
        Ok(source) => source,
        Err(_) => {
            violations.push(InvariantViolation::new(
                "structural",
                format!("Skill file not found: {}", ctx.skill_file.display()),
                None,
            ));
            return violations;
        }
    };

    let skill_classes: Vec<_> = pysrc::classes(&source)
        .into_iter()
        .filter(|class| {
            !class.name.starts_with('_') && class.bases.iter().any(|b| b == ctx.base_class)
        })
        .collect();

    let class = match skill_classes.len() {
        0 => {
            violations.push(InvariantViolation::new(
                "structural",
                format!("No public class extending {} found", ctx.base_class),
                None,
            ));
            return violations;
        }
        1 => &skill_classes[0],
        n => {
            violations.push(InvariantViolation::new(
                "structural",
                format!(
                    "Expected exactly one public class extending {}, found {n}",
                    ctx.base_class
                ),
                Some(skill_classes[1].line),
            ));
            &skill_classes[0]
        }
    };

    let assigned: Vec<&str> = class.assigns.iter().map(|a| a.name.as_str()).collect();
    let missing: Vec<&str> = REQUIRED_ATTRS
        .iter()
        .filter(|attr| !assigned.contains(*attr))
        .copied()
        .collect();
    if !missing.is_empty() {
        violations.push(InvariantViolation::new(
            "structural",
            format!("Missing required attrs: {}", missing.join(", ")),
            Some(class.line),
        ));
    }

    if let Some(assign) = class.assigns.iter().find(|a| a.name == "side_effect_class") {
        match &assign.string_value {
            Some(value) if value == ctx.expected_side_effect => {}
            Some(value) => violations.push(InvariantViolation::new(
                "structural",
                format!(
                    "side_effect_class is '{value}', expected '{}'",
                    ctx.expected_side_effect
                ),
                Some(assign.line),
            )),
            None => violations.push(InvariantViolation::new(
                "structural",
                "side_effect_class must be a string literal",
                Some(assign.line),
            )),
        }
    }

    violations
}

// ---------------------------------------------------------------------------
// Check 2: scope containment
// ---------------------------------------------------------------------------

fn check_scope(ctx: &InvariantContext<'_>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    if let Some(changed) = ctx.changed_files {
        // Strict mode: the sandbox diff must be a subset of the allowlist.
        let allowed: Vec<&str> = ctx
            .allowlist
            .required
            .iter()
            .chain(ctx.allowlist.optional.iter())
            .map(String::as_str)
            .collect();
        for path in changed {
            if !allowed.contains(&path.as_str()) {
                violations.push(InvariantViolation::new(
                    "scope",
                    format!("File outside allowlist modified: {path}"),
                    None,
                ));
            }
        }
        return violations;
    }

    // Fallback: project-root diff, flagging governance paths only. Skipped
    // when git is unavailable or the root is not a repository.
    if !git::git_available() {
        return violations;
    }
    let changed = match git::changed_tracked(ctx.project_root) {
        Ok(changed) => changed,
        Err(_) => return violations,
    };
    for path in changed {
        for prefix in ctx.governance_prefixes {
            if path.starts_with(&format!("{prefix}/")) {
                violations.push(InvariantViolation::new(
                    "scope",
                    format!("Protected path modified: {path}"),
                    None,
                ));
                break;
            }
        }
    }

    violations
}

// ---------------------------------------------------------------------------
// Check 3: extended safety
// ---------------------------------------------------------------------------

fn check_safety(ctx: &InvariantContext<'_>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let Ok(source) = std::fs::read_to_string(ctx.skill_file) else {
        return violations;
    };

    for line in pysrc::call_lines(&source, "__import__") {
        violations.push(InvariantViolation::new(
            "safety",
            "__import__() call detected",
            Some(line),
        ));
    }
    for line in pysrc::call_lines(&source, "importlib.import_module") {
        violations.push(InvariantViolation::new(
            "safety",
            "importlib.import_module() call detected",
            Some(line),
        ));
    }

    violations
}

// ---------------------------------------------------------------------------
// Check 4: runtime boundary
// ---------------------------------------------------------------------------

fn check_boundary(ctx: &InvariantContext<'_>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    // Only files the build actually touched are in scope.
    let touched: Vec<&String> = match ctx.changed_files {
        Some(changed) => ctx
            .allowlist
            .optional
            .iter()
            .filter(|path| changed.contains(*path))
            .collect(),
        None => Vec::new(),
    };

    for rel in touched {
        let path = ctx.project_root.join(rel);
        let Ok(source) = std::fs::read_to_string(&path) else {
            continue;
        };
        for import in pysrc::imports(&source) {
            for prefix in ctx.governance_prefixes {
                let hit = import.module == *prefix
                    || import.module.starts_with(&format!("{prefix}."))
                    || import
                        .names
                        .iter()
                        .any(|n| n == prefix || n.starts_with(&format!("{prefix}.")));
                if hit {
                    violations.push(InvariantViolation::new(
                        "boundary",
                        format!("Runtime file {rel} imports governance module '{}'", import.module),
                        Some(import.line),
                    ));
                }
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::paths::PathConvention;
    use tempfile::TempDir;

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

    struct Fixture {
        _temp: TempDir,
        root: std::path::PathBuf,
        skill_file: std::path::PathBuf,
        allowlist: Allowlist,
        governance: Vec<String>,
    }

    fn fixture(skill_source: &str) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        std::fs::create_dir_all(root.join("skills")).unwrap();
        let skill_file = root.join("skills/write_note.py");
        std::fs::write(&skill_file, skill_source).unwrap();

        let paths = PathConvention::new("skills", "tests");
        let allowlist = Allowlist::for_proposal(
            "write_note",
            &paths,
            &["runtime/gateway.py".to_string()],
        );
        Fixture {
            _temp: temp,
            root,
            skill_file,
            allowlist,
            governance: vec!["forge".to_string(), "ledger".to_string()],
        }
    }

    fn check(fixture: &Fixture, changed: Option<&[String]>) -> InvariantReport {
        check_invariants(&InvariantContext {
            skill_file: &fixture.skill_file,
            proposal_name: "write_note",
            expected_side_effect: "FILE_WRITE",
            base_class: "BaseSkill",
            project_root: &fixture.root,
            allowlist: &fixture.allowlist,
            governance_prefixes: &fixture.governance,
            changed_files: changed,
        })
    }

    fn changed_default() -> Vec<String> {
        vec![
            "skills/write_note.py".to_string(),
            "tests/test_skill_write_note.py".to_string(),
        ]
    }

    // =========================================================================
    // Structural
    // =========================================================================

    #[test]
    fn well_formed_skill_passes_all_checks() {
        let fixture = fixture(GOOD_SKILL);
        let report = check(&fixture, Some(&changed_default()));
        assert!(report.ok, "violations: {:?}", report.violations);
    }

    #[test]
    fn missing_skill_file_fails_structural() {
        let fixture = fixture(GOOD_SKILL);
        std::fs::remove_file(&fixture.skill_file).unwrap();
        let report = check(&fixture, Some(&changed_default()));
        assert!(!report.structural_ok);
    }

    #[test]
    fn missing_base_class_fails_structural() {
        let fixture = fixture("class WriteNoteSkill:\n    name = \"write_note\"\n");
        let report = check(&fixture, Some(&changed_default()));
        assert!(!report.structural_ok);
        assert!(report.violations[0].message.contains("BaseSkill"));
    }

    #[test]
    fn missing_required_attrs_fail_structural() {
        let fixture = fixture(
            "class WriteNoteSkill(BaseSkill):\n    name = \"write_note\"\n    side_effect_class = \"FILE_WRITE\"\n",
        );
        let report = check(&fixture, Some(&changed_default()));
        assert!(!report.structural_ok);
        let msg = &report.violations[0].message;
        assert!(msg.contains("input_model"));
        assert!(msg.contains("output_model"));
    }

    #[test]
    fn mismatched_side_effect_class_fails_structural() {
        let source = GOOD_SKILL.replace("\"FILE_WRITE\"", "\"NETWORK\"");
        let fixture = fixture(&source);
        let report = check(&fixture, Some(&changed_default()));
        assert!(!report.structural_ok);
        assert!(report
            .violations
            .iter()
            .any(|v| v.message.contains("NETWORK")));
    }

    #[test]
    fn two_public_skill_classes_fail_structural() {
        let source = format!(
            "{GOOD_SKILL}\n\nclass SecondSkill(BaseSkill):\n    name = \"second\"\n    side_effect_class = \"FILE_WRITE\"\n    input_model = WriteNoteInput\n    output_model = WriteNoteInput\n"
        );
        let fixture = fixture(&source);
        let report = check(&fixture, Some(&changed_default()));
        assert!(!report.structural_ok);
        assert!(report
            .violations
            .iter()
            .any(|v| v.message.contains("exactly one")));
    }

    #[test]
    fn private_helper_class_is_ignored() {
        let source = format!("{GOOD_SKILL}\n\nclass _Helper(BaseSkill):\n    pass\n");
        let fixture = fixture(&source);
        let report = check(&fixture, Some(&changed_default()));
        assert!(report.structural_ok);
    }

    // =========================================================================
    // Scope
    // =========================================================================

    #[test]
    fn change_outside_allowlist_fails_scope() {
        let fixture = fixture(GOOD_SKILL);
        let mut changed = changed_default();
        changed.push("forge/build.py".to_string());
        let report = check(&fixture, Some(&changed));
        assert!(!report.scope_ok);
        assert!(report
            .violations
            .iter()
            .any(|v| v.message.contains("forge/build.py")));
    }

    #[test]
    fn optional_allowlist_change_passes_scope() {
        let fixture = fixture(GOOD_SKILL);
        let mut changed = changed_default();
        changed.push("runtime/gateway.py".to_string());
        std::fs::create_dir_all(fixture.root.join("runtime")).unwrap();
        std::fs::write(fixture.root.join("runtime/gateway.py"), "import json\n").unwrap();
        let report = check(&fixture, Some(&changed));
        assert!(report.scope_ok, "violations: {:?}", report.violations);
    }

    // =========================================================================
    // Safety
    // =========================================================================

    #[test]
    fn dunder_import_fails_safety() {
        let source = format!("{GOOD_SKILL}\nmod = __import__(\"os\")\n");
        let fixture = fixture(&source);
        let report = check(&fixture, Some(&changed_default()));
        assert!(!report.safety_ok);
    }

    #[test]
    fn importlib_import_module_fails_safety() {
        let source = format!("{GOOD_SKILL}\nimport importlib\nm = importlib.import_module(\"os\")\n");
        let fixture = fixture(&source);
        let report = check(&fixture, Some(&changed_default()));
        assert!(!report.safety_ok);
    }

    // =========================================================================
    // Runtime boundary
    // =========================================================================

    #[test]
    fn runtime_file_importing_governance_fails_boundary() {
        let fixture = fixture(GOOD_SKILL);
        std::fs::create_dir_all(fixture.root.join("runtime")).unwrap();
        std::fs::write(
            fixture.root.join("runtime/gateway.py"),
            "from ledger.models import SkillProposal\n",
        )
        .unwrap();
        let mut changed = changed_default();
        changed.push("runtime/gateway.py".to_string());

        let report = check(&fixture, Some(&changed));
        assert!(!report.boundary_ok);
        assert!(report.violations.iter().any(|v| v.check == "boundary"));
    }

    #[test]
    fn untouched_runtime_file_is_not_scanned() {
        let fixture = fixture(GOOD_SKILL);
        std::fs::create_dir_all(fixture.root.join("runtime")).unwrap();
        // Pre-existing file with a violation, but the build didn't touch it.
        std::fs::write(
            fixture.root.join("runtime/gateway.py"),
            "from forge.build import build_skill\n",
        )
        .unwrap();

        let report = check(&fixture, Some(&changed_default()));
        assert!(report.boundary_ok);
    }
}
