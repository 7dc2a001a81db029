//! Diff allowlist gate.
//!
//! After the worker exits, the union of changed tracked files and new
//! untracked files must be a strict subset of the allowlist, and both
//! required paths must be present.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::Result;
use crate::forge::paths::PathConvention;
use crate::utils::git;

/// The fixed set of paths a build may create or modify.
#[derive(Debug, Clone)]
pub struct Allowlist {
    /// Must both appear in the diff: skill source and skill test.
    pub required: Vec<String>,
    /// May appear: runtime support files.
    pub optional: Vec<String>,
}

impl Allowlist {
    pub fn for_proposal(
        name: &str,
        paths: &PathConvention,
        optional_allowlist: &[String],
    ) -> Self {
        Self {
            required: vec![paths.skill_rel(name), paths.test_rel(name)],
            optional: optional_allowlist.to_vec(),
        }
    }

    fn all(&self) -> BTreeSet<&str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .map(String::as_str)
            .collect()
    }
}

/// Structured verdict from the diff allowlist gate.
#[derive(Debug, Clone)]
pub struct DiffGateReport {
    pub ok: bool,
    pub changed_tracked: Vec<String>,
    pub changed_untracked: Vec<String>,
    /// Allowlisted paths that were actually changed.
    pub allowed: Vec<String>,
    /// Changed paths outside the allowlist.
    pub violations: Vec<String>,
    /// Required paths absent from the diff.
    pub required_missing: Vec<String>,
}

impl DiffGateReport {
    /// One-line summary for build records and logs.
    pub fn summary(&self) -> String {
        if self.ok {
            format!("gate passed, changed: {:?}", self.allowed)
        } else {
            format!(
                "gate failed, violations: {:?}, missing: {:?}",
                self.violations, self.required_missing
            )
        }
    }
}

/// Compute the gate verdict for a sandbox repository.
///
/// Changed tracked files come from `git diff --name-only HEAD` against
/// the baseline commit; new files from `git ls-files --others`.
pub fn diff_allowlist_gate(sandbox_repo: &Path, allowlist: &Allowlist) -> Result<DiffGateReport> {
    let changed_tracked = git::changed_tracked(sandbox_repo)?;
    let changed_untracked = git::changed_untracked(sandbox_repo)?;
    Ok(evaluate(changed_tracked, changed_untracked, allowlist))
}

/// Pure evaluation, separated so fixtures can exercise it without git.
pub fn evaluate(
    changed_tracked: Vec<String>,
    changed_untracked: Vec<String>,
    allowlist: &Allowlist,
) -> DiffGateReport {
    let all_changed: BTreeSet<&str> = changed_tracked
        .iter()
        .chain(changed_untracked.iter())
        .map(String::as_str)
        .collect();
    let allowed_set = allowlist.all();

    let allowed: Vec<String> = all_changed
        .iter()
        .filter(|path| allowed_set.contains(**path))
        .map(|path| path.to_string())
        .collect();
    let violations: Vec<String> = all_changed
        .iter()
        .filter(|path| !allowed_set.contains(**path))
        .map(|path| path.to_string())
        .collect();
    let required_missing: Vec<String> = allowlist
        .required
        .iter()
        .filter(|path| !all_changed.contains(path.as_str()))
        .cloned()
        .collect();

    let ok = violations.is_empty() && required_missing.is_empty();
    DiffGateReport {
        ok,
        changed_tracked,
        changed_untracked,
        allowed,
        violations,
        required_missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> Allowlist {
        let paths = PathConvention::new("skills", "tests");
        Allowlist::for_proposal(
            "write_note",
            &paths,
            &["runtime/gateway.py".to_string()],
        )
    }

    fn changed(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn passes_when_exactly_required_files_change() {
        let report = evaluate(
            vec![],
            changed(&["skills/write_note.py", "tests/test_skill_write_note.py"]),
            &allowlist(),
        );
        assert!(report.ok);
        assert!(report.violations.is_empty());
        assert!(report.required_missing.is_empty());
        assert_eq!(report.allowed.len(), 2);
    }

    #[test]
    fn optional_files_are_permitted_but_not_required() {
        let report = evaluate(
            vec![],
            changed(&[
                "skills/write_note.py",
                "tests/test_skill_write_note.py",
                "runtime/gateway.py",
            ]),
            &allowlist(),
        );
        assert!(report.ok);
        assert_eq!(report.allowed.len(), 3);
    }

    #[test]
    fn fails_on_file_outside_allowlist() {
        let report = evaluate(
            vec![],
            changed(&[
                "skills/write_note.py",
                "tests/test_skill_write_note.py",
                "rogue.txt",
            ]),
            &allowlist(),
        );
        assert!(!report.ok);
        assert_eq!(report.violations, vec!["rogue.txt"]);
    }

    #[test]
    fn fails_when_required_file_missing() {
        let report = evaluate(vec![], changed(&["skills/write_note.py"]), &allowlist());
        assert!(!report.ok);
        assert_eq!(
            report.required_missing,
            vec!["tests/test_skill_write_note.py"]
        );
    }

    #[test]
    fn fails_when_nothing_changed() {
        let report = evaluate(vec![], vec![], &allowlist());
        assert!(!report.ok);
        assert_eq!(report.required_missing.len(), 2);
    }

    #[test]
    fn tracked_and_untracked_are_unioned() {
        let report = evaluate(
            changed(&["skills/write_note.py"]),
            changed(&["tests/test_skill_write_note.py"]),
            &allowlist(),
        );
        assert!(report.ok);
    }

    #[test]
    fn summary_reports_violations() {
        let report = evaluate(vec![], changed(&["evil.sh"]), &allowlist());
        let summary = report.summary();
        assert!(summary.contains("evil.sh"));
        assert!(summary.contains("missing"));
    }
}
