//! Deterministic failure classification and escalation triggers.
//!
//! `classify_failure` is a pure function from records and log text to a
//! typed failure: equal inputs always classify identically, so the whole
//! mapping is unit-testable against log fixtures. Trigger evaluation is
//! likewise pure; the caller supplies attempt history and packet texts.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ledger::{BuildAttempt, BuildOutcome, VerificationRecord};

/// Typed cause of a failed build or verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    GateViolation,
    Timeout,
    BuildError,
    VerifyLint,
    VerifyTest,
    VerifyPolicy,
    VerifyInvariant,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GateViolation => "GATE_VIOLATION",
            Self::Timeout => "TIMEOUT",
            Self::BuildError => "BUILD_ERROR",
            Self::VerifyLint => "VERIFY_LINT",
            Self::VerifyTest => "VERIFY_TEST",
            Self::VerifyPolicy => "VERIFY_POLICY",
            Self::VerifyInvariant => "VERIFY_INVARIANT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Classification output: kind plus structured facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub facts: Vec<String>,
    pub log_excerpt: String,
    pub attempt_number: i64,
    pub build_id: String,
}

const LOG_EXCERPT_MAX: usize = 2000;

static VIOLATIONS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)violations:\s*\[([^\]]*)\]").expect("invalid violations regex"));
static MISSING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:required )?missing:\s*\[([^\]]*)\]").expect("invalid missing regex")
});
static EXIT_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)exit code:\s*(\d+)").expect("invalid exit code regex"));
static FAILED_TEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^FAILED\s+(\S+)").expect("invalid failed test regex"));

fn excerpt(text: &str) -> String {
    if text.len() <= LOG_EXCERPT_MAX {
        return text.to_string();
    }
    let mut end = LOG_EXCERPT_MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &text[..end])
}

/// Classify a failed build or verification from its records and log.
pub fn classify_failure(
    build: &BuildAttempt,
    build_log: &str,
    verification: Option<&VerificationRecord>,
) -> FailureRecord {
    let base = |kind: FailureKind, facts: Vec<String>| FailureRecord {
        kind,
        facts,
        log_excerpt: excerpt(build_log),
        attempt_number: build.attempt_number,
        build_id: build.id.clone(),
    };

    // Verification failures first: more specific than build outcomes.
    if let Some(v) = verification {
        if !v.all_ok {
            if !v.gates.invariants_ok {
                let mut facts = vec!["Invariant check failed".to_string()];
                facts.extend(violation_facts(build_log));
                return base(FailureKind::VerifyInvariant, facts);
            }
            if !v.gates.policy_ok {
                let mut facts = vec!["Policy scanner found violations".to_string()];
                facts.extend(violation_facts(build_log));
                return base(FailureKind::VerifyPolicy, facts);
            }
            if !v.gates.pytest_ok {
                let mut facts = vec!["pytest failed".to_string()];
                for caps in FAILED_TEST_RE.captures_iter(build_log) {
                    facts.push(format!("Failing test: {}", &caps[1]));
                }
                return base(FailureKind::VerifyTest, facts);
            }
            if !v.gates.ruff_ok || !v.gates.mypy_ok {
                let mut facts = Vec::new();
                if !v.gates.ruff_ok {
                    facts.push("ruff check failed".to_string());
                }
                if !v.gates.mypy_ok {
                    facts.push("mypy check failed".to_string());
                }
                return base(FailureKind::VerifyLint, facts);
            }
        }
    }

    if build.outcome == BuildOutcome::Failed {
        let summary = build.summary.as_deref().unwrap_or("");

        let log_head: String = build_log.chars().take(500).collect();
        if summary.contains("Timeout") || summary.contains("TIMEOUT") || log_head.contains("TIMEOUT")
        {
            return base(
                FailureKind::Timeout,
                vec![format!("Build timed out: {summary}")],
            );
        }

        if summary.to_lowercase().contains("gate failed") || summary.contains("Gate violation") {
            let mut facts = violation_facts(build_log);
            facts.push(format!("Gate summary: {summary}"));
            return base(FailureKind::GateViolation, facts);
        }

        let mut facts = vec![format!("Build failed: {summary}")];
        if let Some(caps) = EXIT_CODE_RE.captures(build_log) {
            facts.push(format!("Exit code: {}", &caps[1]));
        }
        let stderr_tail = stderr_tail(build_log);
        if !stderr_tail.is_empty() {
            facts.push(format!("stderr tail: {stderr_tail}"));
        }
        return base(FailureKind::BuildError, facts);
    }

    base(
        FailureKind::Unknown,
        vec!["Could not determine failure cause".to_string()],
    )
}

fn violation_facts(build_log: &str) -> Vec<String> {
    let mut facts = Vec::new();
    if let Some(caps) = VIOLATIONS_RE.captures(build_log) {
        let paths = caps[1].trim();
        if !paths.is_empty() {
            facts.push(format!("Disallowed files: {paths}"));
        }
    }
    if let Some(caps) = MISSING_RE.captures(build_log) {
        let paths = caps[1].trim();
        if !paths.is_empty() {
            facts.push(format!("Missing files: {paths}"));
        }
    }
    facts
}

fn stderr_tail(build_log: &str) -> String {
    let Some(idx) = build_log.rfind("## stderr") else {
        return String::new();
    };
    let section = &build_log[idx..];
    let tail: Vec<&str> = section
        .lines()
        .filter(|line| !line.starts_with("##") && !line.starts_with("```"))
        .filter(|line| !line.trim().is_empty())
        .collect();
    let keep = tail.len().saturating_sub(5);
    tail[keep..].join(" | ")
}

// ---------------------------------------------------------------------------
// Escalation triggers
// ---------------------------------------------------------------------------

/// A condition requiring explicit human approval before another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationTrigger {
    RepeatedFailure,
    PermissionWidening,
    SecurityClass,
    LargeDiff,
    Ambiguous,
}

impl EscalationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepeatedFailure => "REPEATED_FAILURE",
            Self::PermissionWidening => "PERMISSION_WIDENING",
            Self::SecurityClass => "SECURITY_CLASS",
            Self::LargeDiff => "LARGE_DIFF",
            Self::Ambiguous => "AMBIGUOUS",
        }
    }
}

/// Inputs for trigger evaluation.
#[derive(Debug, Clone)]
pub struct TriggerContext<'a> {
    /// Consecutive failed attempts for the proposal, including this one.
    pub consecutive_failures: usize,
    /// Configurable escalating keyword list.
    pub escalating_keywords: &'a [String],
    pub original_packet: &'a str,
    pub proposed_packet: &'a str,
}

/// Evaluate the escalation triggers for a classified failure.
pub fn evaluate_triggers(
    record: &FailureRecord,
    ctx: &TriggerContext<'_>,
) -> BTreeSet<EscalationTrigger> {
    let mut triggers = BTreeSet::new();

    if ctx.consecutive_failures >= 3 {
        triggers.insert(EscalationTrigger::RepeatedFailure);
    }

    if matches!(
        record.kind,
        FailureKind::VerifyPolicy | FailureKind::VerifyInvariant
    ) {
        triggers.insert(EscalationTrigger::SecurityClass);
    }

    let orig_lower = ctx.original_packet.to_lowercase();
    let prop_lower = ctx.proposed_packet.to_lowercase();
    for keyword in ctx.escalating_keywords {
        let keyword = keyword.to_lowercase();
        if prop_lower.contains(&keyword) && !orig_lower.contains(&keyword) {
            triggers.insert(EscalationTrigger::PermissionWidening);
            break;
        }
    }

    if diff_ratio(ctx.original_packet, ctx.proposed_packet) > 0.5 {
        triggers.insert(EscalationTrigger::LargeDiff);
    }

    if record.kind == FailureKind::Unknown {
        triggers.insert(EscalationTrigger::Ambiguous);
    }

    triggers
}

/// Fraction of the original packet's lines changed or added.
fn diff_ratio(original: &str, proposed: &str) -> f64 {
    let orig: Vec<&str> = original.lines().collect();
    let prop: Vec<&str> = proposed.lines().collect();
    if orig.is_empty() {
        return if prop.is_empty() { 0.0 } else { 1.0 };
    }
    let changed = orig
        .iter()
        .zip(prop.iter())
        .filter(|(a, b)| a != b)
        .count();
    let added = orig.len().abs_diff(prop.len());
    (changed + added) as f64 / orig.len() as f64
}
