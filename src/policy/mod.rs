//! Policy scanner: pattern-driven denial of forbidden constructs.
//!
//! Rules come from a declarative TOML file (an embedded default ships
//! with the crate). Three categories, all unconditional denials:
//! forbidden module imports, dynamic code evaluation, and best-effort
//! secret-leak shapes (environment lookups flowing into print/log calls
//! on the same statement). The scanner cannot follow variables across
//! assignments; that is a stated limit, not an oversight.

pub mod pysrc;

use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::config::PolicyConfig;
use crate::error::{KilnError, Result};

const DEFAULT_RULES: &str = include_str!("../../policy/rules.toml");

/// Declarative rule set driving the scanner.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyRules {
    pub imports: ImportRules,
    pub dynamic_eval: DynamicEvalRules,
    pub secret_leak: SecretLeakRules,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportRules {
    /// Module prefixes whose import is denied.
    pub forbidden: Vec<String>,
    /// Call paths treated as shell access even without an import.
    #[serde(default)]
    pub shell_calls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamicEvalRules {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretLeakRules {
    /// Regexes matching output sinks (print/log calls).
    pub sinks: Vec<String>,
    /// Regexes matching environment lookups.
    pub sources: Vec<String>,
}

impl PolicyRules {
    /// The embedded default rule set.
    pub fn embedded() -> Self {
        toml::from_str(DEFAULT_RULES).expect("embedded policy rules are valid TOML")
    }

    /// Load rules from a TOML file on disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| KilnError::Config(format!("read rules {}: {err}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|err| KilnError::Config(format!("parse rules {}: {err}", path.display())))
    }

    /// Resolve from configuration: the configured file, or the embedded
    /// default.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        match &config.rules_file {
            Some(path) => Self::load(path),
            None => Ok(Self::embedded()),
        }
    }
}

/// One denied construct.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PolicyViolation {
    pub rule: String,
    pub line: usize,
    pub excerpt: String,
}

/// Aggregate result of a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub violations: Vec<PolicyViolation>,
    pub files_scanned: usize,
}

impl ScanResult {
    pub fn ok(&self) -> bool {
        self.violations.is_empty()
    }
}

fn excerpt_for(source: &str, line: usize) -> String {
    source
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Scan a single source text against the rules.
pub fn scan_source(source: &str, rules: &PolicyRules) -> Vec<PolicyViolation> {
    let mut violations = Vec::new();

    // Category 1: forbidden module imports.
    for import in pysrc::imports(source) {
        for forbidden in &rules.imports.forbidden {
            let hit = import.module == *forbidden
                || import.module.starts_with(&format!("{forbidden}."))
                || import
                    .names
                    .iter()
                    .any(|name| name == forbidden || name.starts_with(&format!("{forbidden}.")));
            if hit {
                violations.push(PolicyViolation {
                    rule: "forbidden_import".to_string(),
                    line: import.line,
                    excerpt: excerpt_for(source, import.line),
                });
                break;
            }
        }
    }
    for call in &rules.imports.shell_calls {
        for line in pysrc::call_lines(source, call) {
            violations.push(PolicyViolation {
                rule: "forbidden_import".to_string(),
                line,
                excerpt: excerpt_for(source, line),
            });
        }
    }

    // Category 2: dynamic code evaluation.
    for name in &rules.dynamic_eval.names {
        for line in pysrc::call_lines(source, name) {
            violations.push(PolicyViolation {
                rule: "forbid_dynamic_exec".to_string(),
                line,
                excerpt: excerpt_for(source, line),
            });
        }
    }

    // Category 3: secret leaks, best effort. A line is flagged when an
    // output sink and an environment lookup appear on the same statement,
    // which also catches f-string interpolation.
    let sink_res: Vec<Regex> = rules
        .secret_leak
        .sinks
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();
    let source_res: Vec<Regex> = rules
        .secret_leak
        .sources
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();
    for (idx, line) in source.lines().enumerate() {
        if sink_res.iter().any(|re| re.is_match(line))
            && source_res.iter().any(|re| re.is_match(line))
        {
            violations.push(PolicyViolation {
                rule: "secret_leak".to_string(),
                line: idx + 1,
                excerpt: line.trim().to_string(),
            });
        }
    }

    violations.sort_by_key(|v| v.line);
    violations
}

/// Scan one file.
pub fn scan_file(path: &Path, rules: &PolicyRules) -> Result<ScanResult> {
    let source = std::fs::read_to_string(path)?;
    Ok(ScanResult {
        violations: scan_source(&source, rules),
        files_scanned: 1,
    })
}

/// Render a scan result as a markdown report.
pub fn format_report(result: &ScanResult) -> String {
    let mut lines = vec![
        "# Policy Scan Report".to_string(),
        String::new(),
        format!("Files scanned: {}", result.files_scanned),
        format!("Violations found: {}", result.violations.len()),
        format!("Status: {}", if result.ok() { "PASSED" } else { "FAILED" }),
    ];
    if !result.violations.is_empty() {
        lines.push(String::new());
        lines.push("## Violations".to_string());
        for v in &result.violations {
            lines.push(format!("- **line {}** [{}] `{}`", v.line, v.rule, v.excerpt));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}
