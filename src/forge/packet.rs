//! Build packet rendering.
//!
//! The packet is the text handed to the build worker. First attempts are
//! deterministic from the proposal; retries append previous-attempt
//! facts, research findings, and an optional advisory.

use crate::forge::classify::FailureRecord;
use crate::forge::paths::PathConvention;
use crate::ledger::SkillProposal;

/// Inputs that shape the allowlist section of a packet.
#[derive(Debug, Clone)]
pub struct PacketContext<'a> {
    pub paths: &'a PathConvention,
    pub optional_allowlist: &'a [String],
}

/// Render the deterministic base packet for a proposal.
pub fn render_packet(proposal: &SkillProposal, ctx: &PacketContext<'_>) -> String {
    let skill_rel = ctx.paths.skill_rel(&proposal.name);
    let test_rel = ctx.paths.test_rel(&proposal.name);
    let optional_files = if ctx.optional_allowlist.is_empty() {
        "(none)".to_string()
    } else {
        ctx.optional_allowlist
            .iter()
            .map(|p| format!("{p}\n"))
            .collect::<String>()
            .trim_end()
            .to_string()
    };

    format!(
        r#"# Build Packet: {name}

## Task
Generate a skill implementation for "{name}".

## Skill Specification
- **Name**: {name}
- **Description**: {description}
- **Side Effect Class**: {side_effect}

## Input Schema
```json
{input_schema}
```

## Output Schema
```json
{output_schema}
```

## Requirements
1. Create `{skill_rel}` implementing `BaseSkill`
2. The skill class must define: name, side_effect_class, input_model, output_model
3. Implement the `execute()` method
4. Use Pydantic models for input/output validation
5. Do NOT use any forbidden imports (subprocess, os.system, eval, exec)

## File Structure (required)
```
{skill_rel}  -- skill implementation
{test_rel}  -- unit tests
```

## Optional runtime support files
If the skill requires additions to shared runtime infrastructure, you MAY
also modify these files:
```
{optional_files}
```

## Constraints
- ONLY create/modify the files listed above (required + optional).
- Do NOT modify any other files.
- Runtime support files must NOT import from governance modules.
- Do NOT run, commit, or push anything.
"#,
        name = proposal.name,
        description = proposal.description,
        side_effect = proposal.side_effect_class.as_str(),
        input_schema = proposal.input_schema_json,
        output_schema = proposal.output_schema_json,
        skill_rel = skill_rel,
        test_rel = test_rel,
        optional_files = optional_files,
    )
}

/// Enrich a base packet with retry context.
///
/// Appends the previous attempt's classification and facts, then any
/// research-note content and advisory text. The specification sections of
/// the base packet are never altered.
pub fn render_retry_packet(
    base: &str,
    failure: &FailureRecord,
    research_note: Option<&str>,
    advisory: Option<&str>,
) -> String {
    let mut sections = vec![base.trim_end().to_string()];

    let mut attempt = format!(
        "\n## Previous Attempt ({})\n- **Failure kind**: {}",
        failure.attempt_number,
        failure.kind.as_str()
    );
    for fact in &failure.facts {
        attempt.push_str(&format!("\n- {fact}"));
    }
    sections.push(attempt);

    if let Some(note) = research_note {
        sections.push(format!("\n## Research Findings\n{note}"));
    }
    if let Some(advisory) = advisory {
        sections.push(format!("\n## LLM Advisory\n{advisory}"));
    }

    let mut out = sections.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::classify::{FailureKind, FailureRecord};
    use crate::ledger::{ProposalStatus, SideEffectClass};

    fn proposal() -> SkillProposal {
        SkillProposal {
            id: "abc123".to_string(),
            name: "write_note".to_string(),
            description: "Write a note".to_string(),
            input_schema_json: r#"{"title": "str", "body": "str"}"#.to_string(),
            output_schema_json: r#"{"path": "str"}"#.to_string(),
            side_effect_class: SideEffectClass::FileWrite,
            required_secrets_json: "[]".to_string(),
            status: ProposalStatus::Proposed,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn packet_contains_spec_fields_and_paths() {
        let paths = PathConvention::new("skills", "tests");
        let ctx = PacketContext {
            paths: &paths,
            optional_allowlist: &[],
        };
        let packet = render_packet(&proposal(), &ctx);

        assert!(packet.contains("# Build Packet: write_note"));
        assert!(packet.contains("FILE_WRITE"));
        assert!(packet.contains("skills/write_note.py"));
        assert!(packet.contains("tests/test_skill_write_note.py"));
        assert!(packet.contains(r#"{"title": "str", "body": "str"}"#));
    }

    #[test]
    fn packet_is_deterministic() {
        let paths = PathConvention::new("skills", "tests");
        let ctx = PacketContext {
            paths: &paths,
            optional_allowlist: &[],
        };
        let a = render_packet(&proposal(), &ctx);
        let b = render_packet(&proposal(), &ctx);
        assert_eq!(a, b);
    }

    #[test]
    fn packet_lists_optional_allowlist_entries() {
        let paths = PathConvention::new("skills", "tests");
        let optional = vec!["runtime/gateway.py".to_string()];
        let ctx = PacketContext {
            paths: &paths,
            optional_allowlist: &optional,
        };
        let packet = render_packet(&proposal(), &ctx);
        assert!(packet.contains("runtime/gateway.py"));
    }

    #[test]
    fn retry_packet_appends_previous_attempt() {
        let paths = PathConvention::new("skills", "tests");
        let ctx = PacketContext {
            paths: &paths,
            optional_allowlist: &[],
        };
        let base = render_packet(&proposal(), &ctx);
        let failure = FailureRecord {
            kind: FailureKind::GateViolation,
            facts: vec!["Disallowed files: rogue.txt".to_string()],
            log_excerpt: String::new(),
            attempt_number: 1,
            build_id: "b1".to_string(),
        };

        let retry = render_retry_packet(&base, &failure, Some("note body"), None);
        assert!(retry.starts_with(base.trim_end()));
        assert!(retry.contains("## Previous Attempt (1)"));
        assert!(retry.contains("GATE_VIOLATION"));
        assert!(retry.contains("Disallowed files: rogue.txt"));
        assert!(retry.contains("## Research Findings\nnote body"));
        assert!(!retry.contains("## LLM Advisory"));
    }

    #[test]
    fn retry_packet_includes_advisory_when_present() {
        let failure = FailureRecord {
            kind: FailureKind::VerifyLint,
            facts: vec![],
            log_excerpt: String::new(),
            attempt_number: 2,
            build_id: "b2".to_string(),
        };
        let retry = render_retry_packet("base", &failure, None, Some("try pinning imports"));
        assert!(retry.contains("## LLM Advisory\ntry pinning imports"));
    }
}
