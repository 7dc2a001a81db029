//! Proposal intake.

use serde_json::Value as JsonValue;

use crate::artifacts::ArtifactStore;
use crate::error::{KilnError, Result};
use crate::forge::paths::validate_name;
use crate::ledger::{ArtifactKind, ArtifactRecord, Ledger, ProposalSpec, SkillProposal};

/// Create a skill proposal and write its `SKILL_SPEC` artifact.
///
/// Validates the name and both schemas before anything is recorded.
pub fn propose_skill(
    ledger: &Ledger,
    store: &ArtifactStore,
    spec: &ProposalSpec,
) -> Result<(SkillProposal, ArtifactRecord)> {
    validate_name(&spec.name)?;
    for (label, schema) in [
        ("input schema", &spec.input_schema_json),
        ("output schema", &spec.output_schema_json),
    ] {
        let parsed: JsonValue = serde_json::from_str(schema)
            .map_err(|err| KilnError::InvalidInput(format!("{label} is not valid JSON: {err}")))?;
        if !parsed.is_object() {
            return Err(KilnError::InvalidInput(format!(
                "{label} must be a JSON object"
            )));
        }
    }

    let proposal = ledger.create_proposal(spec)?;
    let artifact = store.put_text(
        ledger,
        &render_spec_artifact(&proposal),
        ArtifactKind::SkillSpec,
        Some(&proposal.id),
    )?;
    Ok((proposal, artifact))
}

fn render_spec_artifact(proposal: &SkillProposal) -> String {
    format!(
        r#"# Skill Specification: {name}

## Description
{description}

## Side Effect Class
{side_effect}

## Required Secrets
{secrets}

## Input Schema
```json
{input_schema}
```

## Output Schema
```json
{output_schema}
```
"#,
        name = proposal.name,
        description = proposal.description,
        side_effect = proposal.side_effect_class.as_str(),
        secrets = proposal.required_secrets_json,
        input_schema = proposal.input_schema_json,
        output_schema = proposal.output_schema_json,
    )
}
