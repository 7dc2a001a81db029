//! Retry engine: research notes, packet enrichment, bounded advisory.
//!
//! Two layers. The deterministic layer classifies the failure and
//! appends a previous-attempt section to the packet. The optional
//! advisory layer asks the LLM gateway for a corrected packet; an
//! unreachable gateway or malformed response degrades to
//! deterministic-only and records the `AMBIGUOUS` trigger. The engine
//! never opens a build: it returns the enriched packet and the trigger
//! set, and the caller decides.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::error::{KilnError, Result};
use crate::forge::classify::{
    classify_failure, evaluate_triggers, EscalationTrigger, FailureRecord, TriggerContext,
};
use crate::forge::packet::render_retry_packet;
use crate::ledger::{ArtifactKind, ArtifactRecord, BuildOutcome, Ledger};

/// Advisory capability; implemented by the production gateway and by
/// scripted stand-ins under test.
pub trait Advisor {
    fn advise(&self, prompt: &str) -> Result<String>;
}

impl Advisor for crate::gateway::Gateway {
    fn advise(&self, prompt: &str) -> Result<String> {
        self.chat(prompt)
    }
}

/// Analyze a failed build and produce a `RESEARCH_NOTE` artifact.
///
/// The build must be `FAILED`, or have a failed verification record.
pub fn research_build(
    ledger: &Ledger,
    store: &ArtifactStore,
    build_id: &str,
    user_hint: Option<&str>,
) -> Result<(FailureRecord, ArtifactRecord)> {
    let build = ledger.build(build_id)?;
    let verification = ledger.verification_for_build(build_id)?;

    let build_failed = build.outcome == BuildOutcome::Failed;
    let verify_failed = verification.as_ref().map(|v| !v.all_ok).unwrap_or(false);
    if !build_failed && !verify_failed {
        return Err(KilnError::InvalidTransition(format!(
            "build '{build_id}' is not failed and has no failed verification"
        )));
    }

    let build_log = match &build.log_artifact_id {
        Some(artifact_id) => store.get_text(ledger, artifact_id)?,
        None => String::new(),
    };
    let record = classify_failure(&build, &build_log, verification.as_ref());

    let note = render_research_note(&record, user_hint);
    let artifact = store.put_text(
        ledger,
        &note,
        ArtifactKind::ResearchNote,
        Some(&build.proposal_id),
    )?;
    info!(build = %build_id, kind = record.kind.as_str(), "research note recorded");
    Ok((record, artifact))
}

fn render_research_note(record: &FailureRecord, user_hint: Option<&str>) -> String {
    let mut lines = vec![
        format!("# Research Note: Build {}", record.build_id),
        String::new(),
        format!("## Failure Classification: {}", record.kind.as_str()),
        String::new(),
        format!("**Attempt:** {}", record.attempt_number),
        format!("**Build ID:** {}", record.build_id),
        String::new(),
        "## Facts".to_string(),
    ];
    for fact in &record.facts {
        lines.push(format!("- {fact}"));
    }
    if let Some(hint) = user_hint {
        lines.push(String::new());
        lines.push("## User Hint".to_string());
        lines.push(hint.to_string());
    }
    if !record.log_excerpt.is_empty() {
        lines.push(String::new());
        lines.push("## Log Excerpt".to_string());
        lines.push(format!("```\n{}\n```", record.log_excerpt));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// The retry engine's output: enriched packet plus escalation triggers.
///
/// A non-empty trigger set requires explicit human approval before the
/// caller opens another build.
#[derive(Debug, Clone)]
pub struct RetryPlan {
    pub deterministic_packet: String,
    pub advisory_packet: Option<String>,
    pub triggers: BTreeSet<EscalationTrigger>,
}

impl RetryPlan {
    /// The packet the next attempt should use: the advisory proposal
    /// when one arrived, the deterministic enrichment otherwise.
    pub fn packet(&self) -> &str {
        self.advisory_packet
            .as_deref()
            .unwrap_or(&self.deterministic_packet)
    }

    pub fn requires_approval(&self) -> bool {
        !self.triggers.is_empty()
    }
}

/// Produce the next packet for a failed build.
pub fn plan_retry(
    ledger: &Ledger,
    store: &ArtifactStore,
    build_id: &str,
    record: &FailureRecord,
    escalating_keywords: &[String],
    advisor: Option<&dyn Advisor>,
) -> Result<RetryPlan> {
    let build = ledger.build(build_id)?;
    let original_packet = match &build.packet_artifact_id {
        Some(artifact_id) => store.get_text(ledger, artifact_id)?,
        None => String::new(),
    };

    let deterministic_packet = render_retry_packet(&original_packet, record, None, None);

    let mut advisory_packet = None;
    let mut advisory_unavailable = false;
    if let Some(advisor) = advisor {
        match advisor.advise(&advisory_prompt(record, &original_packet)) {
            Ok(proposed) if !proposed.trim().is_empty() => {
                advisory_packet = Some(proposed);
            }
            Ok(_) => {
                warn!("advisory returned empty packet, falling back to deterministic");
                advisory_unavailable = true;
            }
            Err(err) => {
                warn!("advisory unavailable: {err}");
                advisory_unavailable = true;
            }
        }
    }

    let consecutive_failures = trailing_failures(ledger, &build.proposal_id)?;
    let proposed = advisory_packet
        .as_deref()
        .unwrap_or(&deterministic_packet);
    let mut triggers = evaluate_triggers(
        record,
        &TriggerContext {
            consecutive_failures,
            escalating_keywords,
            original_packet: &original_packet,
            proposed_packet: proposed,
        },
    );
    if advisory_unavailable {
        triggers.insert(EscalationTrigger::Ambiguous);
    }

    Ok(RetryPlan {
        deterministic_packet,
        advisory_packet,
        triggers,
    })
}

/// Consecutive FAILED attempts at the tail of the proposal's chain.
fn trailing_failures(ledger: &Ledger, proposal_id: &str) -> Result<usize> {
    let builds = ledger.builds_for_proposal(proposal_id)?;
    Ok(builds
        .iter()
        .rev()
        .take_while(|b| b.outcome == BuildOutcome::Failed)
        .count())
}

fn advisory_prompt(record: &FailureRecord, original_packet: &str) -> String {
    let facts = record
        .facts
        .iter()
        .map(|f| format!("- {f}"))
        .collect::<Vec<_>>()
        .join("\n");
    let excerpt: String = record.log_excerpt.chars().take(1500).collect();
    format!(
        r#"You are a build system assistant. A skill build attempt failed.

## Failure Classification
- **Kind:** {kind}
- **Attempt:** {attempt}

## Facts
{facts}

## Log Excerpt
```
{excerpt}
```

## Original BUILD_PACKET
```markdown
{original_packet}
```

## Task
Propose a corrected BUILD_PACKET that addresses the failure. Output ONLY the
corrected BUILD_PACKET content (markdown), nothing else. Keep the same
structure but fix the instructions to avoid the failure. Do NOT widen
permissions, add secrets, or change the side effect class."#,
        kind = record.kind.as_str(),
        attempt = record.attempt_number,
    )
}
