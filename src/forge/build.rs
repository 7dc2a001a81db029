//! Build orchestration: packet framing, sandbox phases, outcome records.
//!
//! One call drives a full attempt: open the build under the proposal
//! lock, frame the packet, prepare the sandbox, invoke the worker, gate
//! the diff, copy back, and record the outcome with a build-log
//! artifact. Failures are recorded on the build and never swallowed.

use tracing::{info, warn};

use crate::artifacts::{hash_bytes, ArtifactStore};
use crate::config::Config;
use crate::error::Result;
use crate::forge::classify::{FailureKind, FailureRecord};
use crate::forge::copyback::safe_copy_back;
use crate::forge::gate::{diff_allowlist_gate, Allowlist, DiffGateReport};
use crate::forge::packet::{render_packet, render_retry_packet, PacketContext};
use crate::forge::paths::PathConvention;
use crate::forge::sandbox::{create_sandbox, prune_workspaces, remove_sandbox, Sandbox};
use crate::forge::worker::{BuildWorker, WorkerOutput};
use crate::ledger::{
    ArtifactKind, BuildAttempt, BuildOutcome, Ledger, ProposalLocks, SkillProposal,
};

const STDOUT_MAX: usize = 50_000;
const STDERR_MAX: usize = 10_000;

/// Shared context for build runs.
pub struct BuildContext<'a> {
    pub ledger: &'a Ledger,
    pub store: &'a ArtifactStore,
    pub locks: &'a ProposalLocks,
    pub config: &'a Config,
    pub project_root: &'a std::path::Path,
    pub paths: &'a PathConvention,
    pub worker: &'a dyn BuildWorker,
}

/// Outcome of one build attempt.
#[derive(Debug)]
pub struct BuildRun {
    pub build: BuildAttempt,
    pub succeeded: bool,
    pub gate: Option<DiffGateReport>,
    /// Files the gate admitted, for downstream scope checks.
    pub changed_files: Vec<String>,
    /// Workspace path when it was retained for debugging.
    pub retained_sandbox: Option<std::path::PathBuf>,
}

/// Frame the packet for an attempt: deterministic for the first, and
/// enriched with the latest research note for retries.
pub fn frame_packet(
    ctx: &BuildContext<'_>,
    proposal: &SkillProposal,
    attempt_number: i64,
    parent_build_id: Option<&str>,
) -> Result<String> {
    let packet_ctx = PacketContext {
        paths: ctx.paths,
        optional_allowlist: &ctx.config.sandbox.optional_allowlist,
    };
    let base = render_packet(proposal, &packet_ctx);
    if attempt_number <= 1 {
        return Ok(base);
    }

    let research_note = latest_research_note(ctx, &proposal.id)?;
    let Some(note) = research_note else {
        return Ok(base);
    };
    let failure = FailureRecord {
        kind: FailureKind::Unknown,
        facts: vec!["See research note for details".to_string()],
        log_excerpt: String::new(),
        attempt_number: attempt_number - 1,
        build_id: parent_build_id.unwrap_or("").to_string(),
    };
    Ok(render_retry_packet(&base, &failure, Some(&note), None))
}

fn latest_research_note(ctx: &BuildContext<'_>, proposal_id: &str) -> Result<Option<String>> {
    let artifacts = ctx.ledger.artifacts_for_related(proposal_id)?;
    for artifact in artifacts.iter().rev() {
        if artifact.kind == ArtifactKind::ResearchNote {
            return Ok(Some(ctx.store.get_text(ctx.ledger, &artifact.id)?));
        }
    }
    Ok(None)
}

/// Run one complete build attempt for a proposal.
///
/// `packet_override` replaces the framed packet; the retry engine uses
/// it to hand over an enriched packet after human approval.
pub fn run_build(
    ctx: &BuildContext<'_>,
    proposal_id: &str,
    packet_override: Option<&str>,
) -> Result<BuildRun> {
    let _lock = ctx.locks.acquire(proposal_id)?;

    let proposal = ctx.ledger.proposal(proposal_id)?;
    let build = ctx.ledger.open_build(proposal_id, None)?;

    let packet = match packet_override {
        Some(packet) => packet.to_string(),
        None => frame_packet(ctx, &proposal, build.attempt_number, build.parent_build_id.as_deref())?,
    };
    let packet_artifact =
        ctx.store
            .put_text(ctx.ledger, &packet, ArtifactKind::BuildPacket, Some(proposal_id))?;
    ctx.ledger.set_build_packet(&build.id, &packet_artifact.id)?;

    let sandbox = create_sandbox(ctx.project_root, &ctx.config.paths.scratch_root, &build.id)?;
    info!(build = %build.id, attempt = build.attempt_number, "worker starting");
    let output = match ctx.worker.invoke(&sandbox.repo, &packet) {
        Ok(output) => output,
        Err(err) => {
            let log = log_content(ctx, &build, &packet, &sandbox, None, None, &err.to_string());
            return fail_build(
                ctx,
                build,
                &sandbox,
                &log,
                FailureKind::BuildError,
                &format!("worker invocation failed: {err}"),
            );
        }
    };

    if output.timed_out {
        let log = log_content(
            ctx,
            &build,
            &packet,
            &sandbox,
            Some(&output),
            None,
            &format!(
                "## Result: TIMEOUT after {}s",
                ctx.config.sandbox.timeout_secs
            ),
        );
        return fail_build(
            ctx,
            build,
            &sandbox,
            &log,
            FailureKind::Timeout,
            &format!("Timeout after {}s", ctx.config.sandbox.timeout_secs),
        );
    }

    let allowlist = Allowlist::for_proposal(
        &proposal.name,
        ctx.paths,
        &ctx.config.sandbox.optional_allowlist,
    );
    let gate = diff_allowlist_gate(&sandbox.repo, &allowlist)?;
    let log = log_content(ctx, &build, &packet, &sandbox, Some(&output), Some(&gate), "");

    if !gate.ok {
        let summary = format!("Diff gate failed: {}", gate.summary());
        let mut run = fail_build(
            ctx,
            build,
            &sandbox,
            &log,
            FailureKind::GateViolation,
            &summary,
        )?;
        run.gate = Some(gate);
        return Ok(run);
    }

    if !output.succeeded() {
        let summary = format!(
            "worker exited nonzero: {}",
            output.exit_code.unwrap_or(-1)
        );
        let mut run = fail_build(
            ctx,
            build,
            &sandbox,
            &log,
            FailureKind::BuildError,
            &summary,
        )?;
        run.gate = Some(gate);
        return Ok(run);
    }

    let copied = match safe_copy_back(&sandbox.repo, ctx.project_root, &gate.allowed) {
        Ok(copied) => copied,
        Err(err) => {
            let summary = format!("Copy-back rejected: {err}");
            let mut run = fail_build(
                ctx,
                build,
                &sandbox,
                &log,
                FailureKind::GateViolation,
                &summary,
            )?;
            run.gate = Some(gate);
            return Ok(run);
        }
    };

    let log_artifact =
        ctx.store
            .put_text(ctx.ledger, &log, ArtifactKind::BuildLog, Some(&build.proposal_id))?;
    ctx.ledger.record_build_result(
        &build.id,
        BuildOutcome::Succeeded,
        Some(&log_artifact.id),
        None,
        Some(&format!("Build succeeded, copied: {}", copied.join(", "))),
    )?;
    remove_sandbox(&sandbox)?;

    info!(build = %build.id, "build succeeded");
    let build = ctx.ledger.build(&build.id)?;
    Ok(BuildRun {
        succeeded: true,
        changed_files: gate.allowed.clone(),
        gate: Some(gate),
        retained_sandbox: None,
        build,
    })
}

fn fail_build(
    ctx: &BuildContext<'_>,
    build: BuildAttempt,
    sandbox: &Sandbox,
    log: &str,
    kind: FailureKind,
    summary: &str,
) -> Result<BuildRun> {
    let log_artifact =
        ctx.store
            .put_text(ctx.ledger, log, ArtifactKind::BuildLog, Some(&build.proposal_id))?;
    ctx.ledger.record_build_result(
        &build.id,
        BuildOutcome::Failed,
        Some(&log_artifact.id),
        Some(kind.as_str()),
        Some(summary),
    )?;

    let retained_sandbox = if ctx.config.sandbox.retain_failed {
        prune_workspaces(
            &ctx.config.paths.scratch_root,
            ctx.config.sandbox.retain_max,
        )?;
        Some(sandbox.workspace.clone())
    } else {
        remove_sandbox(sandbox)?;
        None
    };

    warn!(build = %build.id, kind = kind.as_str(), "build failed: {summary}");
    let build = ctx.ledger.build(&build.id)?;
    Ok(BuildRun {
        succeeded: false,
        gate: None,
        changed_files: Vec::new(),
        retained_sandbox,
        build,
    })
}

fn truncate(text: &str, max: usize) -> (&str, bool) {
    if text.len() <= max {
        return (text, false);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}

fn log_content(
    ctx: &BuildContext<'_>,
    build: &BuildAttempt,
    packet: &str,
    sandbox: &Sandbox,
    output: Option<&WorkerOutput>,
    gate: Option<&DiffGateReport>,
    note: &str,
) -> String {
    let mut lines = vec![
        format!("# Build Log: build {}", build.id),
        String::new(),
        "## Metadata".to_string(),
        format!("- **Build ID**: `{}`", build.id),
        format!("- **Proposal ID**: `{}`", build.proposal_id),
        format!("- **Attempt**: {}", build.attempt_number),
        format!("- **Packet SHA256**: `{}`", hash_bytes(packet.as_bytes())),
        format!("- **Sandbox**: `{}`", sandbox.repo.display()),
        format!("- **Command**: `{}`", ctx.worker.describe()),
        String::new(),
    ];

    if !note.is_empty() {
        lines.push(note.to_string());
        lines.push(String::new());
    }

    if let Some(output) = output {
        if !output.timed_out {
            lines.push(format!("## Exit code: {}", output.exit_code.unwrap_or(-1)));
        }
        let (stdout, stdout_truncated) = truncate(&output.stdout, STDOUT_MAX);
        lines.push(format!(
            "## stdout ({} bytes{})",
            output.stdout.len(),
            if stdout_truncated { ", truncated" } else { "" }
        ));
        lines.push(format!("```\n{stdout}\n```"));
        let (stderr, stderr_truncated) = truncate(&output.stderr, STDERR_MAX);
        lines.push(format!(
            "## stderr ({} bytes{})",
            output.stderr.len(),
            if stderr_truncated { ", truncated" } else { "" }
        ));
        lines.push(format!("```\n{stderr}\n```"));
    }

    if let Some(gate) = gate {
        lines.push(format!(
            "## Diff Allowlist Gate: {}",
            if gate.ok { "PASS" } else { "FAIL" }
        ));
        lines.push(format!("- Changed (tracked): {:?}", gate.changed_tracked));
        lines.push(format!("- Changed (untracked): {:?}", gate.changed_untracked));
        lines.push(format!("- Allowed: {:?}", gate.allowed));
        if !gate.violations.is_empty() {
            lines.push(format!("- Violations: {:?}", gate.violations));
        }
        if !gate.required_missing.is_empty() {
            lines.push(format!("- Required missing: {:?}", gate.required_missing));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}
