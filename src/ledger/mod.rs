//! Canonical ledger: proposals, builds, verifications, promotions, artifacts.
//!
//! The ledger is the single owner of lifecycle state. Status transitions
//! are guarded at the application level (SQLite CHECK constraints cannot
//! be widened in place; migrations recreate tables instead), and every
//! multi-row mutation is bracketed by a transaction.

mod migrations;
pub mod models;

use std::collections::HashSet;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{KilnError, Result};
pub use migrations::SCHEMA_VERSION;
pub use models::{
    ArtifactKind, ArtifactRecord, BuildAttempt, BuildOutcome, PromotionRecord, ProposalSpec,
    ProposalStatus, SideEffectClass, SkillProposal, VerificationGates, VerificationRecord,
};
use models::{new_id, now_iso};

/// Handle over the ledger database.
pub struct Ledger {
    conn: Connection,
    schema_version: u32,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("schema_version", &self.schema_version)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open (and migrate) the ledger at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| KilnError::StoreUnavailable(format!("ledger dir: {err}")))?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory ledger for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let schema_version = migrations::run_migrations(&conn)?;
        Ok(Self {
            conn,
            schema_version,
        })
    }

    /// Raw connection, for read-only queries in tests and diagnostics.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Schema version after migrations.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    // ------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------

    /// Insert a new proposal in status `PROPOSED`.
    pub fn create_proposal(&self, spec: &ProposalSpec) -> Result<SkillProposal> {
        let proposal = SkillProposal {
            id: new_id(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            input_schema_json: spec.input_schema_json.clone(),
            output_schema_json: spec.output_schema_json.clone(),
            side_effect_class: spec.side_effect_class,
            required_secrets_json: serde_json::to_string(&spec.required_secrets)?,
            status: ProposalStatus::Proposed,
            created_at: now_iso(),
        };
        self.conn.execute(
            "INSERT INTO skill_proposals
             (id, name, description, input_schema_json, output_schema_json,
              side_effect_class, required_secrets_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                proposal.id,
                proposal.name,
                proposal.description,
                proposal.input_schema_json,
                proposal.output_schema_json,
                proposal.side_effect_class.as_str(),
                proposal.required_secrets_json,
                proposal.status.as_str(),
                proposal.created_at,
            ],
        )?;
        debug!(id = %proposal.id, name = %proposal.name, "proposal created");
        Ok(proposal)
    }

    pub fn proposal(&self, proposal_id: &str) -> Result<SkillProposal> {
        self.conn
            .query_row(
                "SELECT id, name, description, input_schema_json, output_schema_json,
                        side_effect_class, required_secrets_json, status, created_at
                 FROM skill_proposals WHERE id = ?1",
                [proposal_id],
                models::proposal_from_row,
            )
            .optional()?
            .ok_or_else(|| KilnError::UnknownEntity(format!("proposal '{proposal_id}'")))
    }

    /// Latest TRUSTED proposal with the given name, if any.
    pub fn trusted_proposal_by_name(&self, name: &str) -> Result<Option<SkillProposal>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, description, input_schema_json, output_schema_json,
                        side_effect_class, required_secrets_json, status, created_at
                 FROM skill_proposals
                 WHERE name = ?1 AND status = 'TRUSTED'
                 ORDER BY created_at DESC LIMIT 1",
                [name],
                models::proposal_from_row,
            )
            .optional()?)
    }

    pub fn list_proposals(&self, status: Option<ProposalStatus>) -> Result<Vec<SkillProposal>> {
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, name, description, input_schema_json, output_schema_json,
                            side_effect_class, required_secrets_json, status, created_at
                     FROM skill_proposals WHERE status = ?1 ORDER BY created_at",
                )?;
                let rows = stmt.query_map([status.as_str()], models::proposal_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, name, description, input_schema_json, output_schema_json,
                            side_effect_class, required_secrets_json, status, created_at
                     FROM skill_proposals ORDER BY created_at",
                )?;
                let rows = stmt.query_map([], models::proposal_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn query_status(&self, proposal_id: &str) -> Result<ProposalStatus> {
        Ok(self.proposal(proposal_id)?.status)
    }

    fn set_status_tx(
        conn: &Connection,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(KilnError::InvalidTransition(format!(
                "proposal '{proposal_id}': {} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }
        let updated = conn.execute(
            "UPDATE skill_proposals SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![to.as_str(), proposal_id, from.as_str()],
        )?;
        if updated != 1 {
            return Err(KilnError::ConcurrentModification(format!(
                "proposal '{proposal_id}' no longer in status {}",
                from.as_str()
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Builds
    // ------------------------------------------------------------------

    /// Open a new build attempt.
    ///
    /// Fails with `InvalidTransition` unless the proposal is in
    /// `PROPOSED` or `BUILT` (a `BUILT` proposal is reset to `PROPOSED`),
    /// or when another build for the proposal is still in flight. When
    /// `parent_build_id` is given it must be the latest attempt.
    pub fn open_build(
        &self,
        proposal_id: &str,
        parent_build_id: Option<&str>,
    ) -> Result<BuildAttempt> {
        let proposal = self.proposal(proposal_id)?;
        if !matches!(
            proposal.status,
            ProposalStatus::Proposed | ProposalStatus::Built
        ) {
            return Err(KilnError::InvalidTransition(format!(
                "proposal '{proposal_id}' has status {}, expected PROPOSED or BUILT",
                proposal.status.as_str()
            )));
        }

        let in_flight: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM builds WHERE proposal_id = ?1 AND outcome = 'PENDING'",
            [proposal_id],
            |row| row.get(0),
        )?;
        if in_flight > 0 {
            return Err(KilnError::InvalidTransition(format!(
                "proposal '{proposal_id}' already has a build in flight"
            )));
        }

        let latest = self.latest_build(proposal_id)?;
        let expected_parent = latest.as_ref().map(|b| b.id.as_str());
        if let Some(parent) = parent_build_id {
            if expected_parent != Some(parent) {
                return Err(KilnError::InvalidInput(format!(
                    "parent build '{parent}' is not the latest attempt for '{proposal_id}'"
                )));
            }
        }
        let attempt_number = latest.as_ref().map(|b| b.attempt_number).unwrap_or(0) + 1;

        let build = BuildAttempt {
            id: new_id(),
            proposal_id: proposal_id.to_string(),
            attempt_number,
            parent_build_id: expected_parent.map(String::from),
            packet_artifact_id: None,
            log_artifact_id: None,
            outcome: BuildOutcome::Pending,
            failure_kind: None,
            summary: None,
            started_at: now_iso(),
            finished_at: None,
        };

        let tx = self.conn.unchecked_transaction()?;
        if proposal.status == ProposalStatus::Built {
            Self::set_status_tx(
                &tx,
                proposal_id,
                ProposalStatus::Built,
                ProposalStatus::Proposed,
            )?;
        }
        tx.execute(
            "INSERT INTO builds
             (id, proposal_id, attempt_number, parent_build_id, packet_artifact_id,
              log_artifact_id, outcome, failure_kind, summary, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                build.id,
                build.proposal_id,
                build.attempt_number,
                build.parent_build_id,
                build.packet_artifact_id,
                build.log_artifact_id,
                build.outcome.as_str(),
                build.failure_kind,
                build.summary,
                build.started_at,
                build.finished_at,
            ],
        )?;
        tx.commit()?;
        debug!(id = %build.id, attempt = build.attempt_number, "build opened");
        Ok(build)
    }

    /// Attach the framed build packet artifact to an open build.
    pub fn set_build_packet(&self, build_id: &str, packet_artifact_id: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE builds SET packet_artifact_id = ?1 WHERE id = ?2 AND outcome = 'PENDING'",
            params![packet_artifact_id, build_id],
        )?;
        if updated != 1 {
            return Err(KilnError::InvalidTransition(format!(
                "build '{build_id}' is not pending"
            )));
        }
        Ok(())
    }

    /// Record the outcome of a build attempt.
    ///
    /// Advances the proposal to `BUILT` on success.
    pub fn record_build_result(
        &self,
        build_id: &str,
        outcome: BuildOutcome,
        log_artifact_id: Option<&str>,
        failure_kind: Option<&str>,
        summary: Option<&str>,
    ) -> Result<()> {
        if outcome == BuildOutcome::Pending {
            return Err(KilnError::InvalidInput(
                "cannot record PENDING as a build result".to_string(),
            ));
        }
        let build = self.build(build_id)?;
        if build.outcome != BuildOutcome::Pending {
            return Err(KilnError::InvalidTransition(format!(
                "build '{build_id}' already has outcome {}",
                build.outcome.as_str()
            )));
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE builds
             SET outcome = ?1, log_artifact_id = ?2, failure_kind = ?3,
                 summary = ?4, finished_at = ?5
             WHERE id = ?6",
            params![
                outcome.as_str(),
                log_artifact_id,
                failure_kind,
                summary,
                now_iso(),
                build_id,
            ],
        )?;
        if outcome == BuildOutcome::Succeeded {
            Self::set_status_tx(
                &tx,
                &build.proposal_id,
                ProposalStatus::Proposed,
                ProposalStatus::Built,
            )?;
        }
        tx.commit()?;
        debug!(id = %build_id, outcome = outcome.as_str(), "build result recorded");
        Ok(())
    }

    pub fn build(&self, build_id: &str) -> Result<BuildAttempt> {
        self.conn
            .query_row(
                "SELECT id, proposal_id, attempt_number, parent_build_id,
                        packet_artifact_id, log_artifact_id, outcome, failure_kind,
                        summary, started_at, finished_at
                 FROM builds WHERE id = ?1",
                [build_id],
                models::build_from_row,
            )
            .optional()?
            .ok_or_else(|| KilnError::UnknownEntity(format!("build '{build_id}'")))
    }

    pub fn builds_for_proposal(&self, proposal_id: &str) -> Result<Vec<BuildAttempt>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, proposal_id, attempt_number, parent_build_id,
                    packet_artifact_id, log_artifact_id, outcome, failure_kind,
                    summary, started_at, finished_at
             FROM builds WHERE proposal_id = ?1 ORDER BY attempt_number",
        )?;
        let rows = stmt.query_map([proposal_id], models::build_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn latest_build(&self, proposal_id: &str) -> Result<Option<BuildAttempt>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, proposal_id, attempt_number, parent_build_id,
                        packet_artifact_id, log_artifact_id, outcome, failure_kind,
                        summary, started_at, finished_at
                 FROM builds WHERE proposal_id = ?1
                 ORDER BY attempt_number DESC LIMIT 1",
                [proposal_id],
                models::build_from_row,
            )
            .optional()?)
    }

    // ------------------------------------------------------------------
    // Verifications
    // ------------------------------------------------------------------

    /// Record the verification for a completed build, exactly once.
    ///
    /// Advances the proposal to `VERIFIED` when all five gates pass.
    pub fn record_verification(
        &self,
        build_id: &str,
        gates: &VerificationGates,
        report_artifact_id: Option<&str>,
    ) -> Result<VerificationRecord> {
        let build = self.build(build_id)?;
        if build.outcome == BuildOutcome::Pending {
            return Err(KilnError::InvalidTransition(format!(
                "build '{build_id}' has not completed"
            )));
        }
        if self.verification_for_build(build_id)?.is_some() {
            return Err(KilnError::InvalidTransition(format!(
                "build '{build_id}' already has a verification record"
            )));
        }

        let record = VerificationRecord {
            id: new_id(),
            build_id: build_id.to_string(),
            gates: gates.clone(),
            all_ok: gates.all_ok(),
            report_artifact_id: report_artifact_id.map(String::from),
            created_at: now_iso(),
        };

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO verifications
             (id, build_id, ruff_ok, mypy_ok, pytest_ok, policy_ok, invariants_ok,
              all_ok, report_artifact_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.build_id,
                record.gates.ruff_ok as i64,
                record.gates.mypy_ok as i64,
                record.gates.pytest_ok as i64,
                record.gates.policy_ok as i64,
                record.gates.invariants_ok as i64,
                record.all_ok as i64,
                record.report_artifact_id,
                record.created_at,
            ],
        )?;
        if record.all_ok {
            Self::set_status_tx(
                &tx,
                &build.proposal_id,
                ProposalStatus::Built,
                ProposalStatus::Verified,
            )?;
        }
        tx.commit()?;
        Ok(record)
    }

    pub fn verification_for_build(&self, build_id: &str) -> Result<Option<VerificationRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, build_id, ruff_ok, mypy_ok, pytest_ok, policy_ok,
                        invariants_ok, all_ok, report_artifact_id, created_at
                 FROM verifications WHERE build_id = ?1",
                [build_id],
                models::verification_from_row,
            )
            .optional()?)
    }

    pub fn latest_verification(&self, proposal_id: &str) -> Result<Option<VerificationRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT v.id, v.build_id, v.ruff_ok, v.mypy_ok, v.pytest_ok,
                        v.policy_ok, v.invariants_ok, v.all_ok, v.report_artifact_id,
                        v.created_at
                 FROM verifications v JOIN builds b ON b.id = v.build_id
                 WHERE b.proposal_id = ?1
                 ORDER BY b.attempt_number DESC LIMIT 1",
                [proposal_id],
                models::verification_from_row,
            )
            .optional()?)
    }

    // ------------------------------------------------------------------
    // Promotions
    // ------------------------------------------------------------------

    /// Record a promotion to `TRUSTED`.
    ///
    /// `approved_by` is taken verbatim from the caller; no authentication
    /// is attempted. Requires status `VERIFIED` and a passing
    /// verification on the latest attempt.
    pub fn record_promotion(
        &self,
        proposal_id: &str,
        approved_by: &str,
        source_hash: &str,
    ) -> Result<PromotionRecord> {
        let proposal = self.proposal(proposal_id)?;
        if proposal.status != ProposalStatus::Verified {
            return Err(KilnError::InvalidTransition(format!(
                "proposal '{proposal_id}' has status {}, expected VERIFIED",
                proposal.status.as_str()
            )));
        }
        match self.latest_verification(proposal_id)? {
            Some(v) if v.all_ok => {}
            _ => {
                return Err(KilnError::InvalidTransition(format!(
                    "proposal '{proposal_id}' has no passing verification"
                )))
            }
        }

        let prior = self.latest_promotion(proposal_id)?;
        let record = PromotionRecord {
            id: new_id(),
            proposal_id: proposal_id.to_string(),
            approved_by: approved_by.to_string(),
            source_hash: source_hash.to_string(),
            prior_promotion_id: prior.map(|p| p.id),
            revoked: false,
            created_at: now_iso(),
        };

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO promotions
             (id, proposal_id, approved_by, source_hash, prior_promotion_id,
              revoked, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.proposal_id,
                record.approved_by,
                record.source_hash,
                record.prior_promotion_id,
                record.revoked as i64,
                record.created_at,
            ],
        )?;
        Self::set_status_tx(
            &tx,
            proposal_id,
            ProposalStatus::Verified,
            ProposalStatus::Trusted,
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Record a demotion: promotions are append-only, so a demotion is a
    /// new record with the `revoked` flag referencing the prior one.
    pub fn record_demotion(&self, proposal_id: &str, approved_by: &str) -> Result<PromotionRecord> {
        let prior = self.latest_promotion(proposal_id)?.ok_or_else(|| {
            KilnError::InvalidTransition(format!(
                "proposal '{proposal_id}' has never been promoted"
            ))
        })?;
        if prior.revoked {
            return Err(KilnError::InvalidTransition(format!(
                "proposal '{proposal_id}' is already demoted"
            )));
        }

        let record = PromotionRecord {
            id: new_id(),
            proposal_id: proposal_id.to_string(),
            approved_by: approved_by.to_string(),
            source_hash: prior.source_hash.clone(),
            prior_promotion_id: Some(prior.id),
            revoked: true,
            created_at: now_iso(),
        };
        self.conn.execute(
            "INSERT INTO promotions
             (id, proposal_id, approved_by, source_hash, prior_promotion_id,
              revoked, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.proposal_id,
                record.approved_by,
                record.source_hash,
                record.prior_promotion_id,
                record.revoked as i64,
                record.created_at,
            ],
        )?;
        Ok(record)
    }

    pub fn latest_promotion(&self, proposal_id: &str) -> Result<Option<PromotionRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, proposal_id, approved_by, source_hash, prior_promotion_id,
                        revoked, created_at
                 FROM promotions WHERE proposal_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [proposal_id],
                models::promotion_from_row,
            )
            .optional()?)
    }

    // ------------------------------------------------------------------
    // Artifact rows (blob bytes live in the artifact store)
    // ------------------------------------------------------------------

    pub fn insert_artifact_row(&self, record: &ArtifactRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO artifacts (id, hash, kind, size, related_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.hash,
                record.kind.as_str(),
                record.size as i64,
                record.related_id,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn artifact(&self, artifact_id: &str) -> Result<ArtifactRecord> {
        self.conn
            .query_row(
                "SELECT id, hash, kind, size, related_id, created_at
                 FROM artifacts WHERE id = ?1",
                [artifact_id],
                models::artifact_from_row,
            )
            .optional()?
            .ok_or_else(|| KilnError::UnknownEntity(format!("artifact '{artifact_id}'")))
    }

    pub fn find_artifact(&self, hash: &str, kind: ArtifactKind) -> Result<Option<ArtifactRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, hash, kind, size, related_id, created_at
                 FROM artifacts WHERE hash = ?1 AND kind = ?2
                 ORDER BY created_at LIMIT 1",
                params![hash, kind.as_str()],
                models::artifact_from_row,
            )
            .optional()?)
    }

    pub fn artifacts_for_related(&self, related_id: &str) -> Result<Vec<ArtifactRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, hash, kind, size, related_id, created_at
             FROM artifacts WHERE related_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map([related_id], models::artifact_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Process-wide registry of per-proposal locks.
///
/// The ledger serialises within a proposal; a caller parallelising over
/// distinct proposals holds one guard per proposal for the span of a
/// build-and-verify cycle.
#[derive(Debug, Default)]
pub struct ProposalLocks {
    held: Mutex<HashSet<String>>,
}

impl ProposalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a proposal, failing fast if it is held.
    pub fn acquire(&self, proposal_id: &str) -> Result<ProposalLockGuard<'_>> {
        let mut held = self.held.lock();
        if !held.insert(proposal_id.to_string()) {
            return Err(KilnError::ConcurrentModification(format!(
                "proposal '{proposal_id}' is locked by another operation"
            )));
        }
        Ok(ProposalLockGuard {
            locks: self,
            proposal_id: proposal_id.to_string(),
        })
    }
}

/// RAII guard releasing a proposal lock on drop.
pub struct ProposalLockGuard<'a> {
    locks: &'a ProposalLocks,
    proposal_id: String,
}

impl Drop for ProposalLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.proposal_id);
    }
}
