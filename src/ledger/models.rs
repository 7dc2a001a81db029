//! Ledger enums, records, and row mapping.

use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

/// Declared side-effect class of a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SideEffectClass {
    ReadOnly,
    FileWrite,
    Network,
    SecretRead,
}

impl SideEffectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "READ_ONLY",
            Self::FileWrite => "FILE_WRITE",
            Self::Network => "NETWORK",
            Self::SecretRead => "SECRET_READ",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "READ_ONLY" => Ok(Self::ReadOnly),
            "FILE_WRITE" => Ok(Self::FileWrite),
            "NETWORK" => Ok(Self::Network),
            "SECRET_READ" => Ok(Self::SecretRead),
            other => Err(KilnError::InvalidInput(format!(
                "unknown side effect class '{other}'"
            ))),
        }
    }
}

/// Lifecycle status of a proposal.
///
/// Monotonic, except that a `BUILT` proposal resets to `PROPOSED` when a
/// retry build opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Proposed,
    Built,
    Verified,
    Trusted,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "PROPOSED",
            Self::Built => "BUILT",
            Self::Verified => "VERIFIED",
            Self::Trusted => "TRUSTED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PROPOSED" => Ok(Self::Proposed),
            "BUILT" => Ok(Self::Built),
            "VERIFIED" => Ok(Self::Verified),
            "TRUSTED" => Ok(Self::Trusted),
            other => Err(KilnError::InvalidInput(format!(
                "unknown proposal status '{other}'"
            ))),
        }
    }

    /// Explicit transition table for the status state machine.
    pub fn can_transition_to(&self, to: ProposalStatus) -> bool {
        matches!(
            (self, to),
            (Self::Proposed, Self::Built)
                | (Self::Built, Self::Proposed)
                | (Self::Built, Self::Verified)
                | (Self::Verified, Self::Trusted)
        )
    }
}

/// Outcome of a build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildOutcome {
    Pending,
    Succeeded,
    Failed,
}

impl BuildOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(KilnError::InvalidInput(format!(
                "unknown build outcome '{other}'"
            ))),
        }
    }
}

/// Typed kind of a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    SkillSpec,
    BuildPacket,
    BuildLog,
    VerificationReport,
    ResearchNote,
    PatchSummary,
    Note,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SkillSpec => "SKILL_SPEC",
            Self::BuildPacket => "BUILD_PACKET",
            Self::BuildLog => "BUILD_LOG",
            Self::VerificationReport => "VERIFICATION_REPORT",
            Self::ResearchNote => "RESEARCH_NOTE",
            Self::PatchSummary => "PATCH_SUMMARY",
            Self::Note => "NOTE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "SKILL_SPEC" => Ok(Self::SkillSpec),
            "BUILD_PACKET" => Ok(Self::BuildPacket),
            "BUILD_LOG" => Ok(Self::BuildLog),
            "VERIFICATION_REPORT" => Ok(Self::VerificationReport),
            "RESEARCH_NOTE" => Ok(Self::ResearchNote),
            "PATCH_SUMMARY" => Ok(Self::PatchSummary),
            "NOTE" => Ok(Self::Note),
            other => Err(KilnError::InvalidInput(format!(
                "unknown artifact kind '{other}'"
            ))),
        }
    }
}

/// Caller-supplied fields for a new proposal.
#[derive(Debug, Clone)]
pub struct ProposalSpec {
    pub name: String,
    pub description: String,
    pub input_schema_json: String,
    pub output_schema_json: String,
    pub side_effect_class: SideEffectClass,
    pub required_secrets: Vec<String>,
}

/// A skill proposal row.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillProposal {
    pub id: String,
    pub name: String,
    pub description: String,
    pub input_schema_json: String,
    pub output_schema_json: String,
    pub side_effect_class: SideEffectClass,
    pub required_secrets_json: String,
    pub status: ProposalStatus,
    pub created_at: String,
}

impl SkillProposal {
    /// Declared secret environment-variable names.
    pub fn required_secrets(&self) -> Result<Vec<String>> {
        Ok(serde_json::from_str(&self.required_secrets_json)?)
    }
}

/// A build attempt row. Attempts form a linear chain per proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildAttempt {
    pub id: String,
    pub proposal_id: String,
    pub attempt_number: i64,
    pub parent_build_id: Option<String>,
    pub packet_artifact_id: Option<String>,
    pub log_artifact_id: Option<String>,
    pub outcome: BuildOutcome,
    pub failure_kind: Option<String>,
    pub summary: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// Per-gate verification booleans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationGates {
    pub ruff_ok: bool,
    pub mypy_ok: bool,
    pub pytest_ok: bool,
    pub policy_ok: bool,
    pub invariants_ok: bool,
}

impl VerificationGates {
    pub fn all_ok(&self) -> bool {
        self.ruff_ok && self.mypy_ok && self.pytest_ok && self.policy_ok && self.invariants_ok
    }
}

/// A verification row, immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRecord {
    pub id: String,
    pub build_id: String,
    pub gates: VerificationGates,
    pub all_ok: bool,
    pub report_artifact_id: Option<String>,
    pub created_at: String,
}

/// A promotion row; demotions are appended with `revoked` set.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionRecord {
    pub id: String,
    pub proposal_id: String,
    pub approved_by: String,
    pub source_hash: String,
    pub prior_promotion_id: Option<String>,
    pub revoked: bool,
    pub created_at: String,
}

/// An artifact row pointing into the content-addressed blob store.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRecord {
    pub id: String,
    pub hash: String,
    pub kind: ArtifactKind,
    pub size: u64,
    pub related_id: Option<String>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_column<T>(result: Result<T>, idx: usize) -> rusqlite::Result<T> {
    result.map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })
}

pub(super) fn proposal_from_row(row: &Row<'_>) -> rusqlite::Result<SkillProposal> {
    Ok(SkillProposal {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        input_schema_json: row.get(3)?,
        output_schema_json: row.get(4)?,
        side_effect_class: parse_column(SideEffectClass::parse(&row.get::<_, String>(5)?), 5)?,
        required_secrets_json: row.get(6)?,
        status: parse_column(ProposalStatus::parse(&row.get::<_, String>(7)?), 7)?,
        created_at: row.get(8)?,
    })
}

pub(super) fn build_from_row(row: &Row<'_>) -> rusqlite::Result<BuildAttempt> {
    Ok(BuildAttempt {
        id: row.get(0)?,
        proposal_id: row.get(1)?,
        attempt_number: row.get(2)?,
        parent_build_id: row.get(3)?,
        packet_artifact_id: row.get(4)?,
        log_artifact_id: row.get(5)?,
        outcome: parse_column(BuildOutcome::parse(&row.get::<_, String>(6)?), 6)?,
        failure_kind: row.get(7)?,
        summary: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}

pub(super) fn verification_from_row(row: &Row<'_>) -> rusqlite::Result<VerificationRecord> {
    Ok(VerificationRecord {
        id: row.get(0)?,
        build_id: row.get(1)?,
        gates: VerificationGates {
            ruff_ok: row.get::<_, i64>(2)? != 0,
            mypy_ok: row.get::<_, i64>(3)? != 0,
            pytest_ok: row.get::<_, i64>(4)? != 0,
            policy_ok: row.get::<_, i64>(5)? != 0,
            invariants_ok: row.get::<_, i64>(6)? != 0,
        },
        all_ok: row.get::<_, i64>(7)? != 0,
        report_artifact_id: row.get(8)?,
        created_at: row.get(9)?,
    })
}

pub(super) fn promotion_from_row(row: &Row<'_>) -> rusqlite::Result<PromotionRecord> {
    Ok(PromotionRecord {
        id: row.get(0)?,
        proposal_id: row.get(1)?,
        approved_by: row.get(2)?,
        source_hash: row.get(3)?,
        prior_promotion_id: row.get(4)?,
        revoked: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

pub(super) fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<ArtifactRecord> {
    Ok(ArtifactRecord {
        id: row.get(0)?,
        hash: row.get(1)?,
        kind: parse_column(ArtifactKind::parse(&row.get::<_, String>(2)?), 2)?,
        size: row.get::<_, i64>(3)? as u64,
        related_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// Ids and timestamps
// ---------------------------------------------------------------------------

/// Short random id, 12 hex chars.
pub(crate) fn new_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

/// UTC timestamp as `YYYY-MM-DDTHH:MM:SSZ`.
pub(crate) fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_strings() {
        for class in [
            SideEffectClass::ReadOnly,
            SideEffectClass::FileWrite,
            SideEffectClass::Network,
            SideEffectClass::SecretRead,
        ] {
            assert_eq!(SideEffectClass::parse(class.as_str()).unwrap(), class);
        }
        for status in [
            ProposalStatus::Proposed,
            ProposalStatus::Built,
            ProposalStatus::Verified,
            ProposalStatus::Trusted,
        ] {
            assert_eq!(ProposalStatus::parse(status.as_str()).unwrap(), status);
        }
        for kind in [
            ArtifactKind::SkillSpec,
            ArtifactKind::BuildPacket,
            ArtifactKind::BuildLog,
            ArtifactKind::VerificationReport,
            ArtifactKind::ResearchNote,
            ArtifactKind::PatchSummary,
            ArtifactKind::Note,
        ] {
            assert_eq!(ArtifactKind::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_enum_values_rejected() {
        assert!(SideEffectClass::parse("MONEY").is_err());
        assert!(ProposalStatus::parse("REJECTED").is_err());
        assert!(ArtifactKind::parse("BLOB").is_err());
    }

    #[test]
    fn transition_table_matches_state_machine() {
        use ProposalStatus::*;
        assert!(Proposed.can_transition_to(Built));
        assert!(Built.can_transition_to(Proposed));
        assert!(Built.can_transition_to(Verified));
        assert!(Verified.can_transition_to(Trusted));

        assert!(!Proposed.can_transition_to(Verified));
        assert!(!Proposed.can_transition_to(Trusted));
        assert!(!Verified.can_transition_to(Proposed));
        assert!(!Trusted.can_transition_to(Proposed));
        assert!(!Trusted.can_transition_to(Verified));
    }

    #[test]
    fn gates_all_ok_is_conjunction() {
        let mut gates = VerificationGates {
            ruff_ok: true,
            mypy_ok: true,
            pytest_ok: true,
            policy_ok: true,
            invariants_ok: true,
        };
        assert!(gates.all_ok());
        gates.mypy_ok = false;
        assert!(!gates.all_ok());
    }

    #[test]
    fn new_ids_are_short_and_unique() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn side_effect_serde_uses_screaming_snake() {
        let json = serde_json::to_string(&SideEffectClass::SecretRead).unwrap();
        assert_eq!(json, "\"SECRET_READ\"");
    }
}
