//! Promotion: the transition from `VERIFIED` to `TRUSTED`.
//!
//! The skill source is hashed, the registry entry written atomically,
//! and the promotion recorded on the ledger. A promotion is not
//! observable to the runtime loader until the registry rename lands.

use std::path::Path;

use tracing::info;

use crate::artifacts::hash_file;
use crate::error::Result;
use crate::forge::paths::PathConvention;
use crate::ledger::{Ledger, PromotionRecord};
use crate::registry::{self, RegistryEntry};

/// Promote a verified skill to `TRUSTED`.
///
/// `approved_by` is the caller-supplied approver identity, stored
/// verbatim. Requires status `VERIFIED` with a passing verification;
/// the ledger enforces both.
pub fn promote_skill(
    ledger: &Ledger,
    project_root: &Path,
    registry_path: &Path,
    paths: &PathConvention,
    proposal_id: &str,
    approved_by: &str,
) -> Result<PromotionRecord> {
    let proposal = ledger.proposal(proposal_id)?;

    let skill_rel = paths.skill_rel(&proposal.name);
    let source_hash = hash_file(&project_root.join(&skill_rel))?;

    let promotion = ledger.record_promotion(proposal_id, approved_by, &source_hash)?;

    registry::upsert_entry(
        registry_path,
        RegistryEntry {
            name: proposal.name.clone(),
            module: paths.module_ref(&proposal.name),
            side_effect_class: proposal.side_effect_class,
            hash: Some(source_hash),
            required_secrets: proposal.required_secrets()?,
        },
    )?;

    info!(skill = %proposal.name, approved_by, "promoted to TRUSTED");
    Ok(promotion)
}

/// Demote a trusted skill: append a revoked promotion record and drop
/// the registry entry so the runtime refuses to load it.
pub fn demote_skill(
    ledger: &Ledger,
    registry_path: &Path,
    proposal_id: &str,
    approved_by: &str,
) -> Result<PromotionRecord> {
    let proposal = ledger.proposal(proposal_id)?;
    let record = ledger.record_demotion(proposal_id, approved_by)?;
    registry::remove_entry(registry_path, &proposal.name)?;
    info!(skill = %proposal.name, approved_by, "demoted");
    Ok(record)
}
