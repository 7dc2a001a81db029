//! Trusted-skill registry and load-time trust verification.
//!
//! The registry is a human-readable YAML view of `TRUSTED` skills,
//! derived from the ledger at promotion and rewritten atomically. The
//! ledger stays the arbiter on disagreement, but runtime loading
//! consults the registry: before anything is imported or executed, the
//! skill source is re-hashed and compared against the promoted hash.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::artifacts::hash_file;
use crate::error::{KilnError, Result};
use crate::ledger::SideEffectClass;
use crate::utils::fs as kfs;

/// One registry entry per trusted skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    /// Dotted module reference, e.g. `skills.write_note.WriteNoteSkill`.
    pub module: String,
    pub side_effect_class: SideEffectClass,
    /// SHA-256 of the skill source at promotion. Absent only in legacy
    /// registries written before hashes were recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default)]
    pub required_secrets: Vec<String>,
}

impl RegistryEntry {
    /// Repo-relative source path derived from the module reference.
    pub fn source_rel(&self) -> Result<PathBuf> {
        let mut parts: Vec<&str> = self.module.split('.').collect();
        if parts.len() < 2 {
            return Err(KilnError::InvalidInput(format!(
                "malformed module reference '{}'",
                self.module
            )));
        }
        parts.pop(); // class name
        Ok(PathBuf::from(format!("{}.py", parts.join("/"))))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDoc {
    #[serde(default)]
    skills: Vec<RegistryEntry>,
}

/// Load all registry entries. A missing file reads as empty.
pub fn load_registry(path: &Path) -> Result<Vec<RegistryEntry>> {
    let Some(raw) = kfs::read_optional(path)? else {
        return Ok(Vec::new());
    };
    let doc: RegistryDoc = serde_yaml::from_str(&raw)?;
    Ok(doc.skills)
}

/// Write the full registry atomically (write-temp + rename), so readers
/// observe either the old or the new version.
pub fn save_registry(path: &Path, entries: &[RegistryEntry]) -> Result<()> {
    let doc = RegistryDoc {
        skills: entries.to_vec(),
    };
    let raw = serde_yaml::to_string(&doc)?;
    kfs::atomic_write(path, raw.as_bytes())
}

/// Insert or replace the entry for a skill name.
pub fn upsert_entry(path: &Path, entry: RegistryEntry) -> Result<()> {
    let mut entries = load_registry(path)?;
    entries.retain(|e| e.name != entry.name);
    entries.push(entry);
    save_registry(path, &entries)
}

/// Remove the entry for a skill name, if present.
pub fn remove_entry(path: &Path, name: &str) -> Result<()> {
    let mut entries = load_registry(path)?;
    entries.retain(|e| e.name != name);
    save_registry(path, &entries)
}

/// Find an entry by skill name.
pub fn find_entry(path: &Path, name: &str) -> Result<Option<RegistryEntry>> {
    Ok(load_registry(path)?.into_iter().find(|e| e.name == name))
}

/// Re-hash the skill source and compare against the promoted hash.
///
/// Raises `TrustError` before anything is imported or executed. A legacy
/// entry without a hash emits a warning and skips verification.
pub fn verify_trust(project_root: &Path, entry: &RegistryEntry) -> Result<()> {
    let Some(expected) = entry.hash.as_deref() else {
        warn!(
            skill = %entry.name,
            "registry entry has no hash; skipping trust verification (re-promote to fix)"
        );
        return Ok(());
    };

    let source = project_root.join(entry.source_rel()?);
    if !source.exists() {
        return Err(KilnError::TrustError(format!(
            "skill '{}' source missing: {}",
            entry.name,
            source.display()
        )));
    }
    let actual = hash_file(&source)?;
    if actual != expected {
        return Err(KilnError::TrustError(format!(
            "skill '{}' failed trust check: expected hash {}…, got {}…",
            entry.name,
            &expected[..12.min(expected.len())],
            &actual[..12]
        )));
    }
    Ok(())
}
