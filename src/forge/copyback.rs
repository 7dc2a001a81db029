//! Safe copy-back of allowlisted files from a sandbox to the canonical
//! repository.
//!
//! Every destination write is validated first: no symlinked sources, no
//! `..` components, no absolute paths, no NUL bytes, and the resolved
//! destination must stay under the canonical project root. Writes are
//! atomic per file.

use std::path::{Component, Path};

use tracing::info;

use crate::error::{KilnError, Result};
use crate::utils::fs as kfs;

/// Copy each allowlisted file that exists in the sandbox back into the
/// canonical repository. Returns `"path (create|overwrite)"` log lines.
pub fn safe_copy_back(
    sandbox_repo: &Path,
    project_root: &Path,
    allowed_changes: &[String],
) -> Result<Vec<String>> {
    let canonical_root = project_root.canonicalize().map_err(|err| {
        KilnError::InvalidInput(format!("project root {}: {err}", project_root.display()))
    })?;
    let mut copied = Vec::new();

    for rel_path in allowed_changes {
        validate_rel_path(rel_path)?;

        let src = sandbox_repo.join(rel_path);
        if !src.exists() {
            continue;
        }

        // The worker could re-point a symlink anywhere; lstat, not stat.
        let src_meta = std::fs::symlink_metadata(&src)?;
        if src_meta.file_type().is_symlink() {
            return Err(KilnError::GateViolation(format!(
                "refusing to copy symlink: {rel_path}"
            )));
        }

        let dst = project_root.join(rel_path);
        if let Some(parent) = dst.parent() {
            kfs::ensure_dir(parent)?;
            let canonical_parent = parent.canonicalize()?;
            if !canonical_parent.starts_with(&canonical_root) {
                return Err(KilnError::GateViolation(format!(
                    "path escapes project root: {rel_path}"
                )));
            }
        }

        let overwritten = dst.exists();
        let bytes = std::fs::read(&src)?;
        kfs::atomic_write(&dst, &bytes)?;
        let action = if overwritten { "overwrite" } else { "create" };
        info!(path = %rel_path, action, "copied back");
        copied.push(format!("{rel_path} ({action})"));
    }

    Ok(copied)
}

fn validate_rel_path(rel_path: &str) -> Result<()> {
    if rel_path.contains('\0') {
        return Err(KilnError::GateViolation(format!(
            "path contains NUL byte: {rel_path:?}"
        )));
    }
    let path = Path::new(rel_path);
    if path.is_absolute() {
        return Err(KilnError::GateViolation(format!(
            "absolute path not allowed: {rel_path}"
        )));
    }
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(KilnError::GateViolation(format!(
                    "path traversal not allowed: {rel_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(KilnError::GateViolation(format!(
                    "absolute path not allowed: {rel_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}
