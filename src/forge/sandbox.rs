//! Sandbox workspace preparation.
//!
//! A build runs against an isolated copy of the canonical working tree:
//! version-control metadata, virtual environments, caches, databases,
//! sockets, and anything matching the secret patterns never enter the
//! copy. A fresh git repository with a single baseline commit makes
//! later diffs unambiguous.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{KilnError, Result};
use crate::utils::{fs as kfs, git};

/// Directories never copied into a sandbox.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".venv",
    "venv",
    "__pycache__",
    ".mypy_cache",
    ".ruff_cache",
    ".pytest_cache",
    "node_modules",
    "target",
    ".kiln",
];

/// Filename patterns excluded from sandbox copies.
pub const SECRET_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "credentials.*",
    "*.db",
    "*.db-wal",
    "*.db-journal",
    "*.sock",
];

/// An isolated build workspace.
#[derive(Debug, Clone)]
pub struct Sandbox {
    /// Workspace directory, `<scratch>/<build_id>`.
    pub workspace: PathBuf,
    /// The copied repository, `<workspace>/repo`.
    pub repo: PathBuf,
}

/// Match a filename against one exclusion pattern.
///
/// Supports the three shapes the pattern set uses: exact names,
/// `prefix.*`, and `*.suffix`.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        return name.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return name == prefix || name.starts_with(&format!("{prefix}."));
    }
    name == pattern
}

/// Whether a filename matches any secret pattern.
pub fn is_secret_file(name: &str) -> bool {
    SECRET_PATTERNS.iter().any(|pat| matches_pattern(name, pat))
}

#[cfg(unix)]
fn is_special_file(file_type: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_socket()
        || file_type.is_fifo()
        || file_type.is_block_device()
        || file_type.is_char_device()
}

#[cfg(not(unix))]
fn is_special_file(_file_type: &std::fs::FileType) -> bool {
    false
}

/// Create a sandbox for a build: copy the tree, lay a git baseline.
pub fn create_sandbox(project_root: &Path, scratch_root: &Path, build_id: &str) -> Result<Sandbox> {
    let workspace = scratch_root.join(build_id);
    let repo = workspace.join("repo");
    kfs::ensure_dir(&repo)?;

    // A scratch root configured inside the project must not be copied
    // into its own workspace.
    let skip_dir = scratch_root.canonicalize().ok();
    copy_tree_impl(project_root, &repo, skip_dir.as_deref())?;
    git::init_baseline(&repo)?;

    debug!(repo = %repo.display(), "sandbox prepared");
    Ok(Sandbox { workspace, repo })
}

/// Copy the working tree into the sandbox, applying exclusion rules.
///
/// Traversal is deterministic (sorted by file name). Symlinks are
/// resolved and refused when their target lies outside the source root.
/// File modes are preserved minus world-write.
pub fn copy_tree(source_root: &Path, dest_root: &Path) -> Result<()> {
    copy_tree_impl(source_root, dest_root, None)
}

fn copy_tree_impl(source_root: &Path, dest_root: &Path, skip_dir: Option<&Path>) -> Result<()> {
    let canonical_source = source_root.canonicalize().map_err(|err| {
        KilnError::InvalidInput(format!("source root {}: {err}", source_root.display()))
    })?;

    let walker = WalkDir::new(source_root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            let name = entry.file_name().to_string_lossy();
            if entry.depth() == 0 {
                return true;
            }
            if entry.file_type().is_dir() {
                if EXCLUDED_DIRS.contains(&name.as_ref()) {
                    return false;
                }
                if let Some(skip) = skip_dir {
                    if entry
                        .path()
                        .canonicalize()
                        .map(|p| p == skip)
                        .unwrap_or(false)
                    {
                        return false;
                    }
                }
            }
            !is_secret_file(&name)
        });

    for entry in walker {
        let entry = entry.map_err(|err| KilnError::Io(err.into()))?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source_root)
            .expect("walkdir yields paths under its root");
        let dest = dest_root.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            kfs::ensure_dir(&dest)?;
            continue;
        }
        if is_special_file(&std::fs::symlink_metadata(entry.path())?.file_type()) {
            continue;
        }
        if file_type.is_symlink() {
            let target = match entry.path().canonicalize() {
                Ok(target) => target,
                Err(_) => continue, // dangling link
            };
            if !target.starts_with(&canonical_source) {
                warn!(link = %rel.display(), "refusing symlink escaping the source root");
                continue;
            }
            if !target.is_file() {
                continue;
            }
            copy_file(&target, &dest)?;
            continue;
        }
        if file_type.is_file() {
            copy_file(entry.path(), &dest)?;
        }
    }

    Ok(())
}

fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        kfs::ensure_dir(parent)?;
    }
    std::fs::copy(source, dest)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(source)?.permissions().mode();
        std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode & !0o002))?;
    }

    Ok(())
}

/// Remove a sandbox workspace entirely.
pub fn remove_sandbox(sandbox: &Sandbox) -> Result<()> {
    if sandbox.workspace.exists() {
        std::fs::remove_dir_all(&sandbox.workspace)?;
    }
    Ok(())
}

/// Bound the number of retained (failed) workspaces under the scratch
/// root, deleting the oldest beyond `retain_max`.
pub fn prune_workspaces(scratch_root: &Path, retain_max: usize) -> Result<()> {
    if !scratch_root.exists() {
        return Ok(());
    }
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(scratch_root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let modified = entry
                .metadata()?
                .modified()
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((modified, entry.path()));
        }
    }
    if entries.len() <= retain_max {
        return Ok(());
    }
    entries.sort_by_key(|(modified, _)| *modified);
    let excess = entries.len() - retain_max;
    for (_, path) in entries.into_iter().take(excess) {
        std::fs::remove_dir_all(&path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_tree(root: &Path) {
        std::fs::create_dir_all(root.join("skills")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("__pycache__")).unwrap();
        std::fs::write(root.join("skills/base.py"), "class BaseSkill: pass\n").unwrap();
        std::fs::write(root.join("README.md"), "readme\n").unwrap();
        std::fs::write(root.join(".env"), "SECRET=1\n").unwrap();
        std::fs::write(root.join("server.key"), "key material\n").unwrap();
        std::fs::write(root.join("credentials.json"), "{}\n").unwrap();
        std::fs::write(root.join("ledger.db"), "sqlite\n").unwrap();
        std::fs::write(root.join(".git/config"), "[core]\n").unwrap();
        std::fs::write(root.join("__pycache__/x.pyc"), "bytecode").unwrap();
    }

    // =========================================================================
    // Pattern matching
    // =========================================================================

    #[test]
    fn secret_patterns_match_expected_names() {
        for name in [
            ".env",
            ".env.local",
            "server.pem",
            "id_rsa.key",
            "credentials.json",
            "ledger.db",
            "ledger.db-wal",
            "app.sock",
        ] {
            assert!(is_secret_file(name), "{name} should be excluded");
        }
    }

    #[test]
    fn ordinary_names_are_not_secret() {
        for name in ["main.py", "environment.md", "keys_doc.txt", "db_notes.md"] {
            assert!(!is_secret_file(name), "{name} should be copied");
        }
    }

    // =========================================================================
    // copy_tree
    // =========================================================================

    #[test]
    fn copy_excludes_vcs_caches_and_secrets() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        make_tree(source.path());

        copy_tree(source.path(), dest.path()).unwrap();

        assert!(dest.path().join("skills/base.py").exists());
        assert!(dest.path().join("README.md").exists());
        assert!(!dest.path().join(".git").exists());
        assert!(!dest.path().join("__pycache__").exists());
        assert!(!dest.path().join(".env").exists());
        assert!(!dest.path().join("server.key").exists());
        assert!(!dest.path().join("credentials.json").exists());
        assert!(!dest.path().join("ledger.db").exists());
    }

    #[cfg(unix)]
    #[test]
    fn copy_refuses_symlink_outside_source_root() {
        let source = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "outside").unwrap();
        std::fs::write(source.path().join("ok.txt"), "inside").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            source.path().join("link.txt"),
        )
        .unwrap();

        copy_tree(source.path(), dest.path()).unwrap();

        assert!(dest.path().join("ok.txt").exists());
        assert!(!dest.path().join("link.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn copy_follows_symlink_inside_source_root() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        std::fs::write(source.path().join("real.txt"), "content").unwrap();
        std::os::unix::fs::symlink(source.path().join("real.txt"), source.path().join("alias.txt"))
            .unwrap();

        copy_tree(source.path(), dest.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.path().join("alias.txt")).unwrap(),
            "content"
        );
        // The copy is a regular file, not a link.
        assert!(!dest
            .path()
            .join("alias.txt")
            .symlink_metadata()
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[cfg(unix)]
    #[test]
    fn copy_strips_world_write() {
        use std::os::unix::fs::PermissionsExt;
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let file = source.path().join("w.txt");
        std::fs::write(&file, "w").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o666)).unwrap();

        copy_tree(source.path(), dest.path()).unwrap();

        let mode = std::fs::metadata(dest.path().join("w.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o002, 0);
    }

    // =========================================================================
    // Sandbox lifecycle
    // =========================================================================

    #[test]
    fn create_sandbox_lays_git_baseline() {
        if !git::git_available() {
            return;
        }
        let source = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        make_tree(source.path());

        let sandbox = create_sandbox(source.path(), scratch.path(), "b123").unwrap();
        assert!(sandbox.repo.join(".git").exists());
        assert!(git::changed_tracked(&sandbox.repo).unwrap().is_empty());
        assert!(git::changed_untracked(&sandbox.repo).unwrap().is_empty());

        remove_sandbox(&sandbox).unwrap();
        assert!(!sandbox.workspace.exists());
    }

    #[test]
    fn prune_workspaces_keeps_newest() {
        let scratch = TempDir::new().unwrap();
        for (idx, name) in ["a", "b", "c"].iter().enumerate() {
            let dir = scratch.path().join(name);
            std::fs::create_dir(&dir).unwrap();
            let stamp = std::time::SystemTime::UNIX_EPOCH
                + std::time::Duration::from_secs(1_000 + idx as u64);
            let file = std::fs::File::open(&dir).unwrap();
            let _ = file.set_modified(stamp);
        }

        prune_workspaces(scratch.path(), 1).unwrap();

        let remaining: Vec<_> = std::fs::read_dir(scratch.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(remaining, vec!["c"]);
    }
}
