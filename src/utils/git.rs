//! Git subprocess helpers.
//!
//! The sandbox baseline and diff gate work against a real git working
//! tree, so these helpers shell out rather than link a git library.

use std::path::Path;
use std::process::Command;

use crate::error::{KilnError, Result};

/// Run a git subcommand in `cwd`, capturing stdout.
///
/// Returns `ToolFailure` on a non-zero exit, with stderr in the message.
pub fn run_git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|err| KilnError::ToolFailure(format!("git {}: {err}", args.join(" "))))?;

    if !output.status.success() {
        return Err(KilnError::ToolFailure(format!(
            "git {} exited {}: {}",
            args.join(" "),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Initialise a fresh repository with zero remotes and a single baseline
/// commit covering the whole tree.
pub fn init_baseline(root: &Path) -> Result<()> {
    run_git(root, &["init", "--quiet"])?;
    run_git(root, &["config", "user.email", "kiln@local"])?;
    run_git(root, &["config", "user.name", "kiln"])?;
    run_git(root, &["add", "-A"])?;
    run_git(
        root,
        &["commit", "--quiet", "--allow-empty", "-m", "sandbox baseline"],
    )?;
    Ok(())
}

/// Tracked files changed since the baseline commit.
pub fn changed_tracked(root: &Path) -> Result<Vec<String>> {
    let out = run_git(root, &["diff", "--name-only", "HEAD"])?;
    Ok(split_lines(&out))
}

/// New files not yet tracked (respecting .gitignore).
pub fn changed_untracked(root: &Path) -> Result<Vec<String>> {
    let out = run_git(root, &["ls-files", "--others", "--exclude-standard"])?;
    Ok(split_lines(&out))
}

/// Whether the `git` binary is available at all.
pub fn git_available() -> bool {
    which::which("git").is_ok()
}

fn split_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn skip_without_git() -> bool {
        !git_available()
    }

    #[test]
    fn init_baseline_creates_repo_with_commit() {
        if skip_without_git() {
            return;
        }
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "a").unwrap();

        init_baseline(temp.path()).unwrap();
        assert!(temp.path().join(".git").exists());
        assert!(changed_tracked(temp.path()).unwrap().is_empty());
        assert!(changed_untracked(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn changed_tracked_sees_modified_file() {
        if skip_without_git() {
            return;
        }
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "a").unwrap();
        init_baseline(temp.path()).unwrap();

        std::fs::write(temp.path().join("a.txt"), "changed").unwrap();
        assert_eq!(changed_tracked(temp.path()).unwrap(), vec!["a.txt"]);
    }

    #[test]
    fn changed_untracked_sees_new_file() {
        if skip_without_git() {
            return;
        }
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "a").unwrap();
        init_baseline(temp.path()).unwrap();

        std::fs::write(temp.path().join("new.txt"), "n").unwrap();
        assert_eq!(changed_untracked(temp.path()).unwrap(), vec!["new.txt"]);
    }

    #[test]
    fn run_git_rejects_bad_subcommand() {
        if skip_without_git() {
            return;
        }
        let temp = TempDir::new().unwrap();
        assert!(run_git(temp.path(), &["definitely-not-a-subcommand"]).is_err());
    }
}
