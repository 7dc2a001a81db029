//! Filesystem utilities.
//!
//! Helper functions for file operations.

use std::path::Path;

use crate::error::Result;

/// Ensure a directory exists, creating it if necessary.
pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Read a file to string, returning None if it doesn't exist.
pub fn read_optional(path: impl AsRef<Path>) -> Result<Option<String>> {
    let path = path.as_ref();
    if path.exists() {
        Ok(Some(std::fs::read_to_string(path)?))
    } else {
        Ok(None)
    }
}

/// Write bytes atomically: write to a temporary sibling, then rename.
///
/// The rename is atomic on POSIX filesystems, so readers observe either
/// the old content or the new content, never a partial write.
pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp.{}", std::process::id()));
    std::fs::write(&tmp, bytes)?;
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = std::fs::remove_file(&tmp);
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // =========================================================================
    // ensure_dir tests
    // =========================================================================

    #[test]
    fn ensure_dir_creates_nested_directories() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("a").join("b").join("c");

        assert!(!dir.exists());
        ensure_dir(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn ensure_dir_idempotent() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("idem");

        ensure_dir(&dir).unwrap();
        ensure_dir(&dir).unwrap();
        assert!(dir.exists());
    }

    // =========================================================================
    // read_optional tests
    // =========================================================================

    #[test]
    fn read_optional_existing_file() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("test.txt");
        std::fs::write(&file, "hello world").unwrap();

        assert_eq!(read_optional(&file).unwrap().as_deref(), Some("hello world"));
    }

    #[test]
    fn read_optional_nonexistent_file() {
        let temp = TempDir::new().unwrap();
        assert!(read_optional(temp.path().join("nope.txt")).unwrap().is_none());
    }

    // =========================================================================
    // atomic_write tests
    // =========================================================================

    #[test]
    fn atomic_write_creates_file_and_parents() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("sub").join("out.txt");

        atomic_write(&file, b"content").unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"content");
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("out.txt");

        atomic_write(&file, b"first").unwrap();
        atomic_write(&file, b"second").unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"second");
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("out.txt");

        atomic_write(&file, b"data").unwrap();
        let entries: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
