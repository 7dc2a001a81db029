//! Content-addressed artifact store.
//!
//! Blob bytes live on disk under a sharded directory keyed by the first
//! two hex nibbles of the SHA-256 digest; the ledger records one artifact
//! row per (hash, kind). Identical bytes share a single blob. Blobs are
//! never deleted or mutated.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{KilnError, Result};
use crate::ledger::{ArtifactKind, ArtifactRecord, Ledger};

/// SHA-256 hex digest of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of a file's bytes.
pub fn hash_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .map_err(|err| KilnError::StoreUnavailable(format!("read {}: {err}", path.display())))?;
    Ok(hash_bytes(&bytes))
}

/// Content-addressed blob store rooted at a blob directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open the store, creating the blob root if necessary.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|err| {
            KilnError::StoreUnavailable(format!("create blob root {}: {err}", root.display()))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store bytes and record an artifact row.
    ///
    /// Idempotent per (hash, kind): putting identical bytes with the same
    /// kind returns the existing artifact. The same bytes under a second
    /// kind get a new row pointing at the same blob.
    pub fn put(
        &self,
        ledger: &Ledger,
        bytes: &[u8],
        kind: ArtifactKind,
        related_id: Option<&str>,
    ) -> Result<ArtifactRecord> {
        let hash = hash_bytes(bytes);

        if let Some(existing) = ledger.find_artifact(&hash, kind)? {
            return Ok(existing);
        }

        let path = self.blob_path(&hash)?;
        if !path.exists() {
            // Racing writers of identical content are safe: both temp
            // files hold the same bytes and rename is atomic.
            crate::utils::fs::atomic_write(&path, bytes).map_err(|err| {
                KilnError::StoreUnavailable(format!("write blob {}: {err}", path.display()))
            })?;
        }

        let record = ArtifactRecord {
            id: crate::ledger::models::new_id(),
            hash,
            kind,
            size: bytes.len() as u64,
            related_id: related_id.map(String::from),
            created_at: crate::ledger::models::now_iso(),
        };
        ledger.insert_artifact_row(&record)?;
        debug!(id = %record.id, kind = kind.as_str(), size = record.size, "artifact stored");
        Ok(record)
    }

    /// Convenience for text artifacts.
    pub fn put_text(
        &self,
        ledger: &Ledger,
        content: &str,
        kind: ArtifactKind,
        related_id: Option<&str>,
    ) -> Result<ArtifactRecord> {
        self.put(ledger, content.as_bytes(), kind, related_id)
    }

    /// Fetch the bytes of an artifact by id.
    pub fn get(&self, ledger: &Ledger, artifact_id: &str) -> Result<Vec<u8>> {
        let record = ledger.artifact(artifact_id)?;
        let path = self.blob_path(&record.hash)?;
        std::fs::read(&path).map_err(|err| {
            KilnError::StoreUnavailable(format!("read blob {}: {err}", path.display()))
        })
    }

    /// Fetch an artifact's bytes as UTF-8 text.
    pub fn get_text(&self, ledger: &Ledger, artifact_id: &str) -> Result<String> {
        let bytes = self.get(ledger, artifact_id)?;
        String::from_utf8(bytes)
            .map_err(|err| KilnError::InvalidInput(format!("artifact is not UTF-8: {err}")))
    }

    /// Whether a blob with the given hash exists on disk.
    pub fn has_blob(&self, hash: &str) -> bool {
        self.blob_path(hash).map(|p| p.exists()).unwrap_or(false)
    }

    /// Sharded path for a hash: `<root>/<first two nibbles>/<hash>`.
    ///
    /// The hash is validated strictly so a corrupt ledger row can never
    /// steer reads or writes outside the blob root.
    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KilnError::InvalidInput(format!(
                "malformed blob hash '{}'",
                hash.chars().take(20).collect::<String>()
            )));
        }
        Ok(self.root.join(&hash[..2]).join(hash))
    }
}
