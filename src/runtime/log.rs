//! Append-only JSONL execution log.
//!
//! One line per execution record. The writer appends and fsyncs; the
//! reader tolerates malformed lines and never writes.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::runtime::ExecutionRecord;
use crate::utils::fs as kfs;

#[derive(Debug, Clone)]
pub struct ExecutionLog {
    path: PathBuf,
}

impl ExecutionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize and append one record as a single JSONL line.
    pub fn append(&self, record: &ExecutionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            kfs::ensure_dir(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Read up to `n` most recent records (newest last), optionally
    /// filtered to failures or a single skill. Malformed lines are
    /// skipped.
    pub fn read(
        &self,
        n: usize,
        only_failures: bool,
        skill_name: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>> {
        let Some(raw) = kfs::read_optional(&self.path)? else {
            return Ok(Vec::new());
        };

        let mut records: Vec<ExecutionRecord> = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<ExecutionRecord>(line) else {
                continue;
            };
            if only_failures && record.success {
                continue;
            }
            if let Some(name) = skill_name {
                if record.skill_name != name {
                    continue;
                }
            }
            records.push(record);
        }

        let keep = records.len().saturating_sub(n);
        Ok(records.split_off(keep))
    }
}
