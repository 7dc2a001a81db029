//! Ledger schema migrations.
//!
//! Numbered SQL files applied in single steps. SQLite cannot widen a
//! CHECK constraint in place, so widening migrations recreate the table,
//! copy rows, and swap. The applied version lives in a marker row of the
//! `schema_version` table.

use rusqlite::Connection;

use crate::error::{KilnError, Result};

const MIGRATIONS: [&str; 3] = [
    include_str!("../../migrations/001_initial_schema.sql"),
    include_str!("../../migrations/002_widen_side_effect_classes.sql"),
    include_str!("../../migrations/003_widen_artifact_kinds.sql"),
];

pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

/// Run all pending migrations. Idempotent.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    let current = current_version(conn)?;

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let target = (idx + 1) as u32;
        if current >= target {
            continue;
        }
        conn.execute_batch(&format!("BEGIN;\n{sql}\nCOMMIT;"))
            .map_err(|err| {
                KilnError::StoreUnavailable(format!("migration {target} failed: {err}"))
            })?;
    }

    Ok(SCHEMA_VERSION)
}

/// Applied schema version; 0 before the first migration.
pub fn current_version(conn: &Connection) -> Result<u32> {
    let has_marker: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    if has_marker == 0 {
        return Ok(0);
    }
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })?;
    Ok(version.unwrap_or(0) as u32)
}
