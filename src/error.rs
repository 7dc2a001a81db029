//! Error handling for kiln.
//!
//! One crate-wide error enum; every module boundary returns
//! `Result<T, KilnError>`. Classifiable build/verify failures are recorded
//! on the ledger instead of surfacing here; these variants cover local
//! and infrastructural failures.

use std::io;

use thiserror::Error;

/// Main error type for kiln operations.
#[derive(Error, Debug)]
pub enum KilnError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Gate violation: {0}")]
    GateViolation(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Tool failure: {0}")]
    ToolFailure(String),

    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Trust error: {0}")]
    TrustError(String),
}

/// Result type alias using KilnError.
pub type Result<T> = std::result::Result<T, KilnError>;
