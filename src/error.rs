//! Error types for the ranking core.
//!
//! Per-runner and per-race problems never surface here; they resolve to
//! `None` features or a skipped race. Only store, schema and artifact
//! failures escalate.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RankError {
    /// A column this core reads is absent from the store.
    #[error("schema mismatch: table `{table}` has no column `{column}`")]
    SchemaMismatch { table: String, column: String },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("feature column `{0}` holds non-numeric values")]
    NonNumericFeature(String),

    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    #[error("model artifact not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RankError>;
