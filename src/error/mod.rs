//! Error kinds callers need to branch on. Everything else travels as
//! `anyhow::Error` with context attached.

use std::path::PathBuf;

/// Failure of a single collection item. Recorded in the run report; the
/// run carries on with the remaining items.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error("{}: no usable capture timestamp", path.display())]
    MissingMetadata { path: PathBuf },

    #[error("{}: metadata rewrite failed: {reason}", path.display())]
    Transform { path: PathBuf, reason: String },

    #[error("{}: writing published variants failed: {reason}", path.display())]
    Publish { path: PathBuf, reason: String },

    #[error("{}: ordering is ambiguous without filesystem creation time", path.display())]
    AmbiguousOrder { path: PathBuf },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ItemError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ItemError::MissingMetadata { path }
            | ItemError::Transform { path, .. }
            | ItemError::Publish { path, .. }
            | ItemError::AmbiguousOrder { path }
            | ItemError::Io { path, .. } => path,
        }
    }
}

/// Failures that end a whole processing or deployment run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("partial batch records from an unfinished run exist ({}); pass --resume or --restart", records.len())]
    PartialBatchConflict { records: Vec<PathBuf> },

    #[error("checkpoint {} is unusable: {reason}", path.display())]
    InvalidCheckpoint { path: PathBuf, reason: String },

    #[error("metadata document upload failed: {0}")]
    MetadataUpload(String),
}

/// Errors surfaced by an [`crate::remote::ObjectStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}
