use serde_json::{json, Value};

use crate::coordinator::{CoordinatorError, FailedRewrite};
use crate::graph::GraphError;
use crate::semantic::{EmbeddingError, IndexError};
use crate::vault::VaultError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailure(#[from] EmbeddingError),

    #[error("rebuild interrupted, previous index generation kept")]
    RebuildInterrupted,

    #[error("a rebuild is already running")]
    RebuildInProgress,

    #[error("note moved to {moved_to}, but {} referencing notes could not be rewritten", failed.len())]
    ReferenceRewritePartial {
        moved_to: String,
        updated: Vec<String>,
        failed: Vec<FailedRewrite>,
    },

    #[error("a note already exists at the destination: {existing}")]
    RenameConflict { existing: String },

    #[error("section '{section}' not found in {path}")]
    SectionNotFound { path: String, section: String },

    #[error("note not found: {0}")]
    NotFound(String),

    #[error("note already exists: {0}")]
    AlreadyExists(String),

    #[error("path is outside the vault: {0}")]
    OutsideVault(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("graph engine error: {0}")]
    Graph(#[from] GraphError),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::IndexUnavailable(_) => "INDEX_UNAVAILABLE",
            AppError::EmbeddingFailure(_) => "EMBEDDING_FAILURE",
            AppError::RebuildInterrupted => "REBUILD_INTERRUPTED",
            AppError::RebuildInProgress => "REBUILD_IN_PROGRESS",
            AppError::ReferenceRewritePartial { .. } => "REFERENCE_REWRITE_PARTIAL",
            AppError::RenameConflict { .. } => "RENAME_CONFLICT",
            AppError::SectionNotFound { .. } => "SECTION_NOT_FOUND",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::AlreadyExists(_) => "ALREADY_EXISTS",
            AppError::OutsideVault(_) => "OUTSIDE_VAULT",
            AppError::InvalidArgument(_) => "INVALID_ARGUMENT",
            AppError::Graph(GraphError::FlagLike { .. }) => "INVALID_ARGUMENT",
            AppError::Graph(_) => "GRAPH_ENGINE_ERROR",
            AppError::Io { .. } => "IO_ERROR",
            AppError::Other(_) => "INTERNAL",
        }
    }

    /// Structured follow-up detail (affected paths), if any.
    pub fn detail(&self) -> Value {
        match self {
            AppError::ReferenceRewritePartial {
                moved_to,
                updated,
                failed,
            } => json!({ "moved_to": moved_to, "updated": updated, "failed": failed }),
            AppError::RenameConflict { existing } => json!({ "existing": existing }),
            AppError::SectionNotFound { path, section } => {
                json!({ "path": path, "section": section })
            }
            AppError::NotFound(path)
            | AppError::AlreadyExists(path)
            | AppError::OutsideVault(path)
            | AppError::Io { path, .. } => json!({ "path": path }),
            _ => Value::Null,
        }
    }
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::OutsideVault(path) => AppError::OutsideVault(path),
            VaultError::NotFound(path) => AppError::NotFound(path),
            VaultError::AlreadyExists(path) => AppError::AlreadyExists(path),
            VaultError::SectionNotFound { path, section } => {
                AppError::SectionNotFound { path, section }
            }
            VaultError::InvalidArgument(msg) => AppError::InvalidArgument(msg),
            VaultError::Io { path, source } => AppError::Io { path, source },
        }
    }
}

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Unavailable(reason) => AppError::IndexUnavailable(reason),
            IndexError::Embedding(e) => AppError::EmbeddingFailure(e),
            IndexError::RebuildInterrupted => AppError::RebuildInterrupted,
            IndexError::RebuildInProgress => AppError::RebuildInProgress,
            IndexError::Vault(e) => e.into(),
            other => AppError::Other(other.into()),
        }
    }
}

impl From<CoordinatorError> for AppError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Vault(e) => e.into(),
            CoordinatorError::Graph(e) => AppError::Graph(e),
            CoordinatorError::RenameConflict { existing } => AppError::RenameConflict { existing },
            CoordinatorError::ReferenceRewritePartial {
                moved_to,
                updated,
                failed,
            } => AppError::ReferenceRewritePartial {
                moved_to,
                updated,
                failed,
            },
        }
    }
}
