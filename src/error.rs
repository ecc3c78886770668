//! Error taxonomy shared by every lastdoc component.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Stable, machine-readable error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    DuplicateVersion,
    VersionNotReady,
    BuildInProgress,
    StorageError,
    IndexBackendError,
    NotFound,
    PartialDelete,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::DuplicateVersion => "duplicate_version",
            ErrorKind::VersionNotReady => "version_not_ready",
            ErrorKind::BuildInProgress => "build_in_progress",
            ErrorKind::StorageError => "storage_error",
            ErrorKind::IndexBackendError => "index_backend_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PartialDelete => "partial_delete",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a cascading delete removed and what it had to leave behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub document_id: String,
    /// `true` once the document record itself is gone.
    pub document_removed: bool,
    pub removed_versions: Vec<String>,
    pub retained_versions: Vec<String>,
    pub removed_indexes: Vec<String>,
    pub retained_indexes: Vec<String>,
    /// Content blobs that could not be removed after their version was dropped.
    pub orphaned_content: Vec<String>,
}

impl DeleteReport {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum DocError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("version '{version}' already exists for document {document_id}")]
    DuplicateVersion { document_id: String, version: String },

    #[error("version '{version}' of document {document_id} is {status}, not completed")]
    VersionNotReady {
        document_id: String,
        version: String,
        status: String,
    },

    #[error("index build for {document_id}@{version} is already in progress")]
    BuildInProgress { document_id: String, version: String },

    #[error("content storage failed: {0}")]
    Storage(String),

    #[error("index backend failed: {0}")]
    IndexBackend(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(
        "delete of document {} incomplete: {} version(s) and {} index(es) retained",
        .0.document_id,
        .0.retained_versions.len(),
        .0.retained_indexes.len()
    )]
    PartialDelete(DeleteReport),
}

impl DocError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DocError::Validation(_) => ErrorKind::ValidationError,
            DocError::DuplicateVersion { .. } => ErrorKind::DuplicateVersion,
            DocError::VersionNotReady { .. } => ErrorKind::VersionNotReady,
            DocError::BuildInProgress { .. } => ErrorKind::BuildInProgress,
            DocError::Storage(_) => ErrorKind::StorageError,
            DocError::IndexBackend(_) => ErrorKind::IndexBackendError,
            DocError::NotFound(_) => ErrorKind::NotFound,
            DocError::PartialDelete(_) => ErrorKind::PartialDelete,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        DocError::Validation(message.into())
    }

    pub fn document_not_found(document_id: &str) -> Self {
        DocError::NotFound(format!("document {document_id}"))
    }

    pub fn version_not_found(document_id: &str, version: &str) -> Self {
        DocError::NotFound(format!("version '{version}' of document {document_id}"))
    }

    pub fn storage(err: impl fmt::Display) -> Self {
        DocError::Storage(err.to_string())
    }

    pub fn index_backend(err: impl fmt::Display) -> Self {
        DocError::IndexBackend(err.to_string())
    }
}

/// Wire form of an error: `{ "kind": ..., "message": ... }`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<DeleteReport>,
}

impl From<&DocError> for ErrorBody {
    fn from(err: &DocError) -> Self {
        let report = match err {
            DocError::PartialDelete(report) => Some(report.clone()),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            report,
        }
    }
}

pub type Result<T> = std::result::Result<T, DocError>;
