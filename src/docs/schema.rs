use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::DocError;

/// Kind of technical document a version holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Markdown,
    Pdf,
    Docx,
    Swagger,
    Openapi,
    JavaDoc,
}

impl DocumentType {
    pub const ALL: [DocumentType; 6] = [
        DocumentType::Markdown,
        DocumentType::Pdf,
        DocumentType::Docx,
        DocumentType::Swagger,
        DocumentType::Openapi,
        DocumentType::JavaDoc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Markdown => "markdown",
            DocumentType::Pdf => "pdf",
            DocumentType::Docx => "docx",
            DocumentType::Swagger => "swagger",
            DocumentType::Openapi => "openapi",
            DocumentType::JavaDoc => "java_doc",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        DocumentType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| DocError::validation(format!("invalid document type: {s}")))
    }
}

/// Processing state of a version.
///
/// `uploading -> processing -> completed | failed`, or `uploading -> failed`.
/// `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Uploading => "uploading",
            VersionStatus::Processing => "processing",
            VersionStatus::Completed => "completed",
            VersionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VersionStatus::Completed | VersionStatus::Failed)
    }

    pub fn can_transition_to(&self, next: VersionStatus) -> bool {
        use VersionStatus::*;
        matches!(
            (self, next),
            (Uploading, Processing) | (Uploading, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uploading" => Ok(VersionStatus::Uploading),
            "processing" => Ok(VersionStatus::Processing),
            "completed" => Ok(VersionStatus::Completed),
            "failed" => Ok(VersionStatus::Failed),
            other => Err(DocError::validation(format!("invalid status: {other}"))),
        }
    }
}

/// State of the search index of one (document, version) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Absent,
    Building,
    Ready,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Absent => "absent",
            IndexStatus::Building => "building",
            IndexStatus::Ready => "ready",
            IndexStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a version (and of its index entry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey {
    pub document_id: String,
    pub version: String,
}

impl IndexKey {
    pub fn new(document_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.document_id, self.version)
    }
}

/// Opaque handle to bytes held by a content store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRef(pub String);

impl ContentRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logical work with one or more versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub library: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub description: String,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Label of the canonical completed version, if any. Lookup only.
    pub current_version: Option<String>,
    /// Derived: status of the current version, else of the newest version.
    pub status: Option<VersionStatus>,
    pub version_count: usize,
    /// Version labels in creation order.
    pub versions: Vec<String>,
    /// Creation order, used for stable listing.
    #[serde(skip)]
    pub seq: u64,
}

/// An immutable (once completed) content snapshot of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub document_id: String,
    pub version: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub category: String,
    pub description: String,
    pub filename: Option<String>,
    pub size_bytes: u64,
    pub status: VersionStatus,
    /// Retained reason when `status` is `failed`.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub content_ref: Option<ContentRef>,
    /// Set once processing has read the content.
    pub metadata: Option<ContentMetadata>,
    #[serde(skip)]
    pub seq: u64,
    /// Distinguishes this version from a later one re-created under the same label.
    #[serde(skip)]
    pub uid: u64,
    /// Order in which versions completed; the greatest is the most recent.
    #[serde(skip)]
    pub completion_seq: Option<u64>,
}

impl Version {
    pub fn key(&self) -> IndexKey {
        IndexKey::new(&self.document_id, &self.version)
    }
}

/// What processing learned about a version's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub title: Option<String>,
    pub headings: Vec<String>,
    pub word_count: usize,
    pub code_blocks: usize,
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
}

/// Searchable representation of one version's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub document_id: String,
    pub version: String,
    pub status: IndexStatus,
    pub built_at: Option<DateTime<Utc>>,
    /// Distinct terms written to the backend.
    pub term_count: usize,
    /// Total tokens in the extracted text.
    pub token_count: usize,
    /// Retained reason when `status` is `failed`.
    pub error: Option<String>,
    pub snippet: Option<String>,
    #[serde(skip)]
    pub ticket: u64,
}

impl IndexEntry {
    pub fn absent(key: &IndexKey) -> Self {
        Self {
            document_id: key.document_id.clone(),
            version: key.version.clone(),
            status: IndexStatus::Absent,
            built_at: None,
            term_count: 0,
            token_count: 0,
            error: None,
            snippet: None,
            ticket: 0,
        }
    }

    pub fn key(&self) -> IndexKey {
        IndexKey::new(&self.document_id, &self.version)
    }
}

/// Metadata sent with an upload request (not the bytes themselves).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub name: String,
    /// Empty means "guess from the filename".
    #[serde(rename = "type", default)]
    pub doc_type: String,
    pub library: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Per-version metadata once validated.
#[derive(Debug, Clone)]
pub struct VersionMetadata {
    pub doc_type: DocumentType,
    pub category: String,
    pub description: String,
    pub filename: Option<String>,
}

pub const DEFAULT_CATEGORY: &str = "general";

impl VersionMetadata {
    pub fn new(doc_type: DocumentType) -> Self {
        Self {
            doc_type,
            category: DEFAULT_CATEGORY.to_string(),
            description: String::new(),
            filename: None,
        }
    }
}

/// Partial metadata update for a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub library: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Editable fields of a version. Content and status never change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionUpdate {
    pub description: Option<String>,
    pub category: Option<String>,
}

/// Per-document view of index progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSummary {
    pub document_id: String,
    pub total: usize,
    pub indexed: usize,
    pub progress: f64,
    pub versions: Vec<IndexEntry>,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub document_id: String,
    pub version: Option<String>,
    pub name: String,
    pub library: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub score: f64,
    pub snippet: Option<String>,
    pub built_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub seq: u64,
}
