//! Document Registry: document identity, metadata and cascading delete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::catalog::{Catalog, NewDocument};
use super::events::{EventBus, LifecycleEvent};
use super::extract::{guess_document_type, validate_filename};
use super::index::IndexCoordinator;
use super::lifecycle::{Target, VersionManager};
use super::pagination::{Filters, PageRequest, PageResult, Pageable, Paginator};
use super::schema::{
    Document, DocumentMetadata, DocumentType, DocumentUpdate, Version, VersionMetadata, VersionStatus,
    DEFAULT_CATEGORY,
};
use super::storage::ContentStore;
use crate::error::{DeleteReport, DocError, Result};

/// Filter keys accepted by [`Registry::list`].
pub const DOCUMENT_FILTERS: &[&str] = &[
    "library",
    "type",
    "version",
    "status",
    "name",
    "tag",
    "created_after",
    "created_before",
];

const MAX_LABEL_LEN: usize = 128;

/// Metadata for adding a version to a known document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionUpload {
    pub version: String,
    /// Defaults to the type the filename names, then to the document's type.
    #[serde(rename = "type", default)]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Where an upload landed.
#[derive(Debug, Clone, Serialize)]
pub struct Upload {
    pub document: Document,
    pub version: Version,
    pub created_document: bool,
}

fn parse_time(key: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DocError::validation(format!("filter '{key}' is not an RFC 3339 timestamp: {e}")))
}

impl Pageable for Document {
    fn identifier(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.id)
    }

    fn sequence(&self) -> u64 {
        self.seq
    }

    fn matches(&self, key: &str, value: &str) -> bool {
        match key {
            "library" => self.library == value,
            "type" => self.doc_type.as_str().eq_ignore_ascii_case(value),
            "version" => self.versions.iter().any(|v| v == value),
            "status" => self
                .status
                .is_some_and(|s| s.as_str().eq_ignore_ascii_case(value)),
            "name" => self.name.to_lowercase().contains(&value.to_lowercase()),
            "tag" => self.tags.contains(value),
            "created_after" => parse_time(key, value).is_ok_and(|t| self.created_at >= t),
            "created_before" => parse_time(key, value).is_ok_and(|t| self.created_at <= t),
            _ => false,
        }
    }
}

/// Check keys and typed values of document list filters.
pub(crate) fn validate_list_filters(filters: &Filters) -> Result<()> {
    filters.ensure_keys(DOCUMENT_FILTERS)?;
    if let Some(t) = filters.get("type") {
        t.parse::<DocumentType>()?;
    }
    if let Some(s) = filters.get("status") {
        s.parse::<VersionStatus>()?;
    }
    for key in ["created_after", "created_before"] {
        if let Some(value) = filters.get(key) {
            parse_time(key, value)?;
        }
    }
    Ok(())
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(DocError::validation(format!("{field} is required")))
    } else {
        Ok(trimmed)
    }
}

fn validate_label(label: &str) -> Result<String> {
    let label = required("version", label)?;
    if label.len() > MAX_LABEL_LEN || label.contains('/') || label.chars().any(char::is_control) {
        return Err(DocError::validation(format!(
            "version label must be 1-{MAX_LABEL_LEN} characters without '/'"
        )));
    }
    Ok(label.to_string())
}

fn clean_tags(tags: impl IntoIterator<Item = String>) -> BTreeSet<String> {
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn version_metadata(
    doc_type: DocumentType,
    category: Option<String>,
    description: String,
    filename: Option<String>,
) -> Result<VersionMetadata> {
    let filename = filename.map(|f| f.trim().to_string()).filter(|f| !f.is_empty());
    if let Some(name) = &filename {
        validate_filename(name, doc_type)?;
    }
    Ok(VersionMetadata {
        doc_type,
        category: category
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        description,
        filename,
    })
}

/// An explicit type wins; otherwise the filename extension decides.
fn resolve_type(explicit: Option<&str>, filename: Option<&str>, content: &[u8]) -> Result<Option<DocumentType>> {
    if let Some(t) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return t.parse().map(Some);
    }
    Ok(filename.and_then(|name| guess_document_type(name.trim(), content)))
}

fn validate_upload(meta: DocumentMetadata, content: &[u8]) -> Result<(NewDocument, VersionMetadata)> {
    let name = required("name", &meta.name)?.to_string();
    let library = required("library", &meta.library)?.to_string();
    if content.is_empty() {
        return Err(DocError::validation("content is required"));
    }
    let doc_type = resolve_type(Some(&meta.doc_type), meta.filename.as_deref(), content)?
        .ok_or_else(|| DocError::validation("type is required when the filename does not name one"))?;
    let version = version_metadata(doc_type, meta.category, meta.description.clone(), meta.filename)?;
    Ok((
        NewDocument {
            name,
            library,
            doc_type,
            description: meta.description,
            tags: clean_tags(meta.tags),
        },
        version,
    ))
}

pub struct Registry {
    catalog: Arc<Catalog>,
    versions: VersionManager,
    index: Arc<IndexCoordinator>,
    store: Arc<dyn ContentStore>,
    events: EventBus,
    paginator: Paginator,
}

impl Registry {
    pub fn new(
        catalog: Arc<Catalog>,
        versions: VersionManager,
        index: Arc<IndexCoordinator>,
        store: Arc<dyn ContentStore>,
        events: EventBus,
        paginator: Paginator,
    ) -> Self {
        Self {
            catalog,
            versions,
            index,
            store,
            events,
            paginator,
        }
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    /// Create a new document with its first version.
    pub fn create(&self, meta: DocumentMetadata, version: &str, content: Vec<u8>) -> Result<Upload> {
        let label = validate_label(version)?;
        let (new, version_meta) = validate_upload(meta, &content)?;
        self.admit(Target::NewDocument(new), &label, content, version_meta)
    }

    /// Add a version to the document of the same library, creating it if needed.
    pub fn upload(&self, meta: DocumentMetadata, version: &str, content: Vec<u8>) -> Result<Upload> {
        let label = validate_label(version)?;
        let (new, version_meta) = validate_upload(meta, &content)?;
        self.admit(Target::Library(new), &label, content, version_meta)
    }

    /// Add a version to a known document.
    pub fn add_version(&self, document_id: &str, upload: VersionUpload, content: Vec<u8>) -> Result<Upload> {
        let label = validate_label(&upload.version)?;
        let document = self.get(document_id)?;
        if content.is_empty() {
            return Err(DocError::validation("content is required"));
        }
        let doc_type = resolve_type(upload.doc_type.as_deref(), upload.filename.as_deref(), &content)?
            .unwrap_or(document.doc_type);
        let meta = version_metadata(doc_type, upload.category, upload.description, upload.filename)?;
        self.admit(Target::Existing(document.id), &label, content, meta)
    }

    fn admit(&self, target: Target, label: &str, content: Vec<u8>, meta: VersionMetadata) -> Result<Upload> {
        let placement = self.versions.create_in(target, label, content, meta)?;
        let document = self.get(&placement.document_id)?;
        tracing::info!(
            document_id = %document.id,
            version = label,
            created_document = placement.created_document,
            "version upload accepted"
        );
        Ok(Upload {
            document,
            version: placement.version,
            created_document: placement.created_document,
        })
    }

    pub fn get(&self, document_id: &str) -> Result<Document> {
        self.catalog
            .document(document_id)
            .ok_or_else(|| DocError::document_not_found(document_id))
    }

    pub fn list(&self, filters: &Filters, request: PageRequest) -> Result<PageResult<Document>> {
        validate_list_filters(filters)?;
        let documents = self.catalog.documents();
        Ok(self.paginator.paginate(&documents, filters, request, None))
    }

    /// Change document metadata. Identity, versions and the current pointer stay as they are.
    pub fn update(&self, document_id: &str, mut update: DocumentUpdate) -> Result<Document> {
        update.name = update
            .name
            .as_deref()
            .map(|n| required("name", n).map(str::to_string))
            .transpose()?;
        update.library = update
            .library
            .as_deref()
            .map(|l| required("library", l).map(str::to_string))
            .transpose()?;
        update.tags = update.tags.take().map(|tags| clean_tags(tags).into_iter().collect());
        let document = self.catalog.update_document(document_id, update)?;
        tracing::info!(document_id, "document metadata updated");
        Ok(document)
    }

    /// Delete a document with every version and index entry.
    ///
    /// Index entries go first; if any cannot be removed the document keeps all
    /// of its versions and a [`DocError::PartialDelete`] describes what was
    /// removed and what was kept. Content blobs that cannot be removed after
    /// the records are gone are listed in `orphaned_content`.
    pub async fn delete(&self, document_id: &str) -> Result<DeleteReport> {
        let versions = self
            .catalog
            .versions(document_id)
            .ok_or_else(|| DocError::document_not_found(document_id))?;
        let mut report = DeleteReport::new(document_id);

        for v in &versions {
            match self.index.delete_index(document_id, Some(&v.version)) {
                Ok(keys) if !keys.is_empty() => report.removed_indexes.push(v.version.clone()),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(document_id, version = %v.version, error = %e, "index removal failed");
                    report.retained_indexes.push(v.version.clone());
                }
            }
        }
        if !report.retained_indexes.is_empty() {
            report.retained_versions = versions.iter().map(|v| v.version.clone()).collect();
            return Err(DocError::PartialDelete(report));
        }

        let removed = self.catalog.remove_document(document_id)?;
        report.document_removed = true;
        report.removed_versions = removed.iter().map(|v| v.version.clone()).collect();
        for v in &removed {
            self.events.publish(LifecycleEvent::VersionDeleted { key: v.key() });
        }

        // A build that committed between the index sweep and the record removal.
        if let Err(e) = self.index.delete_index(document_id, None) {
            tracing::warn!(document_id, error = %e, "late index entries could not be removed");
        }

        for content_ref in removed.iter().filter_map(|v| v.content_ref.as_ref()) {
            if let Err(e) = self.store.remove(content_ref).await {
                tracing::warn!(document_id, %content_ref, error = %e, "document content could not be removed");
                report.orphaned_content.push(content_ref.to_string());
            }
        }

        tracing::info!(
            document_id,
            versions = report.removed_versions.len(),
            orphaned = report.orphaned_content.len(),
            "document deleted"
        );
        Ok(report)
    }

    /// `(documents, versions)` currently held.
    pub fn counts(&self) -> (usize, usize) {
        self.catalog.counts()
    }
}
