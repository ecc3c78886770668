//! Catalog of documents and their versions.
//!
//! All mutations happen under one short write lock, never across an await.
//! The catalog is the only place `current_version` is written; it does so when
//! a version completes or is removed.
//!
//! A persistent catalog writes every change to its [`RecordStore`] before
//! applying it in memory, so a failed write leaves both sides unchanged.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use super::records::{RecordStore, Snapshot};
use super::schema::{
    ContentMetadata, ContentRef, Document, DocumentType, DocumentUpdate, IndexKey, Version, VersionMetadata,
    VersionStatus, VersionUpdate, DEFAULT_CATEGORY,
};
use crate::error::{DocError, Result};

/// Reason recorded for versions a restart caught mid-processing.
pub const INTERRUPTED_REASON: &str = "processing interrupted by restart";

/// Fields of a document supplied at creation.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub name: String,
    pub library: String,
    pub doc_type: DocumentType,
    pub description: String,
    pub tags: BTreeSet<String>,
}

/// A state change requested for a version.
#[derive(Debug, Clone)]
pub struct Transition {
    pub status: VersionStatus,
    pub reason: Option<String>,
    pub content_ref: Option<ContentRef>,
    pub size_bytes: Option<u64>,
    pub metadata: Option<ContentMetadata>,
}

impl Transition {
    pub fn to(status: VersionStatus) -> Self {
        Self {
            status,
            reason: None,
            content_ref: None,
            size_bytes: None,
            metadata: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::to(VersionStatus::Failed)
        }
    }
}

/// Result of removing one version.
#[derive(Debug, Clone)]
pub struct RemovedVersion {
    pub version: Version,
    pub document_removed: bool,
    pub new_current: Option<String>,
}

/// Where an upload landed.
#[derive(Debug, Clone)]
pub struct Placement {
    pub document_id: String,
    pub created_document: bool,
    pub version: Version,
}

#[derive(Clone)]
struct DocumentRecord {
    document: Document,
    versions: Vec<Version>,
}

impl DocumentRecord {
    fn find(&self, label: &str) -> Option<&Version> {
        self.versions.iter().find(|v| v.version == label)
    }

    fn find_mut(&mut self, label: &str) -> Option<&mut Version> {
        self.versions.iter_mut().find(|v| v.version == label)
    }

    /// Most recently completed version, if any.
    fn latest_completed(&self) -> Option<&Version> {
        self.versions
            .iter()
            .filter(|v| v.status == VersionStatus::Completed)
            .max_by_key(|v| v.completion_seq.unwrap_or(0))
    }

    fn materialize(&self) -> Document {
        let mut doc = self.document.clone();
        doc.version_count = self.versions.len();
        doc.versions = self.versions.iter().map(|v| v.version.clone()).collect();
        doc.status = match doc.current_version.as_deref().and_then(|label| self.find(label)) {
            Some(current) => Some(current.status),
            None => self.versions.iter().max_by_key(|v| v.seq).map(|v| v.status),
        };
        doc
    }
}

#[derive(Default)]
struct CatalogInner {
    documents: HashMap<String, DocumentRecord>,
    next_seq: u64,
    next_completion: u64,
}

impl CatalogInner {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn new_version(&mut self, document_id: &str, label: &str, meta: &VersionMetadata) -> Version {
        let seq = self.bump();
        let now = Utc::now();
        Version {
            document_id: document_id.to_string(),
            version: label.to_string(),
            doc_type: meta.doc_type,
            category: meta.category.clone(),
            description: meta.description.clone(),
            filename: meta.filename.clone(),
            size_bytes: 0,
            status: VersionStatus::Uploading,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            content_ref: None,
            metadata: None,
            seq,
            uid: seq,
            completion_seq: None,
        }
    }

    fn create_document(
        &mut self,
        records: Option<&dyn RecordStore>,
        new: NewDocument,
        label: &str,
        meta: &VersionMetadata,
    ) -> Result<Placement> {
        let id = Uuid::new_v4().to_string();
        let seq = self.bump();
        let now = Utc::now();
        let document = Document {
            id: id.clone(),
            name: new.name,
            library: new.library,
            doc_type: new.doc_type,
            description: new.description,
            tags: new.tags,
            created_at: now,
            updated_at: now,
            current_version: None,
            status: None,
            version_count: 0,
            versions: Vec::new(),
            seq,
        };
        let version = self.new_version(&id, label, meta);
        if let Some(records) = records {
            records.save(&document, &[&version])?;
        }
        self.documents.insert(
            id.clone(),
            DocumentRecord {
                document,
                versions: vec![version.clone()],
            },
        );
        Ok(Placement {
            document_id: id,
            created_document: true,
            version,
        })
    }

    fn add_version(
        &mut self,
        records: Option<&dyn RecordStore>,
        document_id: &str,
        label: &str,
        meta: &VersionMetadata,
    ) -> Result<Version> {
        let exists = self
            .documents
            .get(document_id)
            .ok_or_else(|| DocError::document_not_found(document_id))?
            .find(label)
            .is_some();
        if exists {
            return Err(DocError::DuplicateVersion {
                document_id: document_id.to_string(),
                version: label.to_string(),
            });
        }
        let version = self.new_version(document_id, label, meta);
        let record = self
            .documents
            .get_mut(document_id)
            .ok_or_else(|| DocError::document_not_found(document_id))?;
        if let Some(records) = records {
            records.save(&record.document, &[&version])?;
        }
        record.versions.push(version.clone());
        Ok(version)
    }

    /// Rebuild state from stored records. Versions a restart caught before
    /// they settled come back as `failed`, and are returned for re-saving.
    fn restore(snapshot: Snapshot) -> (Self, Vec<(Document, Version)>) {
        let mut inner = Self::default();
        for document in snapshot.documents {
            inner.next_seq = inner.next_seq.max(document.seq);
            inner.documents.insert(
                document.id.clone(),
                DocumentRecord {
                    document,
                    versions: Vec::new(),
                },
            );
        }

        let mut interrupted = Vec::new();
        for mut version in snapshot.versions {
            inner.next_seq = inner.next_seq.max(version.seq).max(version.uid);
            inner.next_completion = inner.next_completion.max(version.completion_seq.unwrap_or(0));
            let Some(record) = inner.documents.get_mut(&version.document_id) else {
                continue;
            };
            if !version.status.is_terminal() {
                version.status = VersionStatus::Failed;
                version.failure_reason = Some(INTERRUPTED_REASON.to_string());
                version.updated_at = Utc::now();
                interrupted.push(version.key());
            }
            record.versions.push(version);
        }

        // A document whose versions are all gone has nothing left to restore.
        inner.documents.retain(|_, r| !r.versions.is_empty());
        for record in inner.documents.values_mut() {
            let current_ok = record
                .document
                .current_version
                .as_deref()
                .and_then(|label| record.find(label))
                .is_some_and(|v| v.status == VersionStatus::Completed);
            if !current_ok {
                record.document.current_version = record.latest_completed().map(|v| v.version.clone());
            }
        }

        let interrupted = interrupted
            .iter()
            .filter_map(|key| {
                let record = inner.documents.get(&key.document_id)?;
                Some((record.document.clone(), record.find(&key.version)?.clone()))
            })
            .collect();
        (inner, interrupted)
    }
}

#[derive(Default)]
pub struct Catalog {
    inner: RwLock<CatalogInner>,
    records: Option<Arc<dyn RecordStore>>,
}

impl Catalog {
    /// Catalog that lives in memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog backed by `records`, loaded from whatever they already hold.
    pub fn persistent(records: Arc<dyn RecordStore>) -> Result<Self> {
        let (inner, interrupted) = CatalogInner::restore(records.load()?);
        for (document, version) in &interrupted {
            records.save(document, &[version])?;
            tracing::warn!(key = %version.key(), "version was still processing at shutdown; marked failed");
        }
        tracing::info!(
            documents = inner.documents.len(),
            interrupted = interrupted.len(),
            "catalog loaded"
        );
        Ok(Self {
            inner: RwLock::new(inner),
            records: Some(records),
        })
    }

    fn records(&self) -> Option<&dyn RecordStore> {
        self.records.as_deref()
    }

    /// Create a document together with its first version (in `uploading`).
    pub fn create_document(&self, new: NewDocument, label: &str, meta: &VersionMetadata) -> Result<Placement> {
        self.inner.write().create_document(self.records(), new, label, meta)
    }

    /// Add a version to an existing document.
    pub fn add_version(&self, document_id: &str, label: &str, meta: &VersionMetadata) -> Result<Version> {
        self.inner.write().add_version(self.records(), document_id, label, meta)
    }

    /// Add a version to the document owning `new.library`, creating it if needed.
    pub fn place_in_library(&self, new: NewDocument, label: &str, meta: &VersionMetadata) -> Result<Placement> {
        let mut inner = self.inner.write();
        let existing = inner
            .documents
            .values()
            .filter(|r| r.document.library == new.library)
            .min_by_key(|r| r.document.seq)
            .map(|r| r.document.id.clone());
        match existing {
            Some(document_id) => {
                let version = inner.add_version(self.records(), &document_id, label, meta)?;
                Ok(Placement {
                    document_id,
                    created_document: false,
                    version,
                })
            }
            None => inner.create_document(self.records(), new, label, meta),
        }
    }

    /// Apply a forward transition to the version instance identified by `uid`.
    ///
    /// Fails with `NotFound` when that instance no longer exists (it was
    /// deleted, possibly re-created under the same label) and with
    /// `Validation` when the transition is not allowed.
    pub fn transition(&self, key: &IndexKey, uid: u64, change: Transition) -> Result<Version> {
        let mut inner = self.inner.write();
        let completion = inner.next_completion + 1;

        let record = inner
            .documents
            .get_mut(&key.document_id)
            .ok_or_else(|| DocError::document_not_found(&key.document_id))?;
        let mut version = record
            .find(&key.version)
            .filter(|v| v.uid == uid)
            .cloned()
            .ok_or_else(|| DocError::version_not_found(&key.document_id, &key.version))?;

        if !version.status.can_transition_to(change.status) {
            return Err(DocError::validation(format!(
                "illegal transition {} -> {} for {key}",
                version.status, change.status
            )));
        }

        let now = Utc::now();
        version.status = change.status;
        version.updated_at = now;
        if let Some(content_ref) = change.content_ref {
            version.content_ref = Some(content_ref);
        }
        if let Some(size) = change.size_bytes {
            version.size_bytes = size;
        }
        if let Some(metadata) = change.metadata {
            version.metadata = Some(metadata);
        }
        if change.status == VersionStatus::Failed {
            version.failure_reason = change.reason;
        }
        let mut document = record.document.clone();
        if change.status == VersionStatus::Completed {
            version.completed_at = Some(now);
            version.completion_seq = Some(completion);
            document.current_version = Some(version.version.clone());
            document.updated_at = now;
        }

        if let Some(records) = self.records.as_deref() {
            records.save(&document, &[&version])?;
        }
        record.document = document;
        if let Some(slot) = record.find_mut(&key.version) {
            *slot = version.clone();
        }
        if version.status == VersionStatus::Completed {
            inner.next_completion = completion;
        }
        Ok(version)
    }

    /// Change a version's description or category, in any state.
    pub fn update_version(&self, key: &IndexKey, update: VersionUpdate) -> Result<Version> {
        let mut inner = self.inner.write();
        let record = inner
            .documents
            .get_mut(&key.document_id)
            .ok_or_else(|| DocError::document_not_found(&key.document_id))?;
        let mut version = record
            .find(&key.version)
            .cloned()
            .ok_or_else(|| DocError::version_not_found(&key.document_id, &key.version))?;
        if let Some(description) = update.description {
            version.description = description;
        }
        if let Some(category) = update.category {
            let category = category.trim();
            version.category = if category.is_empty() {
                DEFAULT_CATEGORY.to_string()
            } else {
                category.to_string()
            };
        }
        version.updated_at = Utc::now();

        if let Some(records) = self.records.as_deref() {
            records.save(&record.document, &[&version])?;
        }
        if let Some(slot) = record.find_mut(&key.version) {
            *slot = version.clone();
        }
        Ok(version)
    }

    /// Remove one version; drops the document when it was the last one.
    pub fn remove_version(&self, key: &IndexKey) -> Result<RemovedVersion> {
        let mut inner = self.inner.write();
        let record = inner
            .documents
            .get(&key.document_id)
            .ok_or_else(|| DocError::document_not_found(&key.document_id))?;
        let pos = record
            .versions
            .iter()
            .position(|v| v.version == key.version)
            .ok_or_else(|| DocError::version_not_found(&key.document_id, &key.version))?;

        let mut next = record.clone();
        let version = next.versions.remove(pos);
        if next.document.current_version.as_deref() == Some(version.version.as_str()) {
            next.document.current_version = next.latest_completed().map(|v| v.version.clone());
            next.document.updated_at = Utc::now();
        }
        let new_current = next.document.current_version.clone();
        let document_removed = next.versions.is_empty();

        if let Some(records) = self.records.as_deref() {
            let remaining = (!document_removed).then_some(&next.document);
            records.remove_version(key, remaining)?;
        }
        if document_removed {
            inner.documents.remove(&key.document_id);
        } else {
            inner.documents.insert(key.document_id.clone(), next);
        }
        Ok(RemovedVersion {
            version,
            document_removed,
            new_current,
        })
    }

    /// Remove a document and all of its versions at once.
    pub fn remove_document(&self, document_id: &str) -> Result<Vec<Version>> {
        let mut inner = self.inner.write();
        if !inner.documents.contains_key(document_id) {
            return Err(DocError::document_not_found(document_id));
        }
        if let Some(records) = self.records.as_deref() {
            records.remove_document(document_id)?;
        }
        inner
            .documents
            .remove(document_id)
            .map(|r| r.versions)
            .ok_or_else(|| DocError::document_not_found(document_id))
    }

    pub fn update_document(&self, document_id: &str, update: DocumentUpdate) -> Result<Document> {
        let mut inner = self.inner.write();
        let record = inner
            .documents
            .get_mut(document_id)
            .ok_or_else(|| DocError::document_not_found(document_id))?;
        let mut doc = record.document.clone();
        if let Some(name) = update.name {
            doc.name = name;
        }
        if let Some(description) = update.description {
            doc.description = description;
        }
        if let Some(library) = update.library {
            doc.library = library;
        }
        if let Some(tags) = update.tags {
            doc.tags = tags.into_iter().collect();
        }
        doc.updated_at = Utc::now();

        if let Some(records) = self.records.as_deref() {
            records.save(&doc, &[])?;
        }
        record.document = doc;
        Ok(record.materialize())
    }

    pub fn document(&self, document_id: &str) -> Option<Document> {
        self.inner.read().documents.get(document_id).map(DocumentRecord::materialize)
    }

    pub fn documents(&self) -> Vec<Document> {
        self.inner
            .read()
            .documents
            .values()
            .map(DocumentRecord::materialize)
            .collect()
    }

    pub fn version(&self, key: &IndexKey) -> Option<Version> {
        self.inner
            .read()
            .documents
            .get(&key.document_id)
            .and_then(|r| r.find(&key.version).cloned())
    }

    pub fn versions(&self, document_id: &str) -> Option<Vec<Version>> {
        self.inner
            .read()
            .documents
            .get(document_id)
            .map(|r| r.versions.clone())
    }

    pub fn all_versions(&self) -> Vec<Version> {
        self.inner
            .read()
            .documents
            .values()
            .flat_map(|r| r.versions.iter().cloned())
            .collect()
    }

    /// `(documents, versions)` currently held.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read();
        let versions = inner.documents.values().map(|r| r.versions.len()).sum();
        (inner.documents.len(), versions)
    }
}
