//! Version Lifecycle Manager.
//!
//! `create` returns as soon as the version is recorded in `uploading`; storage
//! and validation continue in a background task that walks the version through
//! `processing` to `completed` or `failed`. The task carries the version's
//! instance id, so work for a version deleted in the meantime is thrown away.

use std::borrow::Cow;
use std::sync::Arc;

use super::catalog::{Catalog, NewDocument, Placement, Transition};
use super::events::{EventBus, LifecycleEvent};
use super::extract::{describe, extract_text, DEFAULT_MAX_TEXT_LEN};
use super::index::IndexCoordinator;
use super::pagination::{Filters, PageRequest, PageResult, Pageable, Paginator, SortKey, SortSpec, SortValue};
use super::schema::{ContentRef, IndexKey, Version, VersionMetadata, VersionStatus, VersionUpdate};
use super::storage::ContentStore;
use crate::error::{DocError, Result};

/// Filter keys accepted by [`VersionManager::list`].
pub const VERSION_FILTERS: &[&str] = &["status", "type", "category"];

/// How a new version finds its document.
#[derive(Debug, Clone)]
pub enum Target {
    /// Always create a new document.
    NewDocument(NewDocument),
    /// Join the document that owns the same library, or create one.
    Library(NewDocument),
    /// An existing document.
    Existing(String),
}

/// Outcome of a version delete.
#[derive(Debug, Clone)]
pub struct VersionDeletion {
    pub key: IndexKey,
    pub document_removed: bool,
    pub current_version: Option<String>,
    /// Blob left behind because the store could not remove it.
    pub orphaned_content: Option<ContentRef>,
}

impl Pageable for Version {
    fn identifier(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.version)
    }

    fn sequence(&self) -> u64 {
        self.seq
    }

    fn matches(&self, key: &str, value: &str) -> bool {
        match key {
            "status" => self.status.as_str().eq_ignore_ascii_case(value),
            "type" => self.doc_type.as_str().eq_ignore_ascii_case(value),
            "category" => self.category.eq_ignore_ascii_case(value),
            _ => false,
        }
    }

    fn sort_value(&self, field: &str) -> Option<SortValue> {
        match field {
            "created" => Some(SortValue::Int(self.seq as i64)),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct VersionManager {
    catalog: Arc<Catalog>,
    store: Arc<dyn ContentStore>,
    index: Arc<IndexCoordinator>,
    events: EventBus,
    paginator: Paginator,
    max_text_len: usize,
}

impl VersionManager {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<dyn ContentStore>,
        index: Arc<IndexCoordinator>,
        events: EventBus,
    ) -> Self {
        Self {
            catalog,
            store,
            index,
            events,
            paginator: Paginator::default(),
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        }
    }

    pub fn with_paginator(mut self, paginator: Paginator) -> Self {
        self.paginator = paginator;
        self
    }

    pub fn with_max_text_len(mut self, max_text_len: usize) -> Self {
        self.max_text_len = max_text_len;
        self
    }

    /// Add a version to an existing document.
    pub fn create(&self, document_id: &str, label: &str, content: Vec<u8>, meta: VersionMetadata) -> Result<Version> {
        self.create_in(Target::Existing(document_id.to_string()), label, content, meta)
            .map(|placement| placement.version)
    }

    /// Record a version in `uploading` and start processing it.
    ///
    /// Fails synchronously only for a duplicate label or an unknown document.
    pub fn create_in(&self, target: Target, label: &str, content: Vec<u8>, meta: VersionMetadata) -> Result<Placement> {
        let placement = match target {
            Target::NewDocument(new) => self.catalog.create_document(new, label, &meta)?,
            Target::Library(new) => self.catalog.place_in_library(new, label, &meta)?,
            Target::Existing(document_id) => {
                let version = self.catalog.add_version(&document_id, label, &meta)?;
                Placement {
                    document_id,
                    created_document: false,
                    version,
                }
            }
        };

        tracing::debug!(
            document_id = %placement.document_id,
            version = label,
            status = %VersionStatus::Uploading,
            "version created"
        );

        let manager = self.clone();
        let version = placement.version.clone();
        tokio::spawn(async move {
            manager.process(version, content).await;
        });
        Ok(placement)
    }

    async fn process(&self, version: Version, content: Vec<u8>) {
        let key = version.key();
        let uid = version.uid;

        if content.is_empty() {
            self.fail(&key, uid, "content is empty".to_string(), None).await;
            return;
        }
        if let Err(e) = self.catalog.transition(&key, uid, Transition::to(VersionStatus::Processing)) {
            tracing::debug!(%key, error = %e, "version gone before processing; dropping upload");
            return;
        }
        tracing::debug!(%key, status = %VersionStatus::Processing, "version processing");

        let content_ref = match self.store.store(&content, version.filename.as_deref()).await {
            Ok(r) => r,
            Err(e) => {
                self.fail(&key, uid, e.to_string(), None).await;
                return;
            }
        };

        let size = content.len() as u64;
        let doc_type = version.doc_type;
        let max_len = self.max_text_len;
        let described = tokio::task::spawn_blocking(move || {
            extract_text(&content, doc_type, max_len).map(|text| describe(&content, &text, doc_type))
        })
        .await
        .unwrap_or_else(|e| Err(DocError::storage(format!("processing task aborted: {e}"))));

        let metadata = match described {
            Ok(metadata) => metadata,
            Err(e) => {
                self.fail(&key, uid, e.to_string(), Some(content_ref)).await;
                return;
            }
        };

        let change = Transition {
            content_ref: Some(content_ref.clone()),
            size_bytes: Some(size),
            metadata: Some(metadata),
            ..Transition::to(VersionStatus::Completed)
        };
        match self.catalog.transition(&key, uid, change) {
            Ok(_) => {
                tracing::debug!(%key, status = %VersionStatus::Completed, size, "version completed");
                self.events.publish(LifecycleEvent::VersionReady { key });
            }
            Err(e) => {
                tracing::debug!(%key, error = %e, "version gone during processing; discarding content");
                self.discard_blob(&content_ref).await;
            }
        }
    }

    async fn fail(&self, key: &IndexKey, uid: u64, reason: String, content_ref: Option<ContentRef>) {
        let change = Transition {
            content_ref: content_ref.clone(),
            ..Transition::failed(reason.clone())
        };
        match self.catalog.transition(key, uid, change) {
            Ok(_) => {
                tracing::warn!(%key, status = %VersionStatus::Failed, %reason, "version processing failed");
                self.events.publish(LifecycleEvent::VersionFailed {
                    key: key.clone(),
                    reason,
                });
            }
            Err(e) => {
                tracing::debug!(%key, error = %e, "version gone before failure was recorded");
                if let Some(r) = content_ref {
                    self.discard_blob(&r).await;
                }
            }
        }
    }

    async fn discard_blob(&self, content_ref: &ContentRef) {
        if let Err(e) = self.store.remove(content_ref).await {
            tracing::warn!(%content_ref, error = %e, "failed to remove orphaned content");
        }
    }

    /// Delete a version in any state, together with its index entry.
    ///
    /// If the index backend refuses, the version is kept and the error returned.
    pub async fn delete(&self, document_id: &str, label: &str) -> Result<VersionDeletion> {
        let key = IndexKey::new(document_id, label);
        let removed = self
            .index
            .retire(&key, || self.catalog.remove_version(&key))?;

        self.events.publish(LifecycleEvent::VersionDeleted { key: key.clone() });
        tracing::info!(
            %key,
            document_removed = removed.document_removed,
            current_version = ?removed.new_current,
            "version deleted"
        );

        let mut orphaned_content = None;
        if let Some(content_ref) = removed.version.content_ref {
            if let Err(e) = self.store.remove(&content_ref).await {
                tracing::warn!(%key, %content_ref, error = %e, "version content could not be removed");
                orphaned_content = Some(content_ref);
            }
        }

        Ok(VersionDeletion {
            key,
            document_removed: removed.document_removed,
            current_version: removed.new_current,
            orphaned_content,
        })
    }

    pub fn get(&self, document_id: &str, label: &str) -> Result<Version> {
        self.catalog
            .version(&IndexKey::new(document_id, label))
            .ok_or_else(|| DocError::version_not_found(document_id, label))
    }

    /// The document's current version.
    pub fn latest(&self, document_id: &str) -> Result<Version> {
        let document = self
            .catalog
            .document(document_id)
            .ok_or_else(|| DocError::document_not_found(document_id))?;
        let label = document
            .current_version
            .ok_or_else(|| DocError::NotFound(format!("completed version of document {document_id}")))?;
        self.get(document_id, &label)
    }

    /// Versions of a document, newest first.
    pub fn list(&self, document_id: &str, filters: &Filters, request: PageRequest) -> Result<PageResult<Version>> {
        filters.ensure_keys(VERSION_FILTERS)?;
        let versions = self
            .catalog
            .versions(document_id)
            .ok_or_else(|| DocError::document_not_found(document_id))?;
        let newest_first = SortSpec::by([SortKey::desc("created")]);
        Ok(self.paginator.paginate(&versions, filters, request, Some(&newest_first)))
    }

    /// Every version of a document in creation order.
    pub fn all(&self, document_id: &str) -> Result<Vec<Version>> {
        let mut versions = self
            .catalog
            .versions(document_id)
            .ok_or_else(|| DocError::document_not_found(document_id))?;
        versions.sort_by_key(|v| v.seq);
        Ok(versions)
    }

    /// Change a version's description or category.
    pub fn update(&self, document_id: &str, label: &str, update: VersionUpdate) -> Result<Version> {
        let version = self.catalog.update_version(&IndexKey::new(document_id, label), update)?;
        tracing::info!(document_id, version = label, "version metadata updated");
        Ok(version)
    }

    pub fn count(&self, document_id: &str) -> Result<usize> {
        self.catalog
            .versions(document_id)
            .map(|v| v.len())
            .ok_or_else(|| DocError::document_not_found(document_id))
    }

    /// Raw bytes of a version together with its record.
    pub async fn download(&self, document_id: &str, label: &str) -> Result<(Version, Vec<u8>)> {
        let version = self.get(document_id, label)?;
        let content_ref = version.content_ref.clone().ok_or_else(|| DocError::VersionNotReady {
            document_id: document_id.to_string(),
            version: label.to_string(),
            status: version.status.to_string(),
        })?;
        let bytes = self.store.retrieve(&content_ref).await?;
        Ok((version, bytes))
    }

    /// Raw bytes of the document's current version.
    pub async fn download_latest(&self, document_id: &str) -> Result<(Version, Vec<u8>)> {
        let current = self.latest(document_id)?;
        self.download(document_id, &current.version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::backend::MemoryIndexBackend;
    use crate::docs::index::IndexSettings;
    use crate::docs::schema::{DocumentType, IndexStatus};
    use crate::docs::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Harness {
        catalog: Arc<Catalog>,
        store: Arc<MemoryStorage>,
        index: Arc<IndexCoordinator>,
        events: EventBus,
        versions: VersionManager,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStorage::new());
        harness_over(store.clone(), store)
    }

    /// `content` fronts `blobs`, which is what the harness inspects.
    fn harness_over(content: Arc<dyn ContentStore>, store: Arc<MemoryStorage>) -> Harness {
        let catalog = Arc::new(Catalog::new());
        let index = Arc::new(IndexCoordinator::new(
            catalog.clone(),
            content.clone(),
            Arc::new(MemoryIndexBackend::new()),
            IndexSettings::default(),
        ));
        let events = EventBus::new(64);
        let versions = VersionManager::new(catalog.clone(), content, index.clone(), events.clone());
        Harness {
            catalog,
            store,
            index,
            events,
            versions,
        }
    }

    fn new_doc() -> NewDocument {
        NewDocument {
            name: "Guide".into(),
            library: "lib".into(),
            doc_type: DocumentType::Markdown,
            description: String::new(),
            tags: BTreeSet::new(),
        }
    }

    fn meta() -> VersionMetadata {
        VersionMetadata::new(DocumentType::Markdown)
    }

    async fn settle(h: &Harness, document_id: &str, label: &str) -> Version {
        for _ in 0..200 {
            let v = h.versions.get(document_id, label).unwrap();
            if v.status.is_terminal() {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("version {document_id}@{label} never settled");
    }

    #[tokio::test]
    async fn create_walks_to_completed_and_publishes_ready() {
        let h = harness();
        let mut rx = h.events.subscribe();
        let placed = h
            .versions
            .create_in(Target::NewDocument(new_doc()), "1.0", b"# Intro\nfoo".to_vec(), meta())
            .unwrap();
        assert_eq!(placed.version.status, VersionStatus::Uploading);

        let v = settle(&h, &placed.document_id, "1.0").await;
        assert_eq!(v.status, VersionStatus::Completed);
        assert_eq!(v.size_bytes, 11);
        assert!(v.content_ref.is_some());
        let metadata = v.metadata.clone().unwrap();
        assert_eq!(metadata.title.as_deref(), Some("Intro"));
        assert_eq!(metadata.size_bytes, 11);
        assert_eq!(
            h.catalog.document(&placed.document_id).unwrap().current_version.as_deref(),
            Some("1.0")
        );
        assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::VersionReady { key: v.key() });
    }

    #[tokio::test]
    async fn invalid_content_fails_with_reason() {
        let h = harness();
        let placed = h
            .versions
            .create_in(Target::NewDocument(new_doc()), "1.0", vec![0xff, 0xfe], meta())
            .unwrap();
        let v = settle(&h, &placed.document_id, "1.0").await;
        assert_eq!(v.status, VersionStatus::Failed);
        assert!(v.failure_reason.unwrap().contains("UTF-8"));
        assert_eq!(h.catalog.document(&placed.document_id).unwrap().current_version, None);

        let empty = h.versions.create(&placed.document_id, "2.0", Vec::new(), meta()).unwrap();
        let v = settle(&h, &placed.document_id, &empty.version).await;
        assert_eq!(v.status, VersionStatus::Failed);
        assert_eq!(v.failure_reason.as_deref(), Some("content is empty"));
    }

    #[tokio::test]
    async fn duplicate_label_leaves_first_untouched() {
        let h = harness();
        let placed = h
            .versions
            .create_in(Target::NewDocument(new_doc()), "1.0", b"foo".to_vec(), meta())
            .unwrap();
        let first = settle(&h, &placed.document_id, "1.0").await;
        let err = h
            .versions
            .create(&placed.document_id, "1.0", b"bar".to_vec(), meta())
            .unwrap_err();
        assert!(matches!(err, DocError::DuplicateVersion { .. }));
        let again = h.versions.get(&placed.document_id, "1.0").unwrap();
        assert_eq!(again.uid, first.uid);
        assert_eq!(again.content_ref, first.content_ref);
    }

    #[tokio::test]
    async fn delete_cascades_and_moves_current() {
        let h = harness();
        let placed = h
            .versions
            .create_in(Target::NewDocument(new_doc()), "1.0", b"alpha".to_vec(), meta())
            .unwrap();
        let id = placed.document_id.clone();
        settle(&h, &id, "1.0").await;
        h.versions.create(&id, "2.0", b"beta".to_vec(), meta()).unwrap();
        settle(&h, &id, "2.0").await;
        assert_eq!(h.versions.latest(&id).unwrap().version, "2.0");

        h.index.build_index(&id, "2.0").unwrap();
        for _ in 0..200 {
            if h.index.get_status(&id, "2.0").status == IndexStatus::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let deletion = h.versions.delete(&id, "2.0").await.unwrap();
        assert_eq!(deletion.current_version.as_deref(), Some("1.0"));
        assert!(!deletion.document_removed);
        assert_eq!(h.index.get_status(&id, "2.0").status, IndexStatus::Absent);
        assert_eq!(h.versions.count(&id).unwrap(), 1);
        assert_eq!(h.store.len(), 1);

        let deletion = h.versions.delete(&id, "1.0").await.unwrap();
        assert!(deletion.document_removed);
        assert!(h.catalog.document(&id).is_none());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_version_is_not_found() {
        let h = harness();
        let err = h.versions.delete("nope", "1.0").await.unwrap_err();
        assert!(matches!(err, DocError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_download_returns_bytes() {
        let h = harness();
        let placed = h
            .versions
            .create_in(Target::NewDocument(new_doc()), "1.0", b"one".to_vec(), meta())
            .unwrap();
        let id = placed.document_id.clone();
        h.versions.create(&id, "1.1", b"two".to_vec(), meta()).unwrap();
        h.versions.create(&id, "1.2", b"three".to_vec(), meta()).unwrap();
        settle(&h, &id, "1.2").await;

        let page = h.versions.list(&id, &Filters::new(), PageRequest { page: 1, size: 2 }).unwrap();
        assert_eq!(page.total, 3);
        let labels: Vec<_> = page.items.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(labels, vec!["1.2", "1.1"]);

        let bad = Filters::new().with("owner", "me");
        assert!(h.versions.list(&id, &bad, PageRequest { page: 1, size: 2 }).is_err());

        let (_, bytes) = h.versions.download(&id, "1.2").await.unwrap();
        assert_eq!(bytes, b"three");
    }

    #[tokio::test]
    async fn library_target_reuses_document() {
        let h = harness();
        let a = h
            .versions
            .create_in(Target::Library(new_doc()), "1.0", b"one".to_vec(), meta())
            .unwrap();
        let b = h
            .versions
            .create_in(Target::Library(new_doc()), "2.0", b"two".to_vec(), meta())
            .unwrap();
        assert!(a.created_document);
        assert!(!b.created_document);
        assert_eq!(a.document_id, b.document_id);
    }

    #[tokio::test]
    async fn update_and_download_latest() {
        let h = harness();
        let placed = h
            .versions
            .create_in(Target::NewDocument(new_doc()), "1.0", b"one".to_vec(), meta())
            .unwrap();
        let id = placed.document_id.clone();
        assert!(matches!(h.versions.download_latest(&id).await, Err(DocError::NotFound(_))));
        settle(&h, &id, "1.0").await;
        h.versions.create(&id, "2.0", b"two".to_vec(), meta()).unwrap();
        settle(&h, &id, "2.0").await;

        let (current, bytes) = h.versions.download_latest(&id).await.unwrap();
        assert_eq!(current.version, "2.0");
        assert_eq!(bytes, b"two");

        let updated = h
            .versions
            .update(
                &id,
                "1.0",
                VersionUpdate {
                    description: Some("legacy".into()),
                    category: Some("archive".into()),
                },
            )
            .unwrap();
        assert_eq!((updated.description.as_str(), updated.category.as_str()), ("legacy", "archive"));
        assert_eq!(updated.status, VersionStatus::Completed);
        assert_eq!(h.versions.latest(&id).unwrap().version, "2.0");
        let labels: Vec<_> = h.versions.all(&id).unwrap().into_iter().map(|v| v.version).collect();
        assert_eq!(labels, vec!["1.0", "2.0"]);
    }

    /// Store whose writes always fail.
    struct FailingStore;

    #[async_trait]
    impl ContentStore for FailingStore {
        async fn store(&self, _data: &[u8], _hint: Option<&str>) -> Result<ContentRef> {
            Err(DocError::storage("disk full"))
        }

        async fn retrieve(&self, content_ref: &ContentRef) -> Result<Vec<u8>> {
            Err(DocError::storage(format!("no content at {content_ref}")))
        }

        async fn remove(&self, _content_ref: &ContentRef) -> Result<()> {
            Ok(())
        }

        async fn list(&self) -> Result<Vec<ContentRef>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn storage_failure_fails_version_with_reason() {
        let h = harness_over(Arc::new(FailingStore), Arc::new(MemoryStorage::new()));
        let mut rx = h.events.subscribe();
        let placed = h
            .versions
            .create_in(Target::NewDocument(new_doc()), "1.0", b"# Intro".to_vec(), meta())
            .unwrap();
        let v = settle(&h, &placed.document_id, "1.0").await;
        assert_eq!(v.status, VersionStatus::Failed);
        assert!(v.failure_reason.unwrap().contains("disk full"));
        assert!(v.content_ref.is_none());
        assert_eq!(h.catalog.document(&placed.document_id).unwrap().current_version, None);
        assert!(matches!(
            rx.recv().await.unwrap(),
            LifecycleEvent::VersionFailed { reason, .. } if reason.contains("disk full")
        ));
    }

    /// Store whose writes wait for the test to release them.
    struct HeldStore {
        inner: Arc<MemoryStorage>,
        entered: Notify,
        release: Notify,
        stored: AtomicUsize,
    }

    #[async_trait]
    impl ContentStore for HeldStore {
        async fn store(&self, data: &[u8], hint: Option<&str>) -> Result<ContentRef> {
            self.entered.notify_one();
            self.release.notified().await;
            let content_ref = self.inner.store(data, hint).await?;
            self.stored.fetch_add(1, Ordering::SeqCst);
            Ok(content_ref)
        }

        async fn retrieve(&self, content_ref: &ContentRef) -> Result<Vec<u8>> {
            self.inner.retrieve(content_ref).await
        }

        async fn remove(&self, content_ref: &ContentRef) -> Result<()> {
            self.inner.remove(content_ref).await
        }

        async fn list(&self) -> Result<Vec<ContentRef>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn delete_during_processing_discards_late_content() {
        let blobs = Arc::new(MemoryStorage::new());
        let held = Arc::new(HeldStore {
            inner: blobs.clone(),
            entered: Notify::new(),
            release: Notify::new(),
            stored: AtomicUsize::new(0),
        });
        let h = harness_over(held.clone(), blobs.clone());
        let placed = h
            .versions
            .create_in(Target::NewDocument(new_doc()), "1.0", b"# Intro".to_vec(), meta())
            .unwrap();
        held.entered.notified().await;
        assert_eq!(
            h.versions.get(&placed.document_id, "1.0").unwrap().status,
            VersionStatus::Processing
        );

        let deletion = h.versions.delete(&placed.document_id, "1.0").await.unwrap();
        assert!(deletion.document_removed);
        assert!(deletion.orphaned_content.is_none());

        held.release.notify_one();
        for _ in 0..200 {
            if held.stored.load(Ordering::SeqCst) == 1 && blobs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(held.stored.load(Ordering::SeqCst), 1);
        assert!(blobs.is_empty());
        assert!(h.catalog.document(&placed.document_id).is_none());
    }
}
