//! Index Coordinator: one search index entry per (document, version) pair.
//!
//! Builds run in the background. A per-pair lock serializes starting a build,
//! committing its result and retiring the pair, so a build that finishes after
//! its version was deleted finds nothing to commit to and is discarded.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backend::IndexBackend;
use super::catalog::Catalog;
use super::events::{EventBus, LifecycleEvent};
use super::extract::{extract_text, snippet, DEFAULT_MAX_TEXT_LEN};
use super::records::RecordStore;
use super::schema::{IndexEntry, IndexKey, IndexStatus, IndexSummary, Version, VersionStatus};
use super::storage::ContentStore;
use super::tokenizer::tokenize;
use crate::error::{DocError, Result};

pub const DEFAULT_SNIPPET_LEN: usize = 200;

/// Lazily created mutex per key. Unused mutexes are dropped again.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<IndexKey, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn with<T>(&self, key: &IndexKey, f: impl FnOnce() -> T) -> T {
        let lock = self.locks.lock().entry(key.clone()).or_default().clone();
        let out = {
            let _guard = lock.lock();
            f()
        };
        let mut locks = self.locks.lock();
        // Only the map and this call still hold it.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
        out
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexSettings {
    pub snippet_len: usize,
    pub max_text_len: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            snippet_len: DEFAULT_SNIPPET_LEN,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        }
    }
}

struct Slot {
    entry: IndexEntry,
    /// Instance of the version this entry was built from.
    version_uid: u64,
}

struct BuildOutput {
    tokens: Vec<String>,
    snippet: String,
}

pub struct IndexCoordinator {
    catalog: Arc<Catalog>,
    store: Arc<dyn ContentStore>,
    backend: Arc<dyn IndexBackend>,
    records: Option<Arc<dyn RecordStore>>,
    entries: RwLock<HashMap<IndexKey, Slot>>,
    locks: KeyedLocks,
    tickets: AtomicU64,
    settings: IndexSettings,
}

impl IndexCoordinator {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<dyn ContentStore>,
        backend: Arc<dyn IndexBackend>,
        settings: IndexSettings,
    ) -> Self {
        Self {
            catalog,
            store,
            backend,
            records: None,
            entries: RwLock::new(HashMap::new()),
            locks: KeyedLocks::default(),
            tickets: AtomicU64::new(0),
            settings,
        }
    }

    /// Keep finished entries in `records` as well.
    pub fn with_records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    /// Load finished entries saved by an earlier run.
    ///
    /// Entries whose version is gone, was re-created, or never completed are
    /// dropped from the records instead. Returns how many were restored.
    pub fn restore(&self) -> Result<usize> {
        let Some(records) = self.records.as_deref() else {
            return Ok(0);
        };
        let mut restored = 0;
        for (entry, version_uid) in records.load()?.index_entries {
            let key = entry.key();
            let valid = matches!(entry.status, IndexStatus::Ready | IndexStatus::Failed)
                && self
                    .catalog
                    .version(&key)
                    .is_some_and(|v| v.uid == version_uid && v.status == VersionStatus::Completed);
            if !valid {
                records.remove_index_entry(&key)?;
                continue;
            }
            self.entries.write().insert(key, Slot { entry, version_uid });
            restored += 1;
        }
        tracing::debug!(restored, "index entries restored");
        Ok(restored)
    }

    pub fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Schedule a build for a completed version and return the `building` entry.
    pub fn build_index(self: &Arc<Self>, document_id: &str, version: &str) -> Result<IndexEntry> {
        let key = IndexKey::new(document_id, version);
        let (entry, target) = self.locks.with(&key, || self.begin_build(&key))?;

        tracing::debug!(document_id, version, status = %IndexStatus::Building, "index build scheduled");
        let coordinator = Arc::clone(self);
        let ticket = entry.ticket;
        tokio::spawn(async move {
            coordinator.run_build(target, ticket).await;
        });
        Ok(entry)
    }

    fn begin_build(&self, key: &IndexKey) -> Result<(IndexEntry, Version)> {
        let target = self
            .catalog
            .version(key)
            .ok_or_else(|| DocError::version_not_found(&key.document_id, &key.version))?;
        if target.status != VersionStatus::Completed {
            return Err(DocError::VersionNotReady {
                document_id: key.document_id.clone(),
                version: key.version.clone(),
                status: target.status.to_string(),
            });
        }

        let mut entries = self.entries.write();
        if entries
            .get(key)
            .is_some_and(|slot| slot.entry.status == IndexStatus::Building)
        {
            return Err(DocError::BuildInProgress {
                document_id: key.document_id.clone(),
                version: key.version.clone(),
            });
        }

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entry = entries
            .get(key)
            .map(|slot| slot.entry.clone())
            .unwrap_or_else(|| IndexEntry::absent(key));
        entry.status = IndexStatus::Building;
        entry.error = None;
        entry.ticket = ticket;
        entries.insert(
            key.clone(),
            Slot {
                entry: entry.clone(),
                version_uid: target.uid,
            },
        );
        Ok((entry, target))
    }

    async fn run_build(&self, target: Version, ticket: u64) {
        let key = target.key();
        let output = self.produce(&target).await;
        self.locks.with(&key, || self.commit(&key, target.uid, ticket, output));
    }

    async fn produce(&self, target: &Version) -> Result<BuildOutput> {
        let content_ref = target
            .content_ref
            .clone()
            .ok_or_else(|| DocError::storage(format!("version {} has no stored content", target.key())))?;
        let bytes = self.store.retrieve(&content_ref).await?;
        let doc_type = target.doc_type;
        let settings = self.settings;

        tokio::task::spawn_blocking(move || {
            let text = extract_text(&bytes, doc_type, settings.max_text_len)?;
            let tokens = tokenize(&text);
            if tokens.is_empty() {
                return Err(DocError::validation("no indexable terms in content"));
            }
            Ok(BuildOutput {
                tokens,
                snippet: snippet(&text, settings.snippet_len),
            })
        })
        .await
        .map_err(|e| DocError::index_backend(format!("index build task aborted: {e}")))?
    }

    fn commit(&self, key: &IndexKey, version_uid: u64, ticket: u64, output: Result<BuildOutput>) {
        let current = self
            .entries
            .read()
            .get(key)
            .map(|slot| (slot.entry.ticket, slot.version_uid));
        if current != Some((ticket, version_uid)) {
            tracing::debug!(%key, "index build superseded or entry removed; discarding result");
            return;
        }
        let still_exists = self
            .catalog
            .version(key)
            .is_some_and(|v| v.uid == version_uid);
        if !still_exists {
            self.entries.write().remove(key);
            tracing::debug!(%key, "version deleted during index build; discarding result");
            return;
        }

        let result = output.and_then(|out| {
            let terms = self.backend.write(key, &out.tokens)?;
            Ok((terms, out))
        });

        let Some(mut entry) = self.entries.read().get(key).map(|slot| slot.entry.clone()) else {
            return;
        };
        match result {
            Ok((terms, out)) => {
                entry.status = IndexStatus::Ready;
                entry.built_at = Some(Utc::now());
                entry.term_count = terms;
                entry.token_count = out.tokens.len();
                entry.snippet = Some(out.snippet);
                entry.error = None;
            }
            Err(e) => {
                entry.status = IndexStatus::Failed;
                entry.error = Some(e.to_string());
            }
        }
        if let Some(records) = self.records.as_deref() {
            if let Err(e) = records.save_index_entry(&entry, version_uid) {
                entry.status = IndexStatus::Failed;
                entry.error = Some(e.to_string());
            }
        }

        match entry.status {
            IndexStatus::Ready => {
                tracing::debug!(%key, status = %IndexStatus::Ready, terms = entry.term_count, "index build finished");
            }
            _ => {
                let reason = entry.error.as_deref().unwrap_or_default();
                tracing::warn!(%key, status = %IndexStatus::Failed, reason, "index build failed");
            }
        }
        if let Some(slot) = self.entries.write().get_mut(key) {
            slot.entry = entry;
        }
    }

    /// Status of one pair; `absent` when it was never built or was deleted.
    pub fn get_status(&self, document_id: &str, version: &str) -> IndexEntry {
        let key = IndexKey::new(document_id, version);
        self.entries
            .read()
            .get(&key)
            .map(|slot| slot.entry.clone())
            .unwrap_or_else(|| IndexEntry::absent(&key))
    }

    /// Remove one pair's entry, or every entry of the document when `version` is `None`.
    ///
    /// Missing entries are a no-op. Returns the keys whose entries were removed.
    pub fn delete_index(&self, document_id: &str, version: Option<&str>) -> Result<Vec<IndexKey>> {
        let keys: Vec<IndexKey> = match version {
            Some(v) => vec![IndexKey::new(document_id, v)],
            None => {
                let mut keys: Vec<IndexKey> = self
                    .entries
                    .read()
                    .keys()
                    .filter(|k| k.document_id == document_id)
                    .cloned()
                    .collect();
                keys.sort();
                keys
            }
        };

        let mut removed = Vec::new();
        for key in keys {
            if self.locks.with(&key, || self.drop_entry(&key))? {
                removed.push(key);
            }
        }
        Ok(removed)
    }

    fn drop_entry(&self, key: &IndexKey) -> Result<bool> {
        if !self.entries.read().contains_key(key) {
            return Ok(false);
        }
        if let Some(records) = self.records.as_deref() {
            records.remove_index_entry(key)?;
        }
        self.backend.remove(key)?;
        self.entries.write().remove(key);
        tracing::debug!(%key, status = %IndexStatus::Absent, "index entry removed");
        Ok(true)
    }

    /// Remove the pair's index, then run `then` while still holding the pair lock.
    ///
    /// A backend failure aborts before `then` runs.
    pub fn retire<T>(&self, key: &IndexKey, then: impl FnOnce() -> Result<T>) -> Result<T> {
        self.locks.with(key, || {
            self.drop_entry(key)?;
            then()
        })
    }

    pub fn index_summary(&self, document_id: &str) -> Result<IndexSummary> {
        let versions = self
            .catalog
            .versions(document_id)
            .ok_or_else(|| DocError::document_not_found(document_id))?;
        let entries: Vec<IndexEntry> = versions
            .iter()
            .map(|v| self.get_status(&v.document_id, &v.version))
            .collect();
        let total = entries.len();
        let indexed = entries.iter().filter(|e| e.status == IndexStatus::Ready).count();
        let progress = if total == 0 {
            0.0
        } else {
            indexed as f64 * 100.0 / total as f64
        };
        Ok(IndexSummary {
            document_id: document_id.to_string(),
            total,
            indexed,
            progress,
            versions: entries,
        })
    }

    /// Schedule a build for every completed version whose index is absent or failed.
    pub fn build_missing(self: &Arc<Self>) -> Vec<IndexKey> {
        let mut candidates: Vec<Version> = self
            .catalog
            .all_versions()
            .into_iter()
            .filter(|v| v.status == VersionStatus::Completed)
            .collect();
        candidates.sort_by_key(|v| v.seq);

        let mut scheduled = Vec::new();
        for v in candidates {
            let status = self.get_status(&v.document_id, &v.version).status;
            if !matches!(status, IndexStatus::Absent | IndexStatus::Failed) {
                continue;
            }
            match self.build_index(&v.document_id, &v.version) {
                Ok(_) => scheduled.push(v.key()),
                Err(DocError::BuildInProgress { .. }) => {}
                Err(e) => tracing::warn!(key = %v.key(), error = %e, "could not schedule index build"),
            }
        }
        tracing::info!(scheduled = scheduled.len(), "missing index builds scheduled");
        scheduled
    }

    /// Entries currently `ready`.
    pub fn ready_entries(&self) -> Vec<IndexEntry> {
        self.entries
            .read()
            .values()
            .filter(|slot| slot.entry.status == IndexStatus::Ready)
            .map(|slot| slot.entry.clone())
            .collect()
    }

    pub fn count_by_status(&self) -> HashMap<IndexStatus, usize> {
        let mut counts = HashMap::new();
        for slot in self.entries.read().values() {
            *counts.entry(slot.entry.status).or_insert(0) += 1;
        }
        counts
    }

    /// Drop backend postings that no `ready` entry accounts for.
    pub fn reconcile(&self) -> Result<usize> {
        let mut purged = 0;
        for key in self.backend.keys()? {
            let known = self
                .entries
                .read()
                .get(&key)
                .is_some_and(|slot| slot.entry.status == IndexStatus::Ready);
            if !known {
                self.backend.remove(&key)?;
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(purged, "removed stale index postings");
        }
        Ok(purged)
    }

    /// Build an index whenever a version becomes ready, until `cancel` fires.
    pub fn spawn_auto_indexer(self: &Arc<Self>, events: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(LifecycleEvent::VersionReady { key }) => {
                            match coordinator.build_index(&key.document_id, &key.version) {
                                Ok(_) | Err(DocError::BuildInProgress { .. }) => {}
                                Err(e) => tracing::warn!(%key, error = %e, "auto index build not scheduled"),
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "auto indexer lagged; run build-missing to catch up");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("auto indexer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::backend::MemoryIndexBackend;
    use crate::docs::catalog::{NewDocument, Transition};
    use crate::docs::records::SqliteRecordStore;
    use crate::docs::schema::{ContentRef, DocumentType, VersionMetadata};
    use crate::docs::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Harness {
        catalog: Arc<Catalog>,
        store: Arc<MemoryStorage>,
        backend: Arc<MemoryIndexBackend>,
        index: Arc<IndexCoordinator>,
    }

    fn harness() -> Harness {
        let catalog = Arc::new(Catalog::new());
        let store = Arc::new(MemoryStorage::new());
        let backend = Arc::new(MemoryIndexBackend::new());
        let index = Arc::new(IndexCoordinator::new(
            catalog.clone(),
            store.clone(),
            backend.clone(),
            IndexSettings::default(),
        ));
        Harness {
            catalog,
            store,
            backend,
            index,
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

    async fn completed_version(h: &Harness, text: &str) -> Version {
        let placed = h
            .catalog
            .create_document(new_doc(), "1.0", &VersionMetadata::new(DocumentType::Markdown))
            .unwrap();
        let v = placed.version;
        let content_ref = h.store.store(text.as_bytes(), Some("guide.md")).await.unwrap();
        h.catalog
            .transition(&v.key(), v.uid, Transition::to(VersionStatus::Processing))
            .unwrap();
        h.catalog
            .transition(
                &v.key(),
                v.uid,
                Transition {
                    content_ref: Some(content_ref),
                    ..Transition::to(VersionStatus::Completed)
                },
            )
            .unwrap()
    }

    async fn wait_for(index: &IndexCoordinator, key: &IndexKey, wanted: IndexStatus) -> IndexEntry {
        for _ in 0..200 {
            let entry = index.get_status(&key.document_id, &key.version);
            if entry.status == wanted {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("index for {key} never reached {wanted}");
    }

    #[tokio::test]
    async fn build_moves_to_ready() {
        let h = harness();
        let v = completed_version(&h, "alpha beta gamma beta").await;
        assert_eq!(h.index.get_status(&v.document_id, "1.0").status, IndexStatus::Absent);

        let entry = h.index.build_index(&v.document_id, "1.0").unwrap();
        assert_eq!(entry.status, IndexStatus::Building);

        let ready = wait_for(&h.index, &v.key(), IndexStatus::Ready).await;
        assert_eq!(ready.term_count, 3);
        assert_eq!(ready.token_count, 4);
        assert!(ready.built_at.is_some());
        assert_eq!(ready.snippet.as_deref(), Some("alpha beta gamma beta"));
        assert_eq!(h.backend.keys().unwrap(), vec![v.key()]);
    }

    #[tokio::test]
    async fn unfinished_versions_are_not_ready() {
        let h = harness();
        let placed = h
            .catalog
            .create_document(new_doc(), "1.0", &VersionMetadata::new(DocumentType::Markdown))
            .unwrap();
        let err = h.index.build_index(&placed.document_id, "1.0").unwrap_err();
        assert!(matches!(err, DocError::VersionNotReady { .. }));
        let err = h.index.build_index(&placed.document_id, "9.9").unwrap_err();
        assert!(matches!(err, DocError::NotFound(_)));
        assert_eq!(h.index.get_status(&placed.document_id, "1.0").status, IndexStatus::Absent);
    }

    #[tokio::test]
    async fn failed_build_retains_reason_and_can_retry() {
        let h = harness();
        let v = completed_version(&h, "the and of").await;
        h.index.build_index(&v.document_id, "1.0").unwrap();
        let failed = wait_for(&h.index, &v.key(), IndexStatus::Failed).await;
        assert!(failed.error.unwrap().contains("no indexable terms"));
        assert!(h.backend.keys().unwrap().is_empty());

        // a retry is a fresh build
        let again = h.index.build_index(&v.document_id, "1.0").unwrap();
        assert_eq!(again.status, IndexStatus::Building);
        wait_for(&h.index, &v.key(), IndexStatus::Failed).await;
    }

    struct GatedStore {
        inner: Arc<MemoryStorage>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ContentStore for GatedStore {
        async fn store(&self, data: &[u8], hint: Option<&str>) -> Result<ContentRef> {
            self.inner.store(data, hint).await
        }

        async fn retrieve(&self, content_ref: &ContentRef) -> Result<Vec<u8>> {
            self.gate.notified().await;
            self.inner.retrieve(content_ref).await
        }

        async fn remove(&self, content_ref: &ContentRef) -> Result<()> {
            self.inner.remove(content_ref).await
        }

        async fn list(&self) -> Result<Vec<ContentRef>> {
            self.inner.list().await
        }
    }

    fn gated_harness() -> (Harness, Arc<Notify>, Arc<IndexCoordinator>) {
        let h = harness();
        let gate = Arc::new(Notify::new());
        let gated = Arc::new(GatedStore {
            inner: h.store.clone(),
            gate: gate.clone(),
        });
        let index = Arc::new(IndexCoordinator::new(
            h.catalog.clone(),
            gated.clone(),
            h.backend.clone(),
            IndexSettings::default(),
        ));
        (h, gate, index)
    }

    #[tokio::test]
    async fn concurrent_builds_allow_one_in_flight() {
        let (h, gate, index) = gated_harness();
        let v = completed_version(&h, "alpha beta").await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let index = index.clone();
            let id = v.document_id.clone();
            tasks.push(tokio::spawn(async move { index.build_index(&id, "1.0") }));
        }
        let mut started = 0;
        let mut in_progress = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => started += 1,
                Err(DocError::BuildInProgress { .. }) => in_progress += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(started, 1);
        assert_eq!(in_progress, 15);
        assert_eq!(index.count_by_status().get(&IndexStatus::Building), Some(&1));
        gate.notify_one();
    }

    #[tokio::test]
    async fn build_finishing_after_delete_is_discarded() {
        let (h, gate, index) = gated_harness();
        let v = completed_version(&h, "alpha beta").await;
        index.build_index(&v.document_id, "1.0").unwrap();

        index
            .retire(&v.key(), || h.catalog.remove_version(&v.key()))
            .unwrap();
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(index.get_status(&v.document_id, "1.0").status, IndexStatus::Absent);
        assert!(h.backend.keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_index_without_version_clears_document() {
        let h = harness();
        let v = completed_version(&h, "alpha").await;
        let v2 = h
            .catalog
            .add_version(&v.document_id, "2.0", &VersionMetadata::new(DocumentType::Markdown))
            .unwrap();
        let content_ref = h.store.store(b"beta", None).await.unwrap();
        h.catalog
            .transition(&v2.key(), v2.uid, Transition::to(VersionStatus::Processing))
            .unwrap();
        h.catalog
            .transition(
                &v2.key(),
                v2.uid,
                Transition {
                    content_ref: Some(content_ref),
                    ..Transition::to(VersionStatus::Completed)
                },
            )
            .unwrap();

        h.index.build_index(&v.document_id, "1.0").unwrap();
        h.index.build_index(&v.document_id, "2.0").unwrap();
        wait_for(&h.index, &v.key(), IndexStatus::Ready).await;
        wait_for(&h.index, &v2.key(), IndexStatus::Ready).await;

        let summary = h.index.index_summary(&v.document_id).unwrap();
        assert_eq!((summary.total, summary.indexed), (2, 2));
        assert_eq!(summary.progress, 100.0);

        let removed = h.index.delete_index(&v.document_id, None).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(h.backend.keys().unwrap().is_empty());
        // versions survive
        assert_eq!(h.catalog.versions(&v.document_id).unwrap().len(), 2);
        // deleting again is a no-op
        assert!(h.index.delete_index(&v.document_id, Some("1.0")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn build_missing_and_auto_indexer() {
        let h = harness();
        let v = completed_version(&h, "alpha").await;
        let scheduled = h.index.build_missing();
        assert_eq!(scheduled, vec![v.key()]);
        wait_for(&h.index, &v.key(), IndexStatus::Ready).await;
        assert!(h.index.build_missing().is_empty());

        let events = EventBus::new(16);
        let cancel = CancellationToken::new();
        let handle = h.index.spawn_auto_indexer(&events, cancel.clone());
        h.index.delete_index(&v.document_id, None).unwrap();
        events.publish(LifecycleEvent::VersionReady { key: v.key() });
        wait_for(&h.index, &v.key(), IndexStatus::Ready).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_purges_unknown_postings() {
        let h = harness();
        h.backend
            .write(&IndexKey::new("ghost", "1.0"), &["stale".to_string()])
            .unwrap();
        assert_eq!(h.index.reconcile().unwrap(), 1);
        assert!(h.backend.keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn finished_entries_survive_restart() {
        let h = harness();
        let records: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::in_memory().unwrap());
        let catalog = Arc::new(Catalog::persistent(records.clone()).unwrap());
        let index = Arc::new(
            IndexCoordinator::new(catalog.clone(), h.store.clone(), h.backend.clone(), IndexSettings::default())
                .with_records(records.clone()),
        );
        let placed = catalog
            .create_document(new_doc(), "1.0", &VersionMetadata::new(DocumentType::Markdown))
            .unwrap();
        let v = placed.version;
        let content_ref = h.store.store(b"alpha beta", None).await.unwrap();
        catalog
            .transition(&v.key(), v.uid, Transition::to(VersionStatus::Processing))
            .unwrap();
        catalog
            .transition(
                &v.key(),
                v.uid,
                Transition {
                    content_ref: Some(content_ref),
                    ..Transition::to(VersionStatus::Completed)
                },
            )
            .unwrap();
        index.build_index(&v.document_id, "1.0").unwrap();
        wait_for(&index, &v.key(), IndexStatus::Ready).await;
        h.backend
            .write(&IndexKey::new("ghost", "1.0"), &["stale".to_string()])
            .unwrap();
        drop(index);

        let reopened = Arc::new(Catalog::persistent(records.clone()).unwrap());
        let index = IndexCoordinator::new(reopened, h.store.clone(), h.backend.clone(), IndexSettings::default())
            .with_records(records.clone());
        assert_eq!(index.restore().unwrap(), 1);
        let entry = index.get_status(&v.document_id, "1.0");
        assert_eq!(entry.status, IndexStatus::Ready);
        assert_eq!(entry.term_count, 2);

        // only the posting no entry accounts for goes away
        assert_eq!(index.reconcile().unwrap(), 1);
        assert_eq!(h.backend.keys().unwrap(), vec![v.key()]);

        index.delete_index(&v.document_id, None).unwrap();
        assert!(records.load().unwrap().index_entries.is_empty());
    }

    #[test]
    fn keyed_locks_release_unused_keys() {
        let locks = KeyedLocks::default();
        let key = IndexKey::new("d", "1");
        assert_eq!(locks.with(&key, || 7), 7);
        assert_eq!(locks.len(), 0);
    }
}
