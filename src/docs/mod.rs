//! Documents, their versions and per-version search indexes.
//!
//! Handles upload, storage, text extraction, index builds and keyword search.

pub mod backend;
pub mod catalog;
pub mod events;
pub mod extract;
pub mod index;
pub mod lifecycle;
pub mod pagination;
pub mod records;
pub mod registry;
pub mod schema;
pub mod scoring;
pub mod search;
pub mod storage;
pub mod tokenizer;

pub use backend::{IndexBackend, MemoryIndexBackend, SqliteIndexBackend};
pub use index::{IndexCoordinator, IndexSettings};
pub use lifecycle::VersionManager;
pub use pagination::{Filters, PageRequest, PageResult, Paginator};
pub use records::{RecordStore, SqliteRecordStore};
pub use registry::Registry;
pub use schema::{Document, IndexEntry, IndexKey, IndexStatus, SearchHit, Version, VersionStatus};
pub use search::{SearchRequest, SearchService};
pub use storage::{ContentStore, FileStorage, MemoryStorage};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use catalog::Catalog;
use events::EventBus;
use scoring::ScorerKind;
use crate::error::Result;

/// Tunables for [`DocumentService`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceSettings {
    pub paginator: Paginator,
    pub index: IndexSettings,
    pub scorer: ScorerKind,
}

/// Counts reported by the health endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ServiceCounts {
    pub documents: usize,
    pub versions: usize,
    pub indexes: HashMap<IndexStatus, usize>,
}

/// What a startup reconcile cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub postings: usize,
    pub blobs: usize,
}

/// All components wired around one catalog, content store and index backend.
pub struct DocumentService {
    pub registry: Registry,
    pub index: Arc<IndexCoordinator>,
    pub search: SearchService,
    pub events: EventBus,
    pub paginator: Paginator,
    catalog: Arc<Catalog>,
    store: Arc<dyn ContentStore>,
}

impl DocumentService {
    /// Service whose catalog lives in memory only.
    pub fn new(store: Arc<dyn ContentStore>, backend: Arc<dyn IndexBackend>, settings: ServiceSettings) -> Self {
        let index = IndexCoordinator::new(Arc::new(Catalog::new()), store.clone(), backend, settings.index);
        Self::assemble(index, store, settings)
    }

    /// Service whose catalog and index entries are kept in `records`,
    /// starting from whatever an earlier run left there.
    pub fn open(
        store: Arc<dyn ContentStore>,
        backend: Arc<dyn IndexBackend>,
        records: Arc<dyn RecordStore>,
        settings: ServiceSettings,
    ) -> Result<Self> {
        let catalog = Arc::new(Catalog::persistent(records.clone())?);
        let index = IndexCoordinator::new(catalog, store.clone(), backend, settings.index).with_records(records);
        index.restore()?;
        Ok(Self::assemble(index, store, settings))
    }

    fn assemble(index: IndexCoordinator, store: Arc<dyn ContentStore>, settings: ServiceSettings) -> Self {
        let catalog = index.catalog().clone();
        let index = Arc::new(index);
        let events = EventBus::default();
        let versions = VersionManager::new(catalog.clone(), store.clone(), index.clone(), events.clone())
            .with_paginator(settings.paginator)
            .with_max_text_len(settings.index.max_text_len);
        let registry = Registry::new(
            catalog.clone(),
            versions,
            index.clone(),
            store.clone(),
            events.clone(),
            settings.paginator,
        );
        let search = SearchService::new(catalog.clone(), index.clone(), settings.scorer.build(), settings.paginator);
        Self {
            registry,
            index,
            search,
            events,
            paginator: settings.paginator,
            catalog,
            store,
        }
    }

    /// Drop index postings and content blobs nothing refers to any more.
    ///
    /// Meant for startup, before uploads are accepted: a blob written by an
    /// in-flight upload is not referenced yet.
    pub async fn reconcile(&self) -> Result<Reconciled> {
        let postings = self.index.reconcile()?;
        let referenced: HashSet<String> = self
            .catalog
            .all_versions()
            .into_iter()
            .filter_map(|v| v.content_ref.map(|r| r.0))
            .collect();
        let mut blobs = 0;
        for content_ref in self.store.list().await? {
            if referenced.contains(content_ref.as_str()) {
                continue;
            }
            self.store.remove(&content_ref).await?;
            blobs += 1;
        }
        if blobs > 0 {
            tracing::info!(blobs, "removed unreferenced content");
        }
        Ok(Reconciled { postings, blobs })
    }

    /// Volatile service for tests and throwaway runs.
    pub fn in_memory(settings: ServiceSettings) -> Self {
        Self::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryIndexBackend::new()),
            settings,
        )
    }

    pub fn versions(&self) -> &VersionManager {
        self.registry.versions()
    }

    /// Build indexes for versions as they complete, until `cancel` fires.
    pub fn start_auto_indexing(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.index.spawn_auto_indexer(&self.events, cancel)
    }

    pub fn counts(&self) -> ServiceCounts {
        let (documents, versions) = self.registry.counts();
        ServiceCounts {
            documents,
            versions,
            indexes: self.index.count_by_status(),
        }
    }
}
