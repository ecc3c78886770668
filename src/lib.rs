#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod config;
pub mod docs;
pub mod error;
pub mod gateway;
pub mod logging;

pub use config::Config;
pub use docs::DocumentService;
pub use error::{DocError, ErrorKind};

use anyhow::{Context, Result};
use std::sync::Arc;

use docs::{FileStorage, SqliteIndexBackend, SqliteRecordStore};

/// Open the persistent stores named by `config` and wire the service.
///
/// Documents, versions and index entries saved by an earlier run are loaded
/// back. Postings and blobs that none of them refer to are then removed.
pub async fn open_service(config: &Config) -> Result<DocumentService> {
    let content_dir = config.storage.content_dir();
    let store = FileStorage::new(&content_dir.to_string_lossy())
        .with_context(|| format!("failed to open content store at {}", content_dir.display()))?;
    let index_db = config.storage.index_db();
    let backend = SqliteIndexBackend::open(&index_db)
        .with_context(|| format!("failed to open index database {}", index_db.display()))?;
    let catalog_db = config.storage.catalog_db();
    let records = SqliteRecordStore::open(&catalog_db)
        .with_context(|| format!("failed to open catalog database {}", catalog_db.display()))?;

    let service = DocumentService::open(
        Arc::new(store),
        Arc::new(backend),
        Arc::new(records),
        config.service_settings(),
    )
    .context("failed to load catalog")?;
    let reconciled = service.reconcile().await.context("failed to reconcile stored data")?;
    let (documents, versions) = service.registry.counts();
    tracing::info!(
        data_dir = %config.storage.data_path().display(),
        documents,
        versions,
        purged_postings = reconciled.postings,
        purged_blobs = reconciled.blobs,
        scorer = service.search.scorer_name(),
        "document service ready"
    );
    Ok(service)
}
