use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use super::schema::ContentRef;
use crate::error::{DocError, Result};

/// Boundary to wherever version bytes live.
///
/// Every failure surfaces as [`DocError::Storage`].
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Persist `data`; `hint` is the original filename, used for the extension only.
    async fn store(&self, data: &[u8], hint: Option<&str>) -> Result<ContentRef>;

    async fn retrieve(&self, content_ref: &ContentRef) -> Result<Vec<u8>>;

    /// Removing a missing blob is not an error.
    async fn remove(&self, content_ref: &ContentRef) -> Result<()>;

    /// Every blob currently held.
    async fn list(&self) -> Result<Vec<ContentRef>>;
}

/// Stores blobs on disk, sharded by upload date.
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    pub fn new(base_dir: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(base_dir).to_string();
        let base = PathBuf::from(expanded);
        std::fs::create_dir_all(&base).map_err(|e| {
            DocError::storage(format!(
                "failed to create content dir {}: {e}",
                base.display()
            ))
        })?;
        Ok(Self { base_dir: base })
    }

    /// Resolve a reference, refusing anything that escapes the base directory.
    fn resolve(&self, content_ref: &ContentRef) -> Result<PathBuf> {
        let rel = Path::new(content_ref.as_str());
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || content_ref.as_str().is_empty() {
            return Err(DocError::storage(format!(
                "invalid content reference: {content_ref}"
            )));
        }
        Ok(self.base_dir.join(rel))
    }
}

#[async_trait]
impl ContentStore for FileStorage {
    async fn store(&self, data: &[u8], hint: Option<&str>) -> Result<ContentRef> {
        let now = Utc::now();
        let date_dir = now.format("%Y/%m/%d").to_string();
        let abs_dir = self.base_dir.join(&date_dir);
        fs::create_dir_all(&abs_dir)
            .await
            .map_err(|e| DocError::storage(format!("failed to create date directory: {e}")))?;

        let ext = hint
            .and_then(|name| Path::new(name).extension())
            .and_then(|e| e.to_str())
            .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("bin");
        let stored_name = format!("{}.{}", Uuid::new_v4(), ext.to_ascii_lowercase());

        let abs_path = abs_dir.join(&stored_name);
        fs::write(&abs_path, data)
            .await
            .map_err(|e| DocError::storage(format!("failed to write content: {e}")))?;

        Ok(ContentRef(format!("{date_dir}/{stored_name}")))
    }

    async fn retrieve(&self, content_ref: &ContentRef) -> Result<Vec<u8>> {
        let abs = self.resolve(content_ref)?;
        fs::read(&abs)
            .await
            .map_err(|e| DocError::storage(format!("failed to read {content_ref}: {e}")))
    }

    async fn remove(&self, content_ref: &ContentRef) -> Result<()> {
        let abs = self.resolve(content_ref)?;
        match fs::remove_file(&abs).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DocError::storage(format!(
                "failed to delete {content_ref}: {e}"
            ))),
        }
    }

    async fn list(&self) -> Result<Vec<ContentRef>> {
        let mut refs = Vec::new();
        let mut pending = vec![PathBuf::new()];
        while let Some(rel_dir) = pending.pop() {
            let mut dir = fs::read_dir(self.base_dir.join(&rel_dir))
                .await
                .map_err(|e| DocError::storage(format!("failed to list {}: {e}", rel_dir.display())))?;
            while let Some(item) = dir.next_entry().await.map_err(DocError::storage)? {
                let rel = rel_dir.join(item.file_name());
                let file_type = item.file_type().await.map_err(DocError::storage)?;
                if file_type.is_dir() {
                    pending.push(rel);
                } else if file_type.is_file() {
                    let parts: Vec<String> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    refs.push(ContentRef(parts.join("/")));
                }
            }
        }
        refs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(refs)
    }
}

/// Volatile store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryStorage {
    async fn store(&self, data: &[u8], _hint: Option<&str>) -> Result<ContentRef> {
        let key = format!("mem/{}", Uuid::new_v4());
        self.blobs.lock().insert(key.clone(), data.to_vec());
        Ok(ContentRef(key))
    }

    async fn retrieve(&self, content_ref: &ContentRef) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(content_ref.as_str())
            .cloned()
            .ok_or_else(|| DocError::storage(format!("no content at {content_ref}")))
    }

    async fn remove(&self, content_ref: &ContentRef) -> Result<()> {
        self.blobs.lock().remove(content_ref.as_str());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ContentRef>> {
        let mut refs: Vec<ContentRef> = self.blobs.lock().keys().cloned().map(ContentRef).collect();
        refs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_storage_round_trip() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path().to_str().unwrap()).unwrap();

        let content_ref = storage.store(b"# Title\nbody", Some("guide.MD")).await.unwrap();
        assert!(content_ref.as_str().ends_with(".md"));
        assert_eq!(storage.retrieve(&content_ref).await.unwrap(), b"# Title\nbody");

        assert_eq!(storage.list().await.unwrap(), vec![content_ref.clone()]);

        storage.remove(&content_ref).await.unwrap();
        assert!(storage.retrieve(&content_ref).await.is_err());
        assert!(storage.list().await.unwrap().is_empty());
        // second removal is a no-op
        storage.remove(&content_ref).await.unwrap();
    }

    #[tokio::test]
    async fn file_storage_defaults_extension() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path().to_str().unwrap()).unwrap();
        let content_ref = storage.store(b"x", None).await.unwrap();
        assert!(content_ref.as_str().ends_with(".bin"));
    }

    #[tokio::test]
    async fn file_storage_rejects_escaping_refs() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path().to_str().unwrap()).unwrap();
        let err = storage
            .retrieve(&ContentRef("../etc/passwd".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StorageError);
    }

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        let content_ref = storage.store(b"abc", None).await.unwrap();
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.retrieve(&content_ref).await.unwrap(), b"abc");
        storage.remove(&content_ref).await.unwrap();
        assert!(storage.is_empty());
    }
}
