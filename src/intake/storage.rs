//! Blob storage behind a small capability trait, plus tenant-scoped temp
//! file staging for the pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::intake::sanitize::sanitize_filename;
use crate::models::UploadKind;

/// Blob storage capability set. The pipeline only ever stores, fetches, and
/// deletes whole objects under tenant-prefixed keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Storage key: `<tenant>/<kind>/<YYYY>/<MM>/<uuid>_<sanitized_name>`.
pub fn storage_key(yacht_id: Uuid, kind: UploadKind, file_name: &str, upload_id: Uuid) -> String {
    let now = Utc::now();
    format!(
        "{}/{}/{}/{:02}/{}_{}",
        yacht_id,
        kind.as_str(),
        now.year(),
        now.month(),
        upload_id,
        sanitize_filename(file_name),
    )
}

/// Filesystem-backed blob store rooted at a configured directory.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        // Keys are produced by storage_key; reject anything that tries to
        // climb out of the root anyway.
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            anyhow::bail!("invalid storage key: {key}");
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write blob {key}"))?;
        debug!(key, size = bytes.len(), "Blob stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read blob {key}"))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete blob {key}")),
        }
    }
}

/// Tenant-scoped temp staging under `temp_uploads/<tenant>/<uuid>.<ext>`.
/// The guard removes the file on drop, so both success and error paths
/// release it; the sweeper reclaims anything an aborted process left behind.
pub struct TempStore {
    root: PathBuf,
}

impl TempStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn stage(&self, yacht_id: Uuid, ext: &str, bytes: &[u8]) -> Result<TempFile> {
        let dir = self.root.join(yacht_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.{}", Uuid::new_v4(), ext));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to stage temp file {}", path.display()))?;
        Ok(TempFile { path })
    }

    /// Remove temp files older than `max_age`. Returns how many were
    /// reclaimed; called from the background sweeper task.
    pub async fn sweep(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0usize;
        let mut tenants = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context("failed to read temp root"),
        };
        while let Some(tenant_dir) = tenants.next_entry().await? {
            let mut files = match tokio::fs::read_dir(tenant_dir.path()).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(file) = files.next_entry().await? {
                let Ok(meta) = file.metadata().await else { continue };
                let Ok(modified) = meta.modified() else { continue };
                let age = modified.elapsed().unwrap_or_default();
                if age > max_age && tokio::fs::remove_file(file.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "🧹 Temp sweeper reclaimed stale files");
        }
        Ok(removed)
    }
}

/// Owned temp file, deleted when dropped.
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove temp file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_blob_roundtrip_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let yacht = Uuid::new_v4();
        let key = storage_key(yacht, UploadKind::Receiving, "slip.png", Uuid::new_v4());

        store.put(&key, b"bytes").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"bytes");
        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.is_err());
        // Deleting a missing key is a no-op.
        store.delete(&key).await.unwrap();
    }

    #[test]
    fn test_storage_key_shape() {
        let yacht = Uuid::new_v4();
        let id = Uuid::new_v4();
        let key = storage_key(yacht, UploadKind::ShippingLabel, "../evil name.pdf", id);
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], yacht.to_string());
        assert_eq!(parts[1], "shipping_label");
        assert!(parts[4].starts_with(&id.to_string()));
        assert!(parts[4].ends_with("evil_name.pdf"));
    }

    #[tokio::test]
    async fn test_traversal_key_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(store.put("a/../b", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_temp_file_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let temp = TempStore::new(dir.path());
        let yacht = Uuid::new_v4();
        let path = {
            let file = temp.stage(yacht, "png", b"data").await.unwrap();
            assert!(file.path().exists());
            file.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_sweep_reclaims_only_stale() {
        let dir = TempDir::new().unwrap();
        let temp = TempStore::new(dir.path());
        let yacht = Uuid::new_v4();
        let file = temp.stage(yacht, "png", b"data").await.unwrap();
        // Fresh file survives a 24h-age sweep.
        assert_eq!(temp.sweep(Duration::from_secs(24 * 3600)).await.unwrap(), 0);
        // Zero max-age treats everything as stale.
        assert_eq!(temp.sweep(Duration::ZERO).await.unwrap(), 1);
        assert!(!file.path().exists());
        drop(file);
    }
}
