//! Local filesystem storage implementation.
//!
//! Writes go to a sibling `*.tmp` file which is renamed over the target, so
//! a reader never observes a partially written object. Temp files are never
//! listed.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::BlobStore;

const TMP_SUFFIX: &str = ".tmp";

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root_dir: PathBuf,
}

impl LocalBlobStore {
    /// Create a new store rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(TMP_SUFFIX);
        path.with_file_name(name)
    }

    /// Temp path private to one call, for writers that may race.
    fn unique_tmp_path(path: &Path) -> PathBuf {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(
            ".{}-{}{TMP_SUFFIX}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        path.with_file_name(name)
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(parent, e))?;
        }
        Ok(())
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root_dir).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

fn unavailable(path: &Path, error: std::io::Error) -> AppError {
    AppError::storage(format!("{}: {}", path.display(), error))
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(&path, e)),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let tmp = Self::tmp_path(&path);
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| unavailable(&tmp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| unavailable(&tmp, e))?;
        file.flush().await.map_err(|e| unavailable(&tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| unavailable(&path, e))?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        // Publish a complete file with a no-clobber link so a concurrent
        // reader never sees it empty.
        let tmp = Self::unique_tmp_path(&path);
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| unavailable(&tmp, e))?;
        let written: std::io::Result<()> = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            drop(file);
            tokio::fs::hard_link(&tmp, &path).await
        }
        .await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            log::warn!("Failed to remove {}: {}", tmp.display(), e);
        }

        match written {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(unavailable(&path, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(unavailable(&path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.path(prefix.trim_end_matches('/'))];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(unavailable(&dir, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| unavailable(&dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| unavailable(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if !path.to_string_lossy().ends_with(TMP_SUFFIX) {
                    if let Some(key) = self.key_for(&path) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn location(&self, key: &str) -> String {
        self.path(key).display().to_string()
    }
}
