use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::{BlobStore, StoreConfig, StoreError};

/// Blobs as files under a base directory. A key's `/`-separated segments
/// become nested directories.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(config: &StoreConfig) -> Self {
        let root = match &config.local_data_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from("attachments"),
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a path inside the root, refusing anything that could
    /// leave it.
    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if key.is_empty() || escapes {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(segments.join("/"))
    }
}

fn io_error(op: &str, path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Internal(format!("{op} {}: {e}", path.display()))
}

#[async_trait]
impl BlobStore for LocalStore {
    /// Writes go to a sibling temp file first so readers never see a
    /// partial attachment.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let Some(dir) = path.parent() else {
            return Err(StoreError::InvalidKey(key.to_string()));
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| io_error("mkdir", dir, e))?;

        let mut staging = path.clone().into_os_string();
        staging.push(".partial");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, &data)
            .await
            .map_err(|e| io_error("write", &staging, e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| io_error("rename", &path, e))
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(io_error("delete", &path, e)),
            _ => Ok(()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.path_for(prefix)?];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("list", &dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error("list", &dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error("stat", &path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "partial") {
                    continue;
                } else if let Some(key) = self.key_for(&path) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let dir = self.path_for(prefix)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(io_error("delete", &dir, e)),
            _ => {
                debug!("removed {}", dir.display());
                Ok(())
            }
        }
    }
}
