// 📦 Filesystem object store for uploaded plan files
//
// Objects land under a root directory via temp file + rename, so a reader
// never sees a half-written upload.

use crate::error::{StoreError, StoreResult};
use crate::parser::file_extension;
use crate::store::{ObjectStore, StoredObject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Object key for an upload: `{prefix}/{epoch millis}_{random}.{ext}`
///
/// The original filename only contributes its extension; it is kept on the
/// plan record instead.
pub fn object_path(prefix: &str, file_name: &str, now: DateTime<Utc>) -> String {
    let ext = file_extension(file_name).unwrap_or_else(|| "csv".to_string());
    let token = Uuid::new_v4().simple().to_string();
    let prefix = prefix.trim_matches('/');
    let key = format!("{}_{}.{}", now.timestamp_millis(), &token[..8], ext);
    if prefix.is_empty() {
        key
    } else {
        format!("{}/{}", prefix, key)
    }
}

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative object key under the root; no absolute paths, no `..`
    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(path);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || !clean {
            return Err(StoreError::Backend(format!("invalid object path '{}'", path)));
        }
        Ok(self.root.join(relative))
    }

    fn url_for(absolute: &Path) -> String {
        format!("file://{}", absolute.display())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> StoreResult<StoredObject> {
        let absolute = self.resolve(path)?;
        let parent = absolute
            .parent()
            .ok_or_else(|| StoreError::Backend(format!("object path '{}' has no parent", path)))?
            .to_path_buf();
        fs::create_dir_all(&parent).await?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        tracing::debug!(path, bytes = bytes.len(), "stored object");

        Ok(StoredObject {
            path: path.to_string(),
            url: Self::url_for(&absolute),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        let absolute = self.resolve(path)?;
        match fs::remove_file(&absolute).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
