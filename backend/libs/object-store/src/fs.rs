/// Local filesystem objects
use crate::error::{ObjectStoreError, Result};
use crate::{ObjectReader, ObjectUri, ObjectWriter};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::debug;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Writes `data` to `path` through a sibling temp file and a rename, then syncs the directory.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let uri = path.display().to_string();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ObjectStoreError::io(&uri, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ObjectStoreError::InvalidUri(uri.clone()))?;
    let tmp = dir.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        sync_dir(&dir).await
    }
    .await;

    if let Err(err) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ObjectStoreError::io(uri, err));
    }
    Ok(())
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Filesystem object store rooted at `base_dir`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    base_dir: PathBuf,
}

impl FsObjectStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn absolute(&self, key: &str) -> PathBuf {
        let path = self.base_dir.join(key.trim_start_matches('/'));
        if path.is_absolute() {
            return path;
        }
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path,
        }
    }
}

#[async_trait]
impl ObjectReader for FsObjectStore {
    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        read_file_uri(uri).await
    }
}

#[async_trait]
impl ObjectWriter for FsObjectStore {
    async fn put(&self, key: &str, _content_type: &str, body: Vec<u8>) -> Result<String> {
        let path = self.absolute(key);
        write_atomic(&path, &body).await?;
        let uri = ObjectUri::File(path).to_string();
        debug!(uri = %uri, bytes = body.len(), "object written");
        Ok(uri)
    }
}

pub(crate) async fn read_file_uri(uri: &str) -> Result<Vec<u8>> {
    match ObjectUri::parse(uri)? {
        ObjectUri::File(path) => tokio::fs::read(&path)
            .await
            .map_err(|e| ObjectStoreError::io(uri, e)),
        ObjectUri::S3 { .. } => Err(ObjectStoreError::InvalidUri(format!(
            "filesystem store cannot read {}",
            uri
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        let uri = store
            .put("t1/home/popularity/v1.json", "application/json", b"{}".to_vec())
            .await
            .unwrap();
        assert!(uri.starts_with("file://"));
        assert_eq!(store.get(&uri).await.unwrap(), b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let missing = dir.path().join("nope.json");

        let err = store.get(&missing.display().to_string()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/manifest.json");

        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"two".to_vec());
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
