use crate::error::{ObjectStoreError, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// A parsed object location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectUri {
    File(PathBuf),
    S3 { bucket: String, key: String },
}

impl ObjectUri {
    /// `file://<path>`, `s3://<bucket>/<key>` or a bare filesystem path.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ObjectStoreError::InvalidUri("empty uri".to_string()));
        }
        if let Some(rest) = raw.strip_prefix("file://") {
            if rest.is_empty() {
                return Err(ObjectStoreError::InvalidUri(raw.to_string()));
            }
            return Ok(ObjectUri::File(PathBuf::from(rest)));
        }
        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .ok_or_else(|| ObjectStoreError::InvalidUri(raw.to_string()))?;
            let key = key.trim_start_matches('/');
            if bucket.is_empty() || key.is_empty() {
                return Err(ObjectStoreError::InvalidUri(raw.to_string()));
            }
            return Ok(ObjectUri::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if raw.contains("://") {
            return Err(ObjectStoreError::InvalidUri(raw.to_string()));
        }
        Ok(ObjectUri::File(PathBuf::from(raw)))
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        ObjectUri::File(path.as_ref().to_path_buf())
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectUri::File(path) => write!(f, "file://{}", path.display()),
            ObjectUri::S3 { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
        }
    }
}
