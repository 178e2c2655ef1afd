//! Object access for recsys artifacts
//!
//! - `file://<path>`, `s3://<bucket>/<key>` and bare filesystem paths
//! - Reader/writer traits consumed by the loader and the publisher
//! - Atomic filesystem writes (temp file + rename + directory sync)
//! - `NotFound` is a typed error carrying the uri

mod error;
mod uri;

pub mod fs;
pub mod s3;

pub use error::{ObjectStoreError, Result};
pub use fs::{write_atomic, FsObjectStore};
pub use s3::{S3Config, S3ObjectStore};
pub use uri::ObjectUri;

use async_trait::async_trait;
use std::sync::Arc;

/// Read-only object access by uri
#[async_trait]
pub trait ObjectReader: Send + Sync {
    async fn get(&self, uri: &str) -> Result<Vec<u8>>;
}

/// Object upload; returns the uri of the stored object
#[async_trait]
pub trait ObjectWriter: Send + Sync {
    async fn put(&self, key: &str, content_type: &str, body: Vec<u8>) -> Result<String>;
}

/// Dispatches reads by uri scheme. S3 reads fail unless an S3 store is attached.
#[derive(Clone, Default)]
pub struct RoutingReader {
    s3: Option<Arc<S3ObjectStore>>,
}

impl RoutingReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_s3(mut self, store: Arc<S3ObjectStore>) -> Self {
        self.s3 = Some(store);
        self
    }
}

#[async_trait]
impl ObjectReader for RoutingReader {
    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        match ObjectUri::parse(uri)? {
            ObjectUri::File(_) => fs::read_file_uri(uri).await,
            ObjectUri::S3 { bucket, key } => match &self.s3 {
                Some(store) => store.get_object(&bucket, &key).await,
                None => Err(ObjectStoreError::InvalidUri(format!(
                    "no s3 client configured for {}",
                    uri
                ))),
            },
        }
    }
}

#[async_trait]
impl<T: ObjectReader + ?Sized> ObjectReader for Arc<T> {
    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        (**self).get(uri).await
    }
}

#[async_trait]
impl<T: ObjectWriter + ?Sized> ObjectWriter for Arc<T> {
    async fn put(&self, key: &str, content_type: &str, body: Vec<u8>) -> Result<String> {
        (**self).put(key, content_type, body).await
    }
}
