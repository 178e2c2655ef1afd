/// S3-compatible objects
use crate::error::{ObjectStoreError, Result};
use crate::{ObjectReader, ObjectUri, ObjectWriter};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    /// Bucket name
    #[serde(default)]
    pub bucket: String,
    /// Key prefix prepended to every written key
    #[serde(default)]
    pub prefix: String,
    /// AWS region, falls back to the environment
    #[serde(default)]
    pub region: String,
    /// Custom endpoint for S3-compatible stores (minio etc.)
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub force_path_style: bool,
}

impl S3Config {
    /// Load S3 configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            bucket: std::env::var("S3_BUCKET").unwrap_or_default(),
            prefix: std::env::var("S3_PREFIX").unwrap_or_default(),
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: std::env::var("S3_ENDPOINT").unwrap_or_default(),
            force_path_style: std::env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }

    /// Prefix-qualified object key
    pub fn object_key(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", prefix, key)
        }
    }

    pub fn object_uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.object_key(key))
    }
}

/// Shared S3 client wrapper
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Arc<Client>,
    config: S3Config,
}

impl S3ObjectStore {
    pub fn new(client: Arc<Client>, config: S3Config) -> Self {
        Self { client, config }
    }

    /// Create a client from the ambient AWS environment plus `config` overrides.
    pub async fn connect(config: S3Config) -> Self {
        let sdk_config = aws_config::load_from_env().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if !config.region.is_empty() {
            builder = builder.region(aws_sdk_s3::config::Region::new(config.region.clone()));
        }
        if !config.endpoint.is_empty() {
            builder = builder.endpoint_url(config.endpoint.clone());
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());
        Self::new(Arc::new(client), config)
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let uri = format!("s3://{}/{}", bucket, key);
        match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => {
                let body = output.body.collect().await.map_err(|e| ObjectStoreError::S3 {
                    uri: uri.clone(),
                    message: e.to_string(),
                })?;
                Ok(body.into_bytes().to_vec())
            }
            Err(err) => {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    Err(ObjectStoreError::NotFound { uri })
                } else {
                    Err(ObjectStoreError::S3 {
                        uri,
                        message: service.to_string(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl ObjectReader for S3ObjectStore {
    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        match ObjectUri::parse(uri)? {
            ObjectUri::S3 { bucket, key } => self.get_object(&bucket, &key).await,
            ObjectUri::File(_) => Err(ObjectStoreError::InvalidUri(format!(
                "s3 store cannot read {}",
                uri
            ))),
        }
    }
}

#[async_trait]
impl ObjectWriter for S3ObjectStore {
    async fn put(&self, key: &str, content_type: &str, body: Vec<u8>) -> Result<String> {
        let object_key = self.config.object_key(key);
        let uri = self.config.object_uri(key);
        let bytes = body.len();
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| ObjectStoreError::S3 {
                uri: uri.clone(),
                message: e.to_string(),
            })?;
        debug!(uri = %uri, bytes, "object uploaded");
        Ok(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_with_prefix() {
        let config = S3Config {
            bucket: "artifacts".to_string(),
            prefix: "/recsys/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.object_key("/t1/pop.json"), "recsys/t1/pop.json");
        assert_eq!(config.object_uri("t1/pop.json"), "s3://artifacts/recsys/t1/pop.json");
    }

    #[test]
    fn test_object_key_without_prefix() {
        let config = S3Config {
            bucket: "artifacts".to_string(),
            ..Default::default()
        };
        assert_eq!(config.object_key("t1/pop.json"), "t1/pop.json");
    }
}
