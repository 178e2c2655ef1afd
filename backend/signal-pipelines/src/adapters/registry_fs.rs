use crate::error::{PipelineError, Result};
use crate::store::ArtifactRegistry;
use artifact_schema::{ArtifactRef, Manifest};
use async_trait::async_trait;
use object_store::write_atomic;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Filesystem registry:
/// - `records/<tenant>/<surface>/<type>/<version>.json`, written once
/// - `current/<tenant>/<surface>/manifest.json`, swapped atomically
pub struct FsRegistry {
    base_dir: PathBuf,
    lock: Mutex<()>,
}

impl FsRegistry {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn record_path(&self, artifact_ref: &ArtifactRef) -> PathBuf {
        let key = &artifact_ref.key;
        self.base_dir
            .join("records")
            .join(&key.tenant)
            .join(&key.surface)
            .join(key.artifact_type.as_str())
            .join(format!("{}.json", artifact_ref.version))
    }

    pub fn manifest_path(&self, tenant: &str, surface: &str) -> PathBuf {
        self.base_dir
            .join("current")
            .join(tenant)
            .join(surface)
            .join("manifest.json")
    }
}

#[async_trait]
impl ArtifactRegistry for FsRegistry {
    async fn record(&self, artifact_ref: &ArtifactRef) -> Result<()> {
        if artifact_ref.version.is_empty() {
            return Err(PipelineError::invalid("artifact ref version is required"));
        }
        if artifact_ref.uri.is_empty() {
            return Err(PipelineError::invalid("artifact ref uri is required"));
        }

        let _guard = self.lock.lock().await;
        let path = self.record_path(artifact_ref);
        if tokio::fs::try_exists(&path).await? {
            debug!(version = %artifact_ref.version, "artifact already recorded");
            return Ok(());
        }
        write_atomic(&path, &serde_json::to_vec_pretty(artifact_ref)?).await?;
        Ok(())
    }

    async fn load_manifest(&self, tenant: &str, surface: &str) -> Result<Option<Manifest>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.manifest_path(tenant, surface)).await {
            Ok(raw) => Ok(Some(Manifest::decode(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn swap_manifest(&self, tenant: &str, surface: &str, next: &Manifest) -> Result<()> {
        next.validate()?;
        if next.tenant != tenant || next.surface != surface {
            return Err(PipelineError::invalid(format!(
                "manifest for {}/{} cannot be stored under {}/{}",
                next.tenant, next.surface, tenant, surface
            )));
        }
        let _guard = self.lock.lock().await;
        let path = self.manifest_path(tenant, surface);
        write_atomic(&path, &next.encode()?).await?;
        info!(tenant, surface, entries = next.current.len(), "manifest swapped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artifact_schema::{parse_rfc3339, ArtifactKey, ArtifactType, Window};

    fn artifact_ref(version: &str) -> ArtifactRef {
        ArtifactRef {
            key: ArtifactKey {
                tenant: "t1".into(),
                surface: "home".into(),
                segment: String::new(),
                artifact_type: ArtifactType::Popularity,
            },
            window: Window::day(parse_rfc3339("2024-01-01T00:00:00Z").unwrap()),
            version: version.into(),
            uri: "file:///objects/pop.json".into(),
            built_at: "2024-01-02T00:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn test_record_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path());
        let first = artifact_ref("abc");
        registry.record(&first).await.unwrap();

        let mut dup = first.clone();
        dup.uri = "file:///elsewhere.json".into();
        registry.record(&dup).await.unwrap();

        let stored: ArtifactRef =
            serde_json::from_slice(&std::fs::read(registry.record_path(&first)).unwrap()).unwrap();
        assert_eq!(stored.uri, "file:///objects/pop.json");
    }

    #[tokio::test]
    async fn test_record_requires_version_and_uri() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path());
        assert!(registry.record(&artifact_ref("")).await.is_err());
        let mut no_uri = artifact_ref("abc");
        no_uri.uri.clear();
        assert!(registry.record(&no_uri).await.is_err());
    }

    #[tokio::test]
    async fn test_manifest_swap_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path());
        assert!(registry.load_manifest("t1", "home").await.unwrap().is_none());

        let next = Manifest::new("t1", "home").next(
            &[(ArtifactType::Cooc, "file:///objects/cooc.json".to_string())],
            parse_rfc3339("2024-01-02T00:00:00Z").unwrap(),
        );
        registry.swap_manifest("t1", "home", &next).await.unwrap();

        let loaded = registry.load_manifest("t1", "home").await.unwrap().unwrap();
        assert_eq!(loaded.uri(ArtifactType::Cooc), Some("file:///objects/cooc.json"));
        assert!(registry.swap_manifest("t2", "home", &next).await.is_err());
    }
}
