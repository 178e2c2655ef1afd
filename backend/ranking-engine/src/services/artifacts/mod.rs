//! Manifest and artifact loading with per-type TTL caches
//!
//! Missing objects are not errors: a manifest or artifact that is not found
//! loads as `None` so the engine can treat the signal as absent.

use crate::config::LoaderConfig;
use crate::error::{EngineError, Result};
use artifact_schema::{
    Artifact, ContentSimPayload, CoocPayload, ImplicitPayload, Manifest, Payload,
    PopularityPayload, SessionSeqPayload,
};
use object_store::ObjectReader;
use resilience::with_timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use ttl_cache::TtlCache;

type ArtifactCache<P> = TtlCache<String, Arc<Artifact<P>>>;

#[doc(hidden)]
#[derive(Default)]
pub struct ArtifactCaches {
    popularity: ArtifactCache<PopularityPayload>,
    cooc: ArtifactCache<CoocPayload>,
    implicit: ArtifactCache<ImplicitPayload>,
    content: ArtifactCache<ContentSimPayload>,
    session: ArtifactCache<SessionSeqPayload>,
}

/// Payload types the loader keeps a dedicated cache for.
pub trait CachedPayload: Payload {
    #[doc(hidden)]
    fn cache(caches: &ArtifactCaches) -> &ArtifactCache<Self>;
}

macro_rules! cached_payload {
    ($payload:ty, $field:ident) => {
        impl CachedPayload for $payload {
            fn cache(caches: &ArtifactCaches) -> &ArtifactCache<Self> {
                &caches.$field
            }
        }
    };
}

cached_payload!(PopularityPayload, popularity);
cached_payload!(CoocPayload, cooc);
cached_payload!(ImplicitPayload, implicit);
cached_payload!(ContentSimPayload, content);
cached_payload!(SessionSeqPayload, session);

pub struct ArtifactLoader {
    reader: Arc<dyn ObjectReader>,
    manifest_template: String,
    manifest_ttl: Duration,
    artifact_ttl: Duration,
    max_bytes: u64,
    fetch_timeout: Duration,
    manifests: TtlCache<(String, String), Arc<Manifest>>,
    artifacts: ArtifactCaches,
}

impl ArtifactLoader {
    pub fn new(reader: Arc<dyn ObjectReader>, config: LoaderConfig) -> Self {
        Self {
            reader,
            manifest_template: config.manifest_template.trim().to_string(),
            manifest_ttl: config.manifest_ttl,
            artifact_ttl: config.artifact_ttl,
            max_bytes: config.max_bytes,
            fetch_timeout: config.fetch_timeout,
            manifests: TtlCache::new(),
            artifacts: ArtifactCaches::default(),
        }
    }

    /// Manifest uri for the scope, from the `{tenant}`/`{surface}` template.
    pub fn manifest_uri(&self, tenant: &str, surface: &str) -> Result<String> {
        if self.manifest_template.is_empty() {
            return Err(EngineError::Dependency(
                "manifest template is required".to_string(),
            ));
        }
        Ok(self
            .manifest_template
            .replace("{tenant}", tenant)
            .replace("{surface}", surface))
    }

    pub async fn load_manifest(&self, tenant: &str, surface: &str) -> Result<Option<Arc<Manifest>>> {
        let key = (tenant.to_string(), surface.to_string());
        if let Some(manifest) = self.manifests.get(&key) {
            debug!(tenant, surface, "Manifest cache hit");
            return Ok(Some(manifest));
        }

        let uri = self.manifest_uri(tenant, surface)?;
        let Some(bytes) = self.fetch(&uri).await? else {
            debug!(tenant, surface, uri = %uri, "Manifest not found");
            return Ok(None);
        };
        let manifest = Manifest::decode(&bytes)?;
        if manifest.tenant != tenant || manifest.surface != surface {
            return Err(EngineError::Serialization(format!(
                "manifest tenant/surface mismatch: expected {}/{}, got {}/{}",
                tenant, surface, manifest.tenant, manifest.surface
            )));
        }

        let manifest = Arc::new(manifest);
        if !self.manifest_ttl.is_zero() {
            self.manifests
                .set(key, Arc::clone(&manifest), self.manifest_ttl);
        }
        Ok(Some(manifest))
    }

    /// Loads and type-checks an artifact; `None` for an empty or missing uri.
    pub async fn load<P: CachedPayload>(&self, uri: &str) -> Result<Option<Arc<Artifact<P>>>> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Ok(None);
        }
        let cache = P::cache(&self.artifacts);
        if let Some(artifact) = cache.get(&uri.to_string()) {
            return Ok(Some(artifact));
        }

        let Some(bytes) = self.fetch(uri).await? else {
            debug!(uri, artifact_type = %P::TYPE, "Artifact not found");
            return Ok(None);
        };
        let artifact = Arc::new(Artifact::<P>::decode(&bytes)?);
        debug!(
            uri,
            artifact_type = %P::TYPE,
            rows = artifact.payload.row_count(),
            "Artifact loaded"
        );
        if !self.artifact_ttl.is_zero() {
            cache.set(uri.to_string(), Arc::clone(&artifact), self.artifact_ttl);
        }
        Ok(Some(artifact))
    }

    pub async fn load_popularity(&self, uri: &str) -> Result<Option<Arc<Artifact<PopularityPayload>>>> {
        self.load(uri).await
    }

    pub async fn load_cooc(&self, uri: &str) -> Result<Option<Arc<Artifact<CoocPayload>>>> {
        self.load(uri).await
    }

    pub async fn load_implicit(&self, uri: &str) -> Result<Option<Arc<Artifact<ImplicitPayload>>>> {
        self.load(uri).await
    }

    pub async fn load_content(&self, uri: &str) -> Result<Option<Arc<Artifact<ContentSimPayload>>>> {
        self.load(uri).await
    }

    pub async fn load_session_seq(&self, uri: &str) -> Result<Option<Arc<Artifact<SessionSeqPayload>>>> {
        self.load(uri).await
    }

    /// Drops manifests for the scope (empty matches any) and every cached
    /// artifact, since a manifest swap can repoint any type. Returns the
    /// number of entries removed.
    pub fn invalidate(&self, tenant: &str, surface: &str) -> usize {
        let mut removed = self.manifests.invalidate(|(t, s)| {
            (tenant.is_empty() || t == tenant) && (surface.is_empty() || s == surface)
        });
        removed += self.artifacts.popularity.clear();
        removed += self.artifacts.cooc.clear();
        removed += self.artifacts.implicit.clear();
        removed += self.artifacts.content.clear();
        removed += self.artifacts.session.clear();
        debug!(tenant, surface, removed, "Artifact loader invalidated");
        removed
    }

    async fn fetch(&self, uri: &str) -> Result<Option<Vec<u8>>> {
        let read = if self.fetch_timeout.is_zero() {
            self.reader.get(uri).await
        } else {
            with_timeout(self.fetch_timeout, self.reader.get(uri))
                .await
                .map_err(|e| EngineError::Dependency(format!("{}: {}", uri, e)))?
        };
        match read {
            Ok(bytes) => {
                if self.max_bytes > 0 && bytes.len() as u64 > self.max_bytes {
                    return Err(EngineError::LimitExceeded(format!(
                        "{} is {} bytes, limit {}",
                        uri,
                        bytes.len(),
                        self.max_bytes
                    )));
                }
                Ok(Some(bytes))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
