use super::BuiltArtifact;
use crate::error::{PipelineError, Result};
use crate::store::{ArtifactRegistry, ArtifactValidator, Clock};
use artifact_schema::{ArtifactRef, ArtifactType, Manifest};
use object_store::ObjectWriter;
use std::sync::Arc;
use tracing::info;

const CONTENT_TYPE_JSON: &str = "application/json";

/// Uploads blobs, validates what was uploaded, records each ref and swaps
/// the manifest once for the whole batch. Any failure leaves the live
/// manifest untouched.
pub struct PublishArtifacts {
    objects: Arc<dyn ObjectWriter>,
    validator: Arc<dyn ArtifactValidator>,
    registry: Arc<dyn ArtifactRegistry>,
    clock: Arc<dyn Clock>,
}

impl PublishArtifacts {
    pub fn new(
        objects: Arc<dyn ObjectWriter>,
        validator: Arc<dyn ArtifactValidator>,
        registry: Arc<dyn ArtifactRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            objects,
            validator,
            registry,
            clock,
        }
    }

    pub fn object_key(artifact_ref: &ArtifactRef) -> String {
        format!(
            "{}/{}/{}/{}.json",
            artifact_ref.key.tenant,
            artifact_ref.key.surface,
            artifact_ref.key.artifact_type,
            artifact_ref.version
        )
    }

    pub async fn execute(&self, tenant: &str, surface: &str, artifacts: &[BuiltArtifact]) -> Result<Manifest> {
        let start = self.clock.now();
        info!(tenant, surface, artifacts = artifacts.len(), "publish: start");

        let current = self
            .registry
            .load_manifest(tenant, surface)
            .await?
            .unwrap_or_else(|| Manifest::new(tenant, surface));

        let mut updates: Vec<(ArtifactType, String)> = Vec::with_capacity(artifacts.len());
        for built in artifacts {
            let mut artifact_ref = built.artifact_ref.clone();
            if artifact_ref.key.tenant != tenant || artifact_ref.key.surface != surface {
                return Err(PipelineError::invalid(format!(
                    "artifact for {}/{} cannot publish under {}/{}",
                    artifact_ref.key.tenant, artifact_ref.key.surface, tenant, surface
                )));
            }
            artifact_ref.uri = self
                .objects
                .put(&Self::object_key(&artifact_ref), CONTENT_TYPE_JSON, built.blob.clone())
                .await?;
            self.validator.validate_artifact(&artifact_ref, &built.blob)?;
            self.registry.record(&artifact_ref).await?;
            updates.push((artifact_ref.key.artifact_type, artifact_ref.uri));
        }

        let next = current.next(&updates, self.clock.now());
        self.registry.swap_manifest(tenant, surface, &next).await?;
        info!(
            tenant,
            surface,
            published = updates.len(),
            duration_ms = (self.clock.now() - start).num_milliseconds(),
            "publish: done"
        );
        Ok(next)
    }
}
