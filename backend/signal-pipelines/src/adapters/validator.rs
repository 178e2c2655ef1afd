use crate::error::{PipelineError, Result};
use crate::store::{ArtifactValidator, CanonicalStore};
use artifact_schema::{
    Artifact, ArtifactRef, ArtifactType, ContentSimPayload, CoocPayload, ImplicitPayload, Payload,
    PopularityPayload, SessionSeqPayload, UserItems,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Caps checked by [`BuiltinValidator`]; zero disables a check.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatorOptions {
    pub min_events: usize,
    pub max_events: usize,
    pub max_distinct_items: usize,
    pub max_distinct_sessions: usize,
    pub max_rows: usize,
    pub max_neighbors: usize,
    pub max_items_per_user: usize,
}

/// Structural validation for canonical partitions and artifact blobs.
pub struct BuiltinValidator {
    canonical: Arc<dyn CanonicalStore>,
    opts: ValidatorOptions,
}

impl BuiltinValidator {
    pub fn new(canonical: Arc<dyn CanonicalStore>, opts: ValidatorOptions) -> Self {
        Self { canonical, opts }
    }

    fn check<P: Payload + RowChecks>(&self, artifact_ref: &ArtifactRef, blob: &[u8]) -> Result<()> {
        let artifact: Artifact<P> = Artifact::decode(blob)
            .map_err(|e| PipelineError::validation(format!("invalid {} artifact: {}", P::TYPE, e)))?;

        if artifact.build.version != artifact_ref.version {
            return Err(PipelineError::validation(format!(
                "artifact version mismatch: ref={} payload={}",
                artifact_ref.version, artifact.build.version
            )));
        }
        let key = &artifact_ref.key;
        if artifact.tenant != key.tenant || artifact.surface != key.surface || artifact.segment != key.segment {
            return Err(PipelineError::validation(format!(
                "artifact key mismatch: ref={}/{}/{}",
                key.tenant, key.surface, key.segment
            )));
        }
        artifact.window.validate()?;
        if artifact.window != artifact_ref.window {
            return Err(PipelineError::validation("artifact window mismatch"));
        }
        if self.opts.max_rows > 0 && artifact.payload.row_count() > self.opts.max_rows {
            return Err(PipelineError::validation(format!(
                "{} rows exceed max: {} > {}",
                P::TYPE,
                artifact.payload.row_count(),
                self.opts.max_rows
            )));
        }
        artifact.payload.check_rows(&self.opts)?;

        let computed = artifact.compute_version()?;
        if computed != artifact_ref.version {
            return Err(PipelineError::validation(format!(
                "{} version hash mismatch: computed={} ref={}",
                P::TYPE,
                computed,
                artifact_ref.version
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactValidator for BuiltinValidator {
    async fn validate_canonical(
        &self,
        tenant: &str,
        surface: &str,
        window: artifact_schema::Window,
    ) -> Result<()> {
        window
            .validate()
            .map_err(|e| PipelineError::invalid(format!("invalid window: {}", e)))?;

        let mut stream = self.canonical.read_exposure_events(tenant, surface, window).await?;
        let mut count = 0usize;
        let mut items: HashSet<String> = HashSet::new();
        let mut sessions: HashSet<String> = HashSet::new();
        while let Some(event) = stream.recv().await {
            let event = event.map_err(|e| match e {
                PipelineError::ValidationFailed(msg) => PipelineError::ValidationFailed(msg),
                other => PipelineError::Dependency(format!("read canonical events: {}", other)),
            })?;
            event
                .validate()
                .map_err(|e| PipelineError::validation(format!("invalid canonical event: {}", e)))?;
            if !window.contains(event.ts) {
                return Err(PipelineError::validation(format!(
                    "canonical event timestamp outside window: ts={}",
                    artifact_schema::format_rfc3339(&event.ts)
                )));
            }
            count += 1;
            if self.opts.max_events > 0 && count > self.opts.max_events {
                return Err(PipelineError::validation(format!(
                    "canonical event count exceeds max: events={} max={}",
                    count, self.opts.max_events
                )));
            }
            if self.opts.max_distinct_items > 0
                && items.insert(event.item_id.clone())
                && items.len() > self.opts.max_distinct_items
            {
                return Err(PipelineError::validation(format!(
                    "distinct item count exceeds max: items={} max={}",
                    items.len(),
                    self.opts.max_distinct_items
                )));
            }
            if self.opts.max_distinct_sessions > 0
                && sessions.insert(event.session_id.clone())
                && sessions.len() > self.opts.max_distinct_sessions
            {
                return Err(PipelineError::validation(format!(
                    "distinct session count exceeds max: sessions={} max={}",
                    sessions.len(),
                    self.opts.max_distinct_sessions
                )));
            }
        }
        if self.opts.min_events > 0 && count < self.opts.min_events {
            return Err(PipelineError::validation(format!(
                "canonical event count below min: events={} min={}",
                count, self.opts.min_events
            )));
        }
        Ok(())
    }

    fn validate_artifact(&self, artifact_ref: &ArtifactRef, blob: &[u8]) -> Result<()> {
        if artifact_ref.version.is_empty() {
            return Err(PipelineError::invalid("artifact ref version is required"));
        }
        match artifact_ref.key.artifact_type {
            ArtifactType::Popularity => self.check::<PopularityPayload>(artifact_ref, blob),
            ArtifactType::Cooc => self.check::<CoocPayload>(artifact_ref, blob),
            ArtifactType::Implicit => self.check::<ImplicitPayload>(artifact_ref, blob),
            ArtifactType::ContentSim => self.check::<ContentSimPayload>(artifact_ref, blob),
            ArtifactType::SessionSeq => self.check::<SessionSeqPayload>(artifact_ref, blob),
        }
    }
}

/// Per-type row invariants
trait RowChecks {
    fn check_rows(&self, opts: &ValidatorOptions) -> Result<()>;
}

impl RowChecks for PopularityPayload {
    fn check_rows(&self, _opts: &ValidatorOptions) -> Result<()> {
        for item in &self.items {
            if item.item_id.is_empty() {
                return Err(PipelineError::validation("popularity item_id is empty"));
            }
            if item.count < 0 {
                return Err(PipelineError::validation(format!(
                    "popularity item count negative: item={}",
                    item.item_id
                )));
            }
        }
        Ok(())
    }
}

impl RowChecks for CoocPayload {
    fn check_rows(&self, opts: &ValidatorOptions) -> Result<()> {
        for row in &self.neighbors {
            if row.item_id.is_empty() {
                return Err(PipelineError::validation("cooc row item_id is empty"));
            }
            if opts.max_neighbors > 0 && row.neighbors.len() > opts.max_neighbors {
                return Err(PipelineError::validation(format!(
                    "cooc neighbors exceed max: item={} neighbors={} max={}",
                    row.item_id,
                    row.neighbors.len(),
                    opts.max_neighbors
                )));
            }
            for n in &row.neighbors {
                if n.item_id.is_empty() {
                    return Err(PipelineError::validation(format!(
                        "cooc neighbor item_id is empty: item={}",
                        row.item_id
                    )));
                }
                if n.count < 0 {
                    return Err(PipelineError::validation(format!(
                        "cooc neighbor count negative: item={} neighbor={}",
                        row.item_id, n.item_id
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_user_rows(kind: &str, users: &[UserItems], opts: &ValidatorOptions) -> Result<()> {
    for user in users {
        if user.user_id.is_empty() {
            return Err(PipelineError::validation(format!("{} user_id is empty", kind)));
        }
        if opts.max_items_per_user > 0 && user.items.len() > opts.max_items_per_user {
            return Err(PipelineError::validation(format!(
                "{} items exceed max: user={} items={} max={}",
                kind,
                user.user_id,
                user.items.len(),
                opts.max_items_per_user
            )));
        }
        for item in &user.items {
            if item.item_id.is_empty() {
                return Err(PipelineError::validation(format!(
                    "{} item_id is empty: user={}",
                    kind, user.user_id
                )));
            }
            if item.score < 0.0 {
                return Err(PipelineError::validation(format!(
                    "{} score negative: user={} item={}",
                    kind, user.user_id, item.item_id
                )));
            }
        }
    }
    Ok(())
}

impl RowChecks for ImplicitPayload {
    fn check_rows(&self, opts: &ValidatorOptions) -> Result<()> {
        check_user_rows("implicit", &self.users, opts)
    }
}

impl RowChecks for SessionSeqPayload {
    fn check_rows(&self, opts: &ValidatorOptions) -> Result<()> {
        check_user_rows("session_seq", &self.users, opts)
    }
}

impl RowChecks for ContentSimPayload {
    fn check_rows(&self, _opts: &ValidatorOptions) -> Result<()> {
        for item in &self.items {
            if item.item_id.is_empty() {
                return Err(PipelineError::validation("content item_id is empty"));
            }
            if item.tags.is_empty() {
                return Err(PipelineError::validation(format!(
                    "content item has no tags: item={}",
                    item.item_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FsCanonicalStore;
    use crate::jobs::seal_artifact;
    use artifact_schema::{parse_rfc3339, PopularityItem, Window};

    fn validator(opts: ValidatorOptions) -> BuiltinValidator {
        let dir = std::env::temp_dir().join("recsys-validator-unused");
        BuiltinValidator::new(Arc::new(FsCanonicalStore::new(dir)), opts)
    }

    fn window() -> Window {
        Window::day(parse_rfc3339("2024-01-01T00:00:00Z").unwrap())
    }

    fn popularity(items: Vec<PopularityItem>) -> crate::jobs::BuiltArtifact {
        seal_artifact(
            "t1",
            "home",
            "",
            window(),
            PopularityPayload { items },
            parse_rfc3339("2024-01-02T00:00:00Z").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_popularity_passes() {
        let built = popularity(vec![PopularityItem::new("a", 3), PopularityItem::new("b", 1)]);
        validator(ValidatorOptions::default())
            .validate_artifact(&built.artifact_ref, &built.blob)
            .unwrap();
    }

    #[test]
    fn test_tampered_blob_fails_hash() {
        let built = popularity(vec![PopularityItem::new("a", 3)]);
        let tampered = String::from_utf8(built.blob.clone())
            .unwrap()
            .replace("\"count\": 3", "\"count\": 4");
        let err = validator(ValidatorOptions::default())
            .validate_artifact(&built.artifact_ref, tampered.as_bytes())
            .unwrap_err();
        assert!(err.to_string().contains("version hash mismatch"));
    }

    #[test]
    fn test_key_window_and_limits() {
        let built = popularity(vec![PopularityItem::new("a", 3), PopularityItem::new("b", 1)]);
        let v = validator(ValidatorOptions::default());

        let mut other_tenant = built.artifact_ref.clone();
        other_tenant.key.tenant = "t2".into();
        assert!(v.validate_artifact(&other_tenant, &built.blob).unwrap_err().to_string().contains("key mismatch"));

        let mut other_window = built.artifact_ref.clone();
        other_window.window = Window::day(parse_rfc3339("2024-01-05T00:00:00Z").unwrap());
        assert!(v.validate_artifact(&other_window, &built.blob).unwrap_err().to_string().contains("window"));

        let capped = validator(ValidatorOptions {
            max_rows: 1,
            ..Default::default()
        });
        assert!(capped.validate_artifact(&built.artifact_ref, &built.blob).is_err());
    }

    #[test]
    fn test_negative_count_rejected() {
        let built = popularity(vec![PopularityItem::new("a", -1)]);
        let err = validator(ValidatorOptions::default())
            .validate_artifact(&built.artifact_ref, &built.blob)
            .unwrap_err();
        assert!(err.to_string().contains("negative"));
    }
}
