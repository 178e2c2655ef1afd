use super::{check_cancelled, seal_artifact, BuiltArtifact};
use crate::error::{PipelineError, Result};
use crate::store::{CatalogReader, Clock};
use artifact_schema::{normalize_tags, ContentItem, ContentSimPayload, Window};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Normalized tag sets per catalog item, for tag-overlap similarity at
/// serving time. Items from another namespace or without tags are dropped.
pub struct ComputeContentSim {
    catalog: Option<Arc<dyn CatalogReader>>,
    clock: Arc<dyn Clock>,
    max_items: usize,
}

impl ComputeContentSim {
    pub fn new(catalog: Option<Arc<dyn CatalogReader>>, clock: Arc<dyn Clock>, max_items: usize) -> Self {
        Self {
            catalog,
            clock,
            max_items,
        }
    }

    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        tenant: &str,
        surface: &str,
        segment: &str,
        window: Window,
    ) -> Result<BuiltArtifact> {
        let catalog = self
            .catalog
            .as_ref()
            .ok_or_else(|| PipelineError::invalid("catalog reader is required"))?;
        let start = self.clock.now();
        info!(tenant, surface, "content_sim: start");

        let rows = catalog.read_items().await?;
        check_cancelled(cancel)?;
        if self.max_items > 0 && rows.len() > self.max_items {
            return Err(PipelineError::limit("catalog items", rows.len(), self.max_items));
        }

        let mut items: BTreeMap<String, ContentItem> = BTreeMap::new();
        for row in rows {
            let item_id = row.item_id.trim();
            let namespace = row.namespace.trim();
            if item_id.is_empty() || (!namespace.is_empty() && namespace != surface) {
                continue;
            }
            let tags = normalize_tags(&row.tags);
            if tags.is_empty() {
                continue;
            }
            items.insert(
                item_id.to_string(),
                ContentItem {
                    item_id: item_id.to_string(),
                    tags,
                },
            );
        }

        let items: Vec<ContentItem> = items.into_values().collect();
        let count = items.len();
        let built = seal_artifact(tenant, surface, segment, window, ContentSimPayload { items }, start)?;
        info!(
            tenant,
            surface,
            items = count,
            version = %built.artifact_ref.version,
            duration_ms = (self.clock.now() - start).num_milliseconds(),
            "content_sim: done"
        );
        Ok(built)
    }
}
