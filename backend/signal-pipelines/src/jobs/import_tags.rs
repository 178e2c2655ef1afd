use crate::error::{PipelineError, Result};
use crate::models::CatalogItem;
use crate::store::{CatalogReader, Clock, ItemTagSink};
use std::sync::Arc;
use tracing::info;

const DEFAULT_NAMESPACE: &str = "default";

/// Loads catalog rows and upserts their tags for the serving tag store.
pub struct ImportItemTags {
    reader: Arc<dyn CatalogReader>,
    sink: Arc<dyn ItemTagSink>,
    clock: Arc<dyn Clock>,
    max_items: usize,
}

impl ImportItemTags {
    pub fn new(
        reader: Arc<dyn CatalogReader>,
        sink: Arc<dyn ItemTagSink>,
        clock: Arc<dyn Clock>,
        max_items: usize,
    ) -> Self {
        Self {
            reader,
            sink,
            clock,
            max_items,
        }
    }

    /// Returns the number of rows written. Empty `namespace` means `default`.
    pub async fn execute(&self, tenant: &str, namespace: &str) -> Result<usize> {
        let tenant = tenant.trim();
        if tenant.is_empty() {
            return Err(PipelineError::invalid("tenant is required"));
        }
        let namespace = match namespace.trim() {
            "" => DEFAULT_NAMESPACE,
            ns => ns,
        };
        let now = self.clock.now();
        info!(tenant, namespace, "catalog: start");

        let rows = self.reader.read_items().await?;
        if self.max_items > 0 && rows.len() > self.max_items {
            return Err(PipelineError::limit("catalog items", rows.len(), self.max_items));
        }

        let items: Vec<CatalogItem> = rows
            .into_iter()
            .filter(|row| !row.item_id.trim().is_empty())
            .map(|mut row| {
                row.item_id = row.item_id.trim().to_string();
                if row.namespace.trim().is_empty() {
                    row.namespace = namespace.to_string();
                }
                row.created_at.get_or_insert(now);
                row
            })
            .collect();

        self.sink.upsert_item_tags(tenant, &items).await?;
        info!(
            tenant,
            namespace,
            items = items.len(),
            duration_ms = (self.clock.now() - now).num_milliseconds(),
            "catalog: done"
        );
        Ok(items.len())
    }
}
