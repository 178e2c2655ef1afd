use super::{by_score_then_id, check_cancelled, seal_artifact, BuiltArtifact};
use crate::error::{PipelineError, Result};
use crate::store::{CanonicalStore, Clock};
use artifact_schema::{PopularityItem, PopularityPayload, Window};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DEFAULT_TOP_N: usize = 1000;

/// Exposure counts per item, highest first.
pub struct ComputePopularity {
    canonical: Arc<dyn CanonicalStore>,
    clock: Arc<dyn Clock>,
    top_n: usize,
    max_distinct_items: usize,
}

impl ComputePopularity {
    pub fn new(
        canonical: Arc<dyn CanonicalStore>,
        clock: Arc<dyn Clock>,
        top_n: usize,
        max_distinct_items: usize,
    ) -> Self {
        Self {
            canonical,
            clock,
            top_n: if top_n == 0 { DEFAULT_TOP_N } else { top_n },
            max_distinct_items,
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
        let start = self.clock.now();
        info!(tenant, surface, "popularity: start");

        let mut counts: HashMap<String, i64> = HashMap::new();
        let mut stream = self.canonical.read_exposure_events(tenant, surface, window).await?;
        while let Some(event) = stream.recv().await {
            check_cancelled(cancel)?;
            let event = event?;
            if event.item_id.is_empty() {
                continue;
            }
            if let Some(count) = counts.get_mut(&event.item_id) {
                *count += 1;
                continue;
            }
            if self.max_distinct_items > 0 && counts.len() >= self.max_distinct_items {
                return Err(PipelineError::limit(
                    "distinct items",
                    counts.len() + 1,
                    self.max_distinct_items,
                ));
            }
            counts.insert(event.item_id, 1);
        }

        let mut items: Vec<PopularityItem> = counts
            .into_iter()
            .map(|(id, count)| PopularityItem::new(id, count))
            .collect();
        items.sort_by(|a, b| {
            by_score_then_id((a.item_id.as_str(), a.count), (b.item_id.as_str(), b.count))
        });
        items.truncate(self.top_n);

        let rows = items.len();
        let built = seal_artifact(tenant, surface, segment, window, PopularityPayload { items }, start)?;
        info!(
            tenant,
            surface,
            items = rows,
            version = %built.artifact_ref.version,
            duration_ms = (self.clock.now() - start).num_milliseconds(),
            "popularity: done"
        );
        Ok(built)
    }
}
