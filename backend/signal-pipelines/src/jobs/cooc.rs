use super::{by_score_then_id, check_cancelled, seal_artifact, BuiltArtifact};
use crate::error::{PipelineError, Result};
use crate::store::{CanonicalStore, Clock};
use artifact_schema::{CoocNeighbor, CoocPayload, CoocRow, Window};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct CoocLimits {
    pub max_sessions: usize,
    pub max_items_per_session: usize,
    pub max_distinct_items: usize,
    pub max_neighbors: usize,
    pub max_rows: usize,
    pub min_support: i64,
}

/// Symmetric session co-occurrence counts.
pub struct ComputeCooc {
    canonical: Arc<dyn CanonicalStore>,
    clock: Arc<dyn Clock>,
    limits: CoocLimits,
}

impl ComputeCooc {
    pub fn new(canonical: Arc<dyn CanonicalStore>, clock: Arc<dyn Clock>, limits: CoocLimits) -> Self {
        Self {
            canonical,
            clock,
            limits,
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
        let limits = self.limits;
        info!(tenant, surface, "cooc: start");

        let mut sessions: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut distinct: HashSet<String> = HashSet::new();
        let mut stream = self.canonical.read_exposure_events(tenant, surface, window).await?;
        while let Some(event) = stream.recv().await {
            check_cancelled(cancel)?;
            let event = event?;
            if event.session_id.is_empty() || event.item_id.is_empty() {
                continue;
            }
            if limits.max_distinct_items > 0
                && !distinct.contains(&event.item_id)
                && distinct.len() >= limits.max_distinct_items
            {
                return Err(PipelineError::limit(
                    "distinct items",
                    distinct.len() + 1,
                    limits.max_distinct_items,
                ));
            }
            if !sessions.contains_key(&event.session_id)
                && limits.max_sessions > 0
                && sessions.len() >= limits.max_sessions
            {
                return Err(PipelineError::limit(
                    "sessions",
                    sessions.len() + 1,
                    limits.max_sessions,
                ));
            }
            let items = sessions.entry(event.session_id).or_default();
            if limits.max_items_per_session > 0
                && !items.contains(&event.item_id)
                && items.len() >= limits.max_items_per_session
            {
                return Err(PipelineError::limit(
                    "items per session",
                    items.len() + 1,
                    limits.max_items_per_session,
                ));
            }
            distinct.insert(event.item_id.clone());
            items.insert(event.item_id);
        }

        let mut pairs: HashMap<String, HashMap<String, i64>> = HashMap::new();
        for items in sessions.values() {
            check_cancelled(cancel)?;
            let items: Vec<&String> = items.iter().collect();
            for (i, a) in items.iter().enumerate() {
                for b in &items[i + 1..] {
                    *pairs
                        .entry((*a).clone())
                        .or_default()
                        .entry((*b).clone())
                        .or_insert(0) += 1;
                    *pairs
                        .entry((*b).clone())
                        .or_default()
                        .entry((*a).clone())
                        .or_insert(0) += 1;
                }
            }
        }

        let mut rows: Vec<CoocRow> = pairs
            .into_iter()
            .filter_map(|(item_id, counts)| {
                let mut neighbors: Vec<CoocNeighbor> = counts
                    .into_iter()
                    .filter(|(_, count)| *count >= limits.min_support)
                    .map(|(item_id, count)| CoocNeighbor { item_id, count })
                    .collect();
                if neighbors.is_empty() {
                    return None;
                }
                neighbors.sort_by(|a, b| {
                    by_score_then_id((a.item_id.as_str(), a.count), (b.item_id.as_str(), b.count))
                });
                if limits.max_neighbors > 0 {
                    neighbors.truncate(limits.max_neighbors);
                }
                Some(CoocRow { item_id, neighbors })
            })
            .collect();
        rows.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        if limits.max_rows > 0 {
            rows.truncate(limits.max_rows);
        }

        let row_count = rows.len();
        let built = seal_artifact(
            tenant,
            surface,
            segment,
            window,
            CoocPayload { neighbors: rows },
            start,
        )?;
        info!(
            tenant,
            surface,
            sessions = sessions.len(),
            rows = row_count,
            version = %built.artifact_ref.version,
            duration_ms = (self.clock.now() - start).num_milliseconds(),
            "cooc: done"
        );
        Ok(built)
    }
}
