use super::{by_score_then_id, check_cancelled, seal_artifact, BuiltArtifact};
use crate::error::{PipelineError, Result};
use crate::store::{CanonicalStore, Clock};
use artifact_schema::{ImplicitPayload, ScoredEntry, UserItems, Window};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub(crate) const DEFAULT_USER_TOP_N: usize = 200;

/// Per-user interaction counts; events without a user id are skipped.
pub struct ComputeImplicit {
    canonical: Arc<dyn CanonicalStore>,
    clock: Arc<dyn Clock>,
    top_n: usize,
    max_users: usize,
    max_items_per_user: usize,
}

impl ComputeImplicit {
    pub fn new(
        canonical: Arc<dyn CanonicalStore>,
        clock: Arc<dyn Clock>,
        top_n: usize,
        max_users: usize,
        max_items_per_user: usize,
    ) -> Self {
        Self {
            canonical,
            clock,
            top_n: if top_n == 0 { DEFAULT_USER_TOP_N } else { top_n },
            max_users,
            max_items_per_user,
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
        info!(tenant, surface, "implicit: start");

        let mut users: HashMap<String, HashMap<String, i64>> = HashMap::new();
        let mut stream = self.canonical.read_exposure_events(tenant, surface, window).await?;
        while let Some(event) = stream.recv().await {
            check_cancelled(cancel)?;
            let event = event?;
            if event.user_id.is_empty() || event.item_id.is_empty() {
                continue;
            }
            if !users.contains_key(&event.user_id) && self.max_users > 0 && users.len() >= self.max_users {
                return Err(PipelineError::limit("distinct users", users.len() + 1, self.max_users));
            }
            let items = users.entry(event.user_id).or_default();
            if self.max_items_per_user > 0
                && !items.contains_key(&event.item_id)
                && items.len() >= self.max_items_per_user
            {
                return Err(PipelineError::limit(
                    "items per user",
                    items.len() + 1,
                    self.max_items_per_user,
                ));
            }
            *items.entry(event.item_id).or_insert(0) += 1;
        }

        let rows = rank_users(users, self.top_n);
        let user_count = rows.len();
        let built = seal_artifact(tenant, surface, segment, window, ImplicitPayload { users: rows }, start)?;
        info!(
            tenant,
            surface,
            users = user_count,
            version = %built.artifact_ref.version,
            duration_ms = (self.clock.now() - start).num_milliseconds(),
            "implicit: done"
        );
        Ok(built)
    }
}

/// Users by id, each with items by count desc then id, cut to `top_n`.
pub(crate) fn rank_users(users: HashMap<String, HashMap<String, i64>>, top_n: usize) -> Vec<UserItems> {
    let mut rows: Vec<UserItems> = users
        .into_iter()
        .map(|(user_id, counts)| {
            let mut items: Vec<ScoredEntry> = counts
                .into_iter()
                .map(|(item_id, count)| ScoredEntry {
                    item_id,
                    score: count as f64,
                })
                .collect();
            items.sort_by(|a, b| {
                by_score_then_id((a.item_id.as_str(), a.score), (b.item_id.as_str(), b.score))
            });
            items.truncate(top_n);
            UserItems { user_id, items }
        })
        .filter(|row| !row.items.is_empty())
        .collect();
    rows.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    rows
}
