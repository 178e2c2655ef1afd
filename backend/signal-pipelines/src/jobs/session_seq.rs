use super::implicit::{rank_users, DEFAULT_USER_TOP_N};
use super::{check_cancelled, seal_artifact, BuiltArtifact};
use crate::error::{PipelineError, Result};
use crate::models::ExposureEvent;
use crate::store::{CanonicalStore, Clock};
use artifact_schema::{SessionSeqPayload, Window};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// "Seen next" counts: for each user's time-ordered events, the item that
/// followed each exposure.
pub struct ComputeSessionSeq {
    canonical: Arc<dyn CanonicalStore>,
    clock: Arc<dyn Clock>,
    top_n: usize,
    max_users: usize,
    max_items_per_user: usize,
}

impl ComputeSessionSeq {
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
        info!(tenant, surface, "session_seq: start");

        let mut timelines: HashMap<String, Vec<ExposureEvent>> = HashMap::new();
        let mut stream = self.canonical.read_exposure_events(tenant, surface, window).await?;
        while let Some(event) = stream.recv().await {
            check_cancelled(cancel)?;
            let event = event?;
            if event.user_id.is_empty() {
                continue;
            }
            if !timelines.contains_key(&event.user_id)
                && self.max_users > 0
                && timelines.len() >= self.max_users
            {
                return Err(PipelineError::limit(
                    "distinct users",
                    timelines.len() + 1,
                    self.max_users,
                ));
            }
            timelines.entry(event.user_id.clone()).or_default().push(event);
        }

        let mut successors: HashMap<String, HashMap<String, i64>> = HashMap::new();
        for (user_id, mut events) in timelines {
            check_cancelled(cancel)?;
            // stable: equal timestamps keep arrival order
            events.sort_by_key(|e| e.ts);
            let mut counts: HashMap<String, i64> = HashMap::new();
            for pair in events.windows(2) {
                let next = &pair[1].item_id;
                if pair[0].item_id.is_empty() || next.is_empty() {
                    continue;
                }
                if self.max_items_per_user > 0
                    && !counts.contains_key(next)
                    && counts.len() >= self.max_items_per_user
                {
                    return Err(PipelineError::limit(
                        "items per user",
                        counts.len() + 1,
                        self.max_items_per_user,
                    ));
                }
                *counts.entry(next.clone()).or_insert(0) += 1;
            }
            if !counts.is_empty() {
                successors.insert(user_id, counts);
            }
        }

        let rows = rank_users(successors, self.top_n);
        let user_count = rows.len();
        let built = seal_artifact(
            tenant,
            surface,
            segment,
            window,
            SessionSeqPayload { users: rows },
            start,
        )?;
        info!(
            tenant,
            surface,
            users = user_count,
            version = %built.artifact_ref.version,
            duration_ms = (self.clock.now() - start).num_milliseconds(),
            "session_seq: done"
        );
        Ok(built)
    }
}
