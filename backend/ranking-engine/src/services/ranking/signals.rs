use super::days_before;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::models::{BlendWeights, Candidate, Request, Signal, SignalStatus, NO_RECENT_ACTIVITY};
use crate::services::recall::{failed, unavailable};
use crate::services::scoring::{
    apply_profile_boost, effective_event_count, effective_profile, normalize_tag_weights,
    BoostSettings, CandidateData,
};
use crate::store::{EngineStore, RequestContext};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_CO_VIS_WINDOW_DAYS: i64 = 30;
const DEFAULT_RECENT_ANCHORS: usize = 10;

/// Per-anchor neighbour lookups shared by co-visitation and embeddings
struct AnchorFetch<'a> {
    store: &'a dyn EngineStore,
    ctx: &'a RequestContext,
    org_id: Uuid,
    namespace: &'a str,
    fanout: usize,
    since: DateTime<Utc>,
}

impl AnchorFetch<'_> {
    async fn neighbours(&self, signal: Signal, anchor: &str) -> Result<Vec<Candidate>> {
        match signal {
            Signal::Embedding => {
                self.store
                    .similar_by_embedding_top_k(self.ctx, self.org_id, self.namespace, anchor, self.fanout)
                    .await
            }
            _ => {
                self.store
                    .cooccurrence_top_k_within(
                        self.ctx,
                        self.org_id,
                        self.namespace,
                        anchor,
                        self.fanout,
                        self.since,
                    )
                    .await
            }
        }
    }

    /// Best score per candidate across every anchor. Lookups run concurrently
    /// and fold in anchor order. One failing anchor marks the signal partial;
    /// an unavailable store marks it unavailable.
    async fn collect(
        &self,
        signal: Signal,
        anchors: &[String],
        candidate_ids: &HashSet<String>,
    ) -> Result<(HashMap<String, f64>, SignalStatus)> {
        let mut scores: HashMap<String, f64> = HashMap::new();
        let mut successes = 0usize;
        let mut last_error: Option<String> = None;

        self.ctx.check()?;
        let lookups = join_all(anchors.iter().map(|anchor| self.neighbours(signal, anchor))).await;

        for (anchor, lookup) in anchors.iter().zip(lookups) {
            match lookup {
                Ok(items) => {
                    successes += 1;
                    for item in items {
                        if item.score <= 0.0 || !candidate_ids.contains(&item.item_id) {
                            continue;
                        }
                        let best = scores.entry(item.item_id).or_insert(0.0);
                        if item.score > *best {
                            *best = item.score;
                        }
                    }
                }
                Err(err) if err.is_feature_unavailable() => {
                    return Ok((HashMap::new(), unavailable()));
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(signal = %signal, anchor = %anchor, error = %err, "Anchor lookup failed");
                    last_error = Some(err.to_string());
                }
            }
        }

        let status = match (successes, last_error) {
            (0, Some(error)) => SignalStatus {
                available: false,
                partial: false,
                error: Some(error),
            },
            (_, Some(error)) => SignalStatus {
                available: true,
                partial: true,
                error: Some(error),
            },
            (_, None) => SignalStatus {
                available: true,
                partial: false,
                error: None,
            },
        };
        Ok((scores, status))
    }
}

/// Resolves anchors (request first, then recent history) and scores the
/// pool by co-visitation and embedding similarity to them.
#[allow(clippy::too_many_arguments)]
pub(super) async fn gather(
    store: &dyn EngineStore,
    config: &EngineConfig,
    ctx: &RequestContext,
    req: &Request,
    now: DateTime<Utc>,
    k: usize,
    weights: &BlendWeights,
    data: &mut CandidateData,
) -> Result<()> {
    let Some(user) = req.user_key() else {
        return Ok(());
    };
    let namespace = req.namespace_or_default();
    let window = if config.co_vis_window_days > 0 {
        config.co_vis_window_days
    } else {
        DEFAULT_CO_VIS_WINDOW_DAYS
    };
    let since = days_before(now, window);

    let anchors = if req.anchors.is_empty() {
        let limit = match usize::try_from(config.session_lookback_events) {
            Ok(n) if n > 0 => n,
            _ => DEFAULT_RECENT_ANCHORS,
        };
        data.anchors_fetched = true;
        match store
            .list_user_recent_item_ids(ctx, req.org_id, &namespace, &user, since, limit)
            .await
        {
            Ok(ids) => ids,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                let status = if err.is_feature_unavailable() {
                    unavailable()
                } else {
                    warn!(error = %err, "Recent item lookup failed");
                    failed(&err)
                };
                if weights.cooc > 0.0 {
                    data.record_status(Signal::Cooc, status.clone());
                }
                if weights.similarity > 0.0 {
                    data.record_status(Signal::Embedding, status);
                }
                data.anchors = vec![NO_RECENT_ACTIVITY.to_string()];
                return Ok(());
            }
        }
    } else {
        req.anchors.clone()
    };

    let mut seen = HashSet::new();
    let anchors: Vec<String> = anchors
        .iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty() && seen.insert(a.clone()))
        .collect();
    if anchors.is_empty() {
        data.anchors = vec![NO_RECENT_ACTIVITY.to_string()];
        return Ok(());
    }
    data.anchors = anchors.clone();

    if weights.cooc == 0.0 && weights.similarity == 0.0 {
        return Ok(());
    }

    let candidate_ids: HashSet<String> = data.candidates.iter().map(|c| c.item_id.clone()).collect();
    let fetch = AnchorFetch {
        store,
        ctx,
        org_id: req.org_id,
        namespace: &namespace,
        fanout: config.fanout_for(k),
        since,
    };

    if weights.cooc > 0.0 {
        let (scores, status) = fetch.collect(Signal::Cooc, &anchors, &candidate_ids).await?;
        for id in scores.keys() {
            data.add_source(id, Signal::Cooc);
        }
        data.record_metric(Signal::Cooc.as_str(), anchors.len(), scores.len());
        data.cooc_scores = scores;
        data.record_status(Signal::Cooc, status);
    }
    if weights.similarity > 0.0 {
        let (scores, status) = fetch.collect(Signal::Embedding, &anchors, &candidate_ids).await?;
        for id in scores.keys() {
            data.add_source(id, Signal::Embedding);
        }
        data.record_metric(Signal::Embedding.as_str(), anchors.len(), scores.len());
        data.emb_scores = scores;
        data.record_status(Signal::Embedding, status);
    }
    Ok(())
}

/// Profile boost for known users. A missing profile leaves scores untouched
/// unless the request carries a starter profile.
pub(super) async fn personalize(
    store: &dyn EngineStore,
    config: &EngineConfig,
    ctx: &RequestContext,
    req: &Request,
    data: &mut CandidateData,
) {
    if config.profile_boost <= 0.0 {
        return;
    }
    let Some(user) = req.user_key() else {
        return;
    };
    let top_n = usize::try_from(config.profile_top_n_tags).unwrap_or(0).max(1);
    let profile = match store
        .build_user_tag_profile(
            ctx,
            req.org_id,
            &req.namespace_or_default(),
            &user,
            config.profile_window_days,
            top_n,
        )
        .await
    {
        Ok(profile) => profile,
        Err(err) => {
            if !err.is_feature_unavailable() {
                debug!(error = %err, "User tag profile unavailable");
            }
            HashMap::new()
        }
    };
    let profile = effective_profile(
        normalize_tag_weights(&profile),
        &req.starter_profile,
        req.starter_blend_weight,
    );
    let events = effective_event_count(req.recent_event_count, data.effective_anchor_count());
    apply_profile_boost(data, &profile, BoostSettings::from_config(config), events);
}
