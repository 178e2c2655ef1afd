//! Candidate recall: popularity plus the personal sources, merged into one
//! deterministic pool.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::models::{Candidate, Request, Signal, SignalStatus};
use crate::services::scoring::{
    effective_profile, normalize_tag_weights, top_profile_tags, CandidateData,
};
use crate::services::signal_store::sort_and_truncate;
use crate::store::{EngineStore, RequestContext};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_SESSION_LOOKBACK: usize = 10;
const DEFAULT_SESSION_HORIZON_MINUTES: f64 = 30.0;
const MAX_RESERVED_SLOTS: usize = 20;

/// Recall layer: fetches every source for a request and merges them.
pub struct RecallLayer {
    store: Arc<dyn EngineStore>,
    config: Arc<EngineConfig>,
}

/// Personal source results, filtered and deduplicated against the pool
#[derive(Debug, Default)]
struct PersonalSource {
    items: Vec<Candidate>,
    fetched: usize,
}

impl RecallLayer {
    pub fn new(store: Arc<dyn EngineStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// Popularity first (a failure there fails the request), then the
    /// collaborative, content and session sources in parallel. Unavailable
    /// personal sources are recorded in the signal status and skipped.
    pub async fn recall_candidates(
        &self,
        ctx: &RequestContext,
        req: &Request,
        k: usize,
    ) -> Result<CandidateData> {
        let namespace = req.namespace_or_default();
        let fanout = self.config.fanout_for(k);
        let mut data = CandidateData::default();

        let mut pop = self
            .store
            .popularity_top_k(
                ctx,
                req.org_id,
                &namespace,
                self.config.half_life_days,
                fanout,
                &req.pop_constraints(),
            )
            .await?;
        let fetched = pop.len();
        data.record_status(Signal::Popularity, available());

        let mut existing: HashSet<String> = pop.iter().map(|c| c.item_id.clone()).collect();
        if req.inject_anchors && !req.anchors.is_empty() {
            let max_score = pop.iter().map(|c| c.score).fold(0.0, f64::max);
            let score = if max_score > 0.0 { max_score } else { 1.0 };
            for anchor in &req.anchors {
                let anchor = anchor.trim();
                if !anchor.is_empty() && existing.insert(anchor.to_string()) {
                    pop.push(Candidate::new(anchor, score));
                }
            }
        }
        data.record_metric("popularity", fetched, pop.len());

        let mut personal: [(Signal, PersonalSource); 3] = [
            (Signal::Collaborative, PersonalSource::default()),
            (Signal::Content, PersonalSource::default()),
            (Signal::Session, PersonalSource::default()),
        ];

        if let Some(user) = req.user_key() {
            let mut exclude: Vec<String> = existing.iter().cloned().collect();
            exclude.sort();

            let (collab, content, session) = futures::join!(
                self.collaborative(ctx, req, &namespace, &user, fanout, &exclude),
                self.content(ctx, req, &namespace, &user, fanout, &exclude),
                self.session(ctx, req, &namespace, &user, fanout, &exclude),
            );

            for ((signal, source), result) in personal.iter_mut().zip([collab, content, session]) {
                match result {
                    Ok(items) => {
                        data.record_status(*signal, available());
                        source.fetched = items.len();
                        source.items = keep_new(items, &mut existing);
                    }
                    Err(err) if err.is_feature_unavailable() => {
                        data.record_status(*signal, unavailable());
                    }
                    Err(err) => {
                        warn!(signal = %signal, error = %err, "Recall source failed");
                        return Err(err);
                    }
                }
                data.record_metric(signal.as_str(), source.fetched, source.items.len());
            }
        }

        let [(_, collab), (_, content), (_, session)] = &personal;
        data.pop_scores = scores_of(&pop);
        data.collab_scores = scores_of(&collab.items);
        data.content_scores = scores_of(&content.items);
        data.session_scores = scores_of(&session.items);

        self.merge(&mut data, &pop, &personal, k);
        debug!(
            org_id = %req.org_id,
            namespace = %namespace,
            popularity = pop.len(),
            collaborative = collab.items.len(),
            content = content.items.len(),
            session = session.items.len(),
            merged = data.candidates.len(),
            "Recall completed"
        );
        Ok(data)
    }

    async fn collaborative(
        &self,
        ctx: &RequestContext,
        req: &Request,
        namespace: &str,
        user: &str,
        fanout: usize,
        exclude: &[String],
    ) -> Result<Vec<Candidate>> {
        self.store
            .collaborative_top_k(ctx, req.org_id, namespace, user, fanout, exclude)
            .await
    }

    /// Content source seeded by the user's tag profile blended with the
    /// request's starter profile.
    async fn content(
        &self,
        ctx: &RequestContext,
        req: &Request,
        namespace: &str,
        user: &str,
        fanout: usize,
        exclude: &[String],
    ) -> Result<Vec<Candidate>> {
        let top_n = usize::try_from(self.config.profile_top_n_tags).unwrap_or(0);
        let profile = self
            .store
            .build_user_tag_profile(
                ctx,
                req.org_id,
                namespace,
                user,
                self.config.profile_window_days,
                top_n,
            )
            .await?;
        let profile = effective_profile(
            normalize_tag_weights(&profile),
            &req.starter_profile,
            req.starter_blend_weight,
        );
        let tags = top_profile_tags(&profile, top_n);
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .content_similarity_top_k(ctx, req.org_id, namespace, &tags, fanout, exclude)
            .await
    }

    async fn session(
        &self,
        ctx: &RequestContext,
        req: &Request,
        namespace: &str,
        user: &str,
        fanout: usize,
        exclude: &[String],
    ) -> Result<Vec<Candidate>> {
        let lookback = match usize::try_from(self.config.session_lookback_events) {
            Ok(n) if n > 0 => n,
            _ => DEFAULT_SESSION_LOOKBACK,
        };
        let horizon = if self.config.session_lookahead_minutes > 0.0 {
            self.config.session_lookahead_minutes
        } else {
            DEFAULT_SESSION_HORIZON_MINUTES
        };
        self.store
            .session_sequence_top_k(
                ctx,
                req.org_id,
                namespace,
                user,
                lookback,
                horizon,
                exclude,
                fanout,
            )
            .await
    }

    /// Reserved-slot merge. Popularity fills the pool up to `max_keep` minus
    /// a reserve, the personal sources take turns filling the reserve (each
    /// ordered by score desc then id), and leftover popularity tops up.
    fn merge(
        &self,
        data: &mut CandidateData,
        pop: &[Candidate],
        personal: &[(Signal, PersonalSource); 3],
        k: usize,
    ) {
        let max_keep = pop.len().max(k).max(self.config.fanout_for(k)).max(1);
        let has_personal = personal.iter().any(|(_, s)| !s.items.is_empty());
        let reserve = if has_personal {
            (pop.len() / 4)
                .max(1)
                .min(MAX_RESERVED_SLOTS.min(pop.len()))
        } else {
            0
        };
        let pop_limit = if reserve > 0 && max_keep > reserve {
            max_keep - reserve
        } else {
            max_keep
        };

        let mut pool = Pool::with_capacity(max_keep);
        let mut pop_idx = 0;
        while pop_idx < pop.len() && pool.len() < pop_limit {
            pool.push(data, &pop[pop_idx], Signal::Popularity, max_keep);
            pop_idx += 1;
        }

        let ordered: Vec<(Signal, Vec<Candidate>)> = personal
            .iter()
            .map(|(signal, source)| {
                let mut items = source.items.clone();
                sort_and_truncate(&mut items, usize::MAX);
                (*signal, items)
            })
            .collect();
        let rounds = ordered.iter().map(|(_, items)| items.len()).max().unwrap_or(0);
        for round in 0..rounds {
            for (signal, items) in &ordered {
                if let Some(candidate) = items.get(round) {
                    pool.push(data, candidate, *signal, max_keep);
                }
            }
        }

        for candidate in &pop[pop_idx..] {
            pool.push(data, candidate, Signal::Popularity, max_keep);
        }

        let input = pop.len() + personal.iter().map(|(_, s)| s.items.len()).sum::<usize>();
        data.record_metric("merged", input, pool.len());
        data.candidates = pool.items;
    }
}

/// Merged pool that skips ids already taken
struct Pool {
    items: Vec<Candidate>,
    used: HashSet<String>,
}

impl Pool {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            used: HashSet::with_capacity(capacity),
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn push(&mut self, data: &mut CandidateData, candidate: &Candidate, signal: Signal, limit: usize) {
        if self.items.len() >= limit || candidate.item_id.is_empty() {
            return;
        }
        if self.used.insert(candidate.item_id.clone()) {
            data.add_source(&candidate.item_id, signal);
            self.items.push(candidate.clone());
        }
    }
}

fn available() -> SignalStatus {
    SignalStatus {
        available: true,
        partial: false,
        error: None,
    }
}

pub(crate) fn unavailable() -> SignalStatus {
    SignalStatus {
        available: false,
        partial: false,
        error: Some("unavailable".to_string()),
    }
}

pub(crate) fn failed(err: &EngineError) -> SignalStatus {
    SignalStatus {
        available: false,
        partial: false,
        error: Some(err.to_string()),
    }
}

/// Keeps positive-scored items not already in the pool, claiming them.
fn keep_new(items: Vec<Candidate>, existing: &mut HashSet<String>) -> Vec<Candidate> {
    items
        .into_iter()
        .filter(|c| !c.item_id.is_empty() && c.score > 0.0)
        .filter(|c| existing.insert(c.item_id.clone()))
        .collect()
}

fn scores_of(items: &[Candidate]) -> HashMap<String, f64> {
    items.iter().map(|c| (c.item_id.clone(), c.score)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemTags, PopConstraints};
    use crate::store::TagStore;
    use async_trait::async_trait;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeStore {
        pop: Vec<Candidate>,
        collab: Option<Vec<Candidate>>,
        session_fails: bool,
    }

    #[async_trait]
    impl TagStore for FakeStore {
        async fn list_items_tags(
            &self,
            _ctx: &RequestContext,
            _org_id: Uuid,
            _namespace: &str,
            _item_ids: &[String],
        ) -> Result<HashMap<String, ItemTags>> {
            Ok(HashMap::new())
        }
    }

    #[async_trait]
    impl EngineStore for FakeStore {
        async fn popularity_top_k(
            &self,
            _ctx: &RequestContext,
            _org_id: Uuid,
            _namespace: &str,
            _half_life_days: f64,
            k: usize,
            _constraints: &PopConstraints,
        ) -> Result<Vec<Candidate>> {
            Ok(self.pop.iter().take(k).cloned().collect())
        }

        async fn collaborative_top_k(
            &self,
            _ctx: &RequestContext,
            _org_id: Uuid,
            _namespace: &str,
            _user_id: &str,
            _k: usize,
            exclude: &[String],
        ) -> Result<Vec<Candidate>> {
            match &self.collab {
                Some(items) => Ok(items
                    .iter()
                    .filter(|c| !exclude.contains(&c.item_id))
                    .cloned()
                    .collect()),
                None => Err(EngineError::FeatureUnavailable),
            }
        }

        async fn session_sequence_top_k(
            &self,
            _ctx: &RequestContext,
            _org_id: Uuid,
            _namespace: &str,
            _user_id: &str,
            _lookback: usize,
            _horizon_minutes: f64,
            _exclude: &[String],
            _k: usize,
        ) -> Result<Vec<Candidate>> {
            if self.session_fails {
                Err(EngineError::Dependency("boom".into()))
            } else {
                Err(EngineError::FeatureUnavailable)
            }
        }
    }

    fn layer(store: FakeStore, fanout: i64) -> RecallLayer {
        let config = EngineConfig {
            popularity_fanout: fanout,
            ..Default::default()
        };
        RecallLayer::new(Arc::new(store), Arc::new(config))
    }

    fn pop(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate::new(format!("p{:02}", i), (n - i) as f64))
            .collect()
    }

    fn ids(data: &CandidateData) -> Vec<&str> {
        data.candidates.iter().map(|c| c.item_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_popularity_only_without_user() {
        let layer = layer(FakeStore { pop: pop(3), ..Default::default() }, 0);
        let req = Request::new(Uuid::from_u128(1), "home", 2);
        let data = layer.recall_candidates(&RequestContext::new(), &req, 2).await.unwrap();
        assert_eq!(ids(&data), vec!["p00", "p01"]);
        assert!(data.signal_status[&Signal::Popularity].available);
        assert!(!data.signal_status.contains_key(&Signal::Collaborative));
    }

    #[tokio::test]
    async fn test_reserved_slots_for_personal_sources() {
        let store = FakeStore {
            pop: pop(8),
            collab: Some(vec![
                Candidate::new("c2", 0.5),
                Candidate::new("c1", 0.9),
                Candidate::new("p00", 3.0),
            ]),
            ..Default::default()
        };
        let layer = layer(store, 8);
        let mut req = Request::new(Uuid::from_u128(1), "home", 8);
        req.user_id = Some("u1".into());

        let data = layer.recall_candidates(&RequestContext::new(), &req, 8).await.unwrap();
        // 8 slots, reserve 2: six popular items, then c1 and c2 by score
        assert_eq!(
            ids(&data),
            vec!["p00", "p01", "p02", "p03", "p04", "p05", "c1", "c2"]
        );
        assert!(data.sources["c1"].contains(&Signal::Collaborative));
        assert!(data.collab_scores.contains_key("c2"));
        assert!(!data.collab_scores.contains_key("p00"));
        assert!(!data.signal_status[&Signal::Session].available);
    }

    #[tokio::test]
    async fn test_anchor_injection() {
        let layer = layer(FakeStore { pop: pop(2), ..Default::default() }, 0);
        let mut req = Request::new(Uuid::from_u128(1), "home", 2);
        req.inject_anchors = true;
        req.anchors = vec![" p00 ".into(), "anchor".into()];
        let data = layer.recall_candidates(&RequestContext::new(), &req, 2).await.unwrap();
        assert_eq!(ids(&data), vec!["p00", "p01", "anchor"]);
        assert_eq!(data.pop_scores["anchor"], 2.0);
    }

    #[tokio::test]
    async fn test_personal_source_error_is_fatal() {
        let store = FakeStore {
            pop: pop(2),
            session_fails: true,
            ..Default::default()
        };
        let layer = layer(store, 0);
        let mut req = Request::new(Uuid::from_u128(1), "home", 2);
        req.user_id = Some("u1".into());
        let err = layer.recall_candidates(&RequestContext::new(), &req, 2).await.unwrap_err();
        assert!(matches!(err, EngineError::Dependency(_)));
    }
}
