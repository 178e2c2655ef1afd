//! "More like this" lookups for a single item

use crate::config::EngineConfig;
use crate::error::{EngineError, Result, ValidationErrors};
use crate::models::{Candidate, ScoredItem, Signal};
use crate::services::ranking::days_before;
use crate::services::signal_store::sort_and_truncate;
use crate::store::{Clock, EngineStore, RequestContext, SystemClock};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_K: usize = 20;
const DEFAULT_CO_VIS_WINDOW_DAYS: i64 = 30;

/// Embedding neighbours when available, co-visitation otherwise.
pub struct SimilarItemsEngine {
    store: Arc<dyn EngineStore>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
}

impl SimilarItemsEngine {
    pub fn new(store: Arc<dyn EngineStore>, config: Arc<EngineConfig>) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Up to `k` items similar to `item_id` (`k <= 0` means 20). Items the
    /// store reports as unavailable are dropped.
    pub async fn find_similar(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        item_id: &str,
        k: i64,
    ) -> Result<Vec<ScoredItem>> {
        let item_id = item_id.trim();
        let mut errs = ValidationErrors::new();
        if org_id.is_nil() {
            errs.push("org_id", "must be set");
        }
        if item_id.is_empty() {
            errs.push("item_id", "must be set");
        }
        errs.into_result()?;
        ctx.check()?;

        let k = match usize::try_from(k) {
            Ok(k) if k > 0 => k,
            _ => DEFAULT_K,
        };
        let namespace = match namespace.trim() {
            "" => "default",
            ns => ns,
        };

        match self
            .store
            .similar_by_embedding_top_k(ctx, org_id, namespace, item_id, k)
            .await
        {
            Ok(items) => {
                let items = self.available_only(ctx, org_id, namespace, item_id, items, k).await;
                if !items.is_empty() {
                    return Ok(scored(items, Signal::Embedding));
                }
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) => debug!(error = %err, item_id, "Embedding neighbours unavailable"),
        }

        let window = if self.config.co_vis_window_days > 0 {
            self.config.co_vis_window_days
        } else {
            DEFAULT_CO_VIS_WINDOW_DAYS
        };
        let since = days_before(self.clock.now(), window);
        let items = self
            .store
            .cooccurrence_top_k_within(ctx, org_id, namespace, item_id, k, since)
            .await?;
        let items = self.available_only(ctx, org_id, namespace, item_id, items, k).await;
        Ok(scored(items, Signal::Cooc))
    }

    async fn available_only(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        item_id: &str,
        items: Vec<Candidate>,
        k: usize,
    ) -> Vec<Candidate> {
        let mut items: Vec<Candidate> = items
            .into_iter()
            .filter(|c| !c.item_id.is_empty() && c.item_id != item_id)
            .collect();
        sort_and_truncate(&mut items, k);
        if items.is_empty() {
            return items;
        }

        let ids: Vec<String> = items.iter().map(|c| c.item_id.clone()).collect();
        match self
            .store
            .list_items_availability(ctx, org_id, namespace, &ids)
            .await
        {
            Ok(availability) => items
                .into_iter()
                .filter(|c| availability.get(&c.item_id).copied().unwrap_or(false))
                .collect(),
            Err(_) => items,
        }
    }
}

fn scored(items: Vec<Candidate>, signal: Signal) -> Vec<ScoredItem> {
    items
        .into_iter()
        .enumerate()
        .map(|(idx, c)| ScoredItem {
            item_id: c.item_id,
            score: c.score,
            rank: idx + 1,
            reasons: vec![signal.reason().to_string()],
            explain: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemTags, PopConstraints};
    use crate::store::TagStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;

    #[derive(Default)]
    struct NeighbourStore {
        embedding: Option<Vec<Candidate>>,
        availability: Option<HashMap<String, bool>>,
    }

    #[async_trait]
    impl TagStore for NeighbourStore {
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
    impl EngineStore for NeighbourStore {
        async fn popularity_top_k(
            &self,
            _ctx: &RequestContext,
            _org_id: Uuid,
            _namespace: &str,
            _half_life_days: f64,
            _k: usize,
            _constraints: &PopConstraints,
        ) -> Result<Vec<Candidate>> {
            Ok(Vec::new())
        }

        async fn similar_by_embedding_top_k(
            &self,
            _ctx: &RequestContext,
            _org_id: Uuid,
            _namespace: &str,
            _anchor: &str,
            _k: usize,
        ) -> Result<Vec<Candidate>> {
            self.embedding.clone().ok_or(EngineError::FeatureUnavailable)
        }

        async fn cooccurrence_top_k_within(
            &self,
            _ctx: &RequestContext,
            _org_id: Uuid,
            _namespace: &str,
            anchor: &str,
            _k: usize,
            _since: DateTime<Utc>,
        ) -> Result<Vec<Candidate>> {
            Ok(vec![
                Candidate::new(anchor, 9.0),
                Candidate::new("n1", 3.0),
                Candidate::new("n2", 4.0),
            ])
        }

        async fn list_items_availability(
            &self,
            _ctx: &RequestContext,
            _org_id: Uuid,
            _namespace: &str,
            _item_ids: &[String],
        ) -> Result<HashMap<String, bool>> {
            self.availability.clone().ok_or(EngineError::FeatureUnavailable)
        }
    }

    fn engine(store: NeighbourStore) -> SimilarItemsEngine {
        SimilarItemsEngine::new(Arc::new(store), Arc::new(EngineConfig::default()))
    }

    #[tokio::test]
    async fn test_falls_back_to_cooc() {
        let engine = engine(NeighbourStore::default());
        let items = engine
            .find_similar(&RequestContext::new(), Uuid::from_u128(1), "", "seed", 0)
            .await
            .unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["n2", "n1"]);
        assert_eq!(items[0].reasons, vec!["co_visitation"]);
    }

    #[tokio::test]
    async fn test_embedding_with_availability_filter() {
        let store = NeighbourStore {
            embedding: Some(vec![Candidate::new("e1", 0.9), Candidate::new("e2", 0.8)]),
            availability: Some(HashMap::from([("e1".to_string(), false), ("e2".to_string(), true)])),
        };
        let items = engine(store)
            .find_similar(&RequestContext::new(), Uuid::from_u128(1), "pdp", "seed", 5)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id, "e2");
        assert_eq!(items[0].rank, 1);
        assert_eq!(items[0].reasons, vec!["embedding_similarity"]);
    }

    #[tokio::test]
    async fn test_requires_item_id() {
        let err = engine(NeighbourStore::default())
            .find_similar(&RequestContext::new(), Uuid::from_u128(1), "", "  ", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
