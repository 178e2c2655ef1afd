use super::{EvaluateRequest, EvaluateResult, Evaluator, Rule};
use crate::config::RulesManagerOptions;
use crate::error::Result;
use crate::store::{RequestContext, RulesStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;
use ttl_cache::TtlCache;
use uuid::Uuid;

const DEFAULT_BRAND_PREFIXES: &[&str] = &["brand"];
const DEFAULT_CATEGORY_PREFIXES: &[&str] = &["category", "cat"];

/// Caches active rules per scope and evaluates them for each request.
pub struct RulesManager {
    store: Arc<dyn RulesStore>,
    options: RulesManagerOptions,
    cache: TtlCache<String, Arc<Vec<Rule>>>,
}

impl RulesManager {
    pub fn new(store: Arc<dyn RulesStore>, mut options: RulesManagerOptions) -> Self {
        if options.refresh_interval.is_zero() {
            options.refresh_interval = ttl_cache::ttl::RULES;
        }
        if options.max_pin_slots == 0 {
            options.max_pin_slots = 3;
        }
        Self {
            store,
            options,
            cache: TtlCache::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.options.enabled
    }

    /// Applies the scope's active rules to the request candidates. Disabled
    /// managers pass candidates through untouched.
    pub async fn evaluate(&self, ctx: &RequestContext, req: &EvaluateRequest) -> Result<EvaluateResult> {
        if !self.options.enabled {
            return Ok(EvaluateResult::passthrough(&req.candidates));
        }
        let now = req.now.unwrap_or_else(Utc::now);

        let scoped = self
            .load_rules(ctx, req.org_id, &req.namespace, &req.surface, now)
            .await?;
        let rules: Vec<Rule> = scoped
            .iter()
            .filter(|rule| rule.applies_to_segment(&req.segment) && rule.is_active_at(now))
            .cloned()
            .collect();

        let evaluator = Evaluator::new(
            self.options.max_pin_slots,
            prefixes_or_default(&req.brand_tag_prefixes, DEFAULT_BRAND_PREFIXES),
            prefixes_or_default(&req.category_tag_prefixes, DEFAULT_CATEGORY_PREFIXES),
        );
        evaluator.apply(ctx, rules, req)
    }

    /// Drops cached rules for the scope. An empty surface drops every surface
    /// of the namespace. Returns the number of entries removed.
    pub fn invalidate(&self, org_id: Uuid, namespace: &str, surface: &str) -> usize {
        let removed = if surface.trim().is_empty() {
            let prefix = format!("{}|{}|", org_id, namespace.trim());
            self.cache.invalidate(|key| key.starts_with(&prefix))
        } else {
            let key = cache_key(org_id, namespace, surface);
            self.cache.invalidate(|k| *k == key)
        };
        debug!(%org_id, namespace, surface, removed, "Invalidated rules cache");
        removed
    }

    async fn load_rules(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        surface: &str,
        now: DateTime<Utc>,
    ) -> Result<Arc<Vec<Rule>>> {
        let key = cache_key(org_id, namespace, surface);
        if let Some(rules) = self.cache.get(&key) {
            return Ok(rules);
        }

        let rules = self
            .store
            .list_active_rules_for_scope(ctx, org_id, namespace.trim(), surface.trim(), None, now)
            .await?;
        debug!(%org_id, namespace, surface, count = rules.len(), "Loaded rules");
        let rules = Arc::new(rules);
        self.cache
            .set(key, Arc::clone(&rules), self.options.refresh_interval);
        Ok(rules)
    }
}

fn cache_key(org_id: Uuid, namespace: &str, surface: &str) -> String {
    format!("{}|{}|{}", org_id, namespace.trim(), surface.trim())
}

fn prefixes_or_default(prefixes: &[String], defaults: &[&str]) -> Vec<String> {
    if prefixes.iter().any(|p| !p.trim().is_empty()) {
        prefixes.to_vec()
    } else {
        defaults.iter().map(|p| p.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candidate;
    use crate::services::rules::{RuleAction, RuleTarget};
    use crate::services::rules::JsonRulesStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        rules: Vec<Rule>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RulesStore for CountingStore {
        async fn list_active_rules_for_scope(
            &self,
            _ctx: &RequestContext,
            _org_id: Uuid,
            _namespace: &str,
            _surface: &str,
            _segment: Option<&str>,
            _at: DateTime<Utc>,
        ) -> Result<Vec<Rule>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rules.clone())
        }
    }

    fn manager(rules: Vec<Rule>, enabled: bool) -> (RulesManager, Arc<CountingStore>) {
        let store = Arc::new(CountingStore {
            rules,
            calls: AtomicUsize::new(0),
        });
        let options = RulesManagerOptions {
            enabled,
            ..Default::default()
        };
        (RulesManager::new(store.clone(), options), store)
    }

    fn request(segment: &str) -> EvaluateRequest {
        EvaluateRequest {
            org_id: Uuid::from_u128(1),
            namespace: "default".into(),
            surface: "home".into(),
            segment: segment.into(),
            candidates: vec![Candidate::new("a", 1.0), Candidate::new("b", 0.5)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_manager_passes_through() {
        let block = Rule::new(Uuid::from_u128(2), Uuid::from_u128(1), RuleAction::Block, RuleTarget::Item(vec!["a".into()]));
        let (manager, store) = manager(vec![block], false);
        let result = manager.evaluate(&RequestContext::new(), &request("")).await.unwrap();
        assert_eq!(result.candidates.len(), 2);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rules_cached_until_invalidated() {
        let (manager, store) = manager(Vec::new(), true);
        let ctx = RequestContext::new();
        manager.evaluate(&ctx, &request("")).await.unwrap();
        manager.evaluate(&ctx, &request("vip")).await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        assert_eq!(manager.invalidate(Uuid::from_u128(1), "default", ""), 1);
        manager.evaluate(&ctx, &request("")).await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_segment_rules_filtered_per_request() {
        let mut block = Rule::new(
            Uuid::from_u128(2),
            Uuid::from_u128(1),
            RuleAction::Block,
            RuleTarget::Item(vec!["a".into()]),
        );
        block.segment_id = "vip".into();
        let (manager, _) = manager(vec![block], true);
        let ctx = RequestContext::new();

        let plain = manager.evaluate(&ctx, &request("")).await.unwrap();
        assert_eq!(plain.candidates.len(), 2);

        let vip = manager.evaluate(&ctx, &request("VIP")).await.unwrap();
        assert_eq!(vip.candidates.len(), 1);
        assert!(vip.item_effects["a"].blocked);
    }

    #[tokio::test]
    async fn test_rule_window_follows_request_clock() {
        let org = Uuid::from_u128(1);
        let store = JsonRulesStore::new();
        store.put_document(
            org,
            r#"{"rules":[{"action":"pin","items":["x"],"surface":"home","valid_from":"2024-01-01T00:00:00Z","valid_until":"2024-02-01T00:00:00Z"}]}"#,
        );
        let options = RulesManagerOptions {
            enabled: true,
            ..Default::default()
        };
        let manager = RulesManager::new(Arc::new(store), options);

        let mut req = request("");
        req.candidates.push(Candidate::new("x", 0.1));
        req.now = Some("2024-01-15T00:00:00Z".parse().unwrap());
        let result = manager.evaluate(&RequestContext::new(), &req).await.unwrap();

        let pinned: Vec<&str> = result.pinned.iter().map(|p| p.item_id.as_str()).collect();
        assert_eq!(pinned, vec!["x"]);
        assert!(result.item_effects["x"].pinned);
    }
}
