//! Ranking engine
//!
//! One request flows through:
//! 1. validation and request caps
//! 2. recall (popularity plus personal sources, reserved-slot merge)
//! 3. exclusions, tag enrichment and constraint filters
//! 4. co-visitation / embedding signals, blending, profile boost
//! 5. merchandising rules
//! 6. MMR with brand/category caps
//! 7. response assembly, policy telemetry and post-filters

mod filters;
mod postprocess;
mod response;
mod signals;

use crate::config::EngineConfig;
use crate::error::{Result, ValidationErrors};
use crate::models::{
    PolicySummary, Request, Response, TraceData, Warning, MODEL_VERSION_POPULARITY,
    NO_RECENT_ACTIVITY,
};
use crate::services::diversity::DiversityLayer;
use crate::services::recall::RecallLayer;
use crate::services::rules::{EvaluateRequest, EvaluateResult, RulesManager};
use crate::services::scoring::{apply_blended_scoring, normalize_tag_weights, resolve_weights, CandidateData};
use crate::store::{Clock, EngineStore, RequestContext, SystemClock};
use chrono::{DateTime, Duration, Utc};
use resilience::Dispatcher;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use response::ResponseBuilder;

const ANCHOR_PROMOTION_LIMIT: usize = 3;
const MAX_WINDOW_DAYS: i64 = 36_500;

/// Multi-tenant recommendation engine
pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn EngineStore>,
    recall: RecallLayer,
    rules: Option<Arc<RulesManager>>,
    clock: Arc<dyn Clock>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl Engine {
    /// Fails with `InvalidArgument` when the config is out of bounds.
    pub fn new(config: EngineConfig, store: Arc<dyn EngineStore>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            recall: RecallLayer::new(store.clone(), config.clone()),
            config,
            store,
            rules: None,
            clock: Arc::new(SystemClock),
            dispatcher: None,
        })
    }

    pub fn with_rules(mut self, rules: Arc<RulesManager>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bounds concurrent requests; excess load fails with `Overloaded`.
    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ranked items for the request. The trace is attached only when the
    /// request asks for it.
    pub async fn recommend(&self, ctx: &RequestContext, req: &Request) -> Result<Response> {
        let (mut response, trace) = self.recommend_with_trace(ctx, req).await?;
        if req.options.include_trace {
            response.trace = Some(trace);
        }
        Ok(response)
    }

    pub async fn recommend_with_trace(
        &self,
        ctx: &RequestContext,
        req: &Request,
    ) -> Result<(Response, TraceData)> {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.run(ctx.cancel_token(), self.execute(ctx, req)).await?,
            None => self.execute(ctx, req).await,
        }
    }

    async fn execute(&self, ctx: &RequestContext, req: &Request) -> Result<(Response, TraceData)> {
        let started = Instant::now();
        validate_request(req)?;
        ctx.check()?;

        let req = self.sanitize(req);
        let k = usize::try_from(req.k).unwrap_or(0);
        let now = self.clock.now();
        let mut trace = TraceData {
            k,
            model_version: MODEL_VERSION_POPULARITY.to_string(),
            starter_profile: req.starter_profile.iter().map(|(t, w)| (t.clone(), *w)).collect(),
            starter_blend_weight: req.starter_blend_weight,
            recent_event_count: req.recent_event_count,
            ..Default::default()
        };
        if k == 0 {
            let response = Response {
                model_version: MODEL_VERSION_POPULARITY.to_string(),
                segment: req.segment.clone(),
                ..Default::default()
            };
            return Ok((response, trace));
        }

        let mut data = self.recall.recall_candidates(ctx, &req, k).await?;
        let mut policy = PolicySummary {
            total_candidates: data.candidates.len(),
            ..Default::default()
        };

        filters::apply_exclusions(self.store.as_ref(), &self.config, ctx, &req, now, &mut data, &mut policy)
            .await?;

        let ids: Vec<String> = data.candidates.iter().map(|c| c.item_id.clone()).collect();
        data.tags = self
            .store
            .list_items_tags(ctx, req.org_id, &req.namespace_or_default(), &ids)
            .await?
            .into_iter()
            .map(|(id, tags)| (id, tags.normalized()))
            .collect();

        filters::apply_constraints(&req, &mut data, &mut policy);
        data.retain_candidates();

        let weights = resolve_weights(&self.config, &req);
        signals::gather(self.store.as_ref(), &self.config, ctx, &req, now, k, &weights, &mut data).await?;
        apply_blended_scoring(&mut data, &weights);
        signals::personalize(self.store.as_ref(), &self.config, ctx, &req, &mut data).await;

        let pre_rule: HashSet<String> = data.candidates.iter().map(|c| c.item_id.clone()).collect();
        let mut rules = self.apply_rules(ctx, &req, now, &mut data, &pre_rule, &mut policy).await?;
        self.populate_missing_tags(ctx, &req, &mut data, rules.as_ref()).await;

        let model_version = match req.blend {
            Some(_) => weights.model_version(),
            None => MODEL_VERSION_POPULARITY,
        };
        trace.candidates_pre = data.candidates.clone();

        let diversity = self.diversity_layer();
        if diversity.is_active() {
            let outcome = diversity.rerank(&data.candidates, &data.tags, k);
            data.mmr = outcome.mmr;
            data.caps = outcome.caps;
            data.candidates = outcome.items;
        }

        let built = ResponseBuilder {
            req: &req,
            config: &self.config,
            weights,
            data: &data,
            rules: rules.as_ref(),
        }
        .build(k);
        let mut response = Response {
            model_version: model_version.to_string(),
            items: built.items,
            segment: req.segment.clone(),
            ..Default::default()
        };

        filters::finalize_policy(&mut policy, &response, rules.as_mut());

        if req.inject_anchors {
            postprocess::promote_anchors(&mut response, &req.anchors, ANCHOR_PROMOTION_LIMIT);
        }
        if let Some(result) = &rules {
            postprocess::promote_manual_boosts(&mut response, result);
        }

        let mut warnings: Vec<Warning> = postprocess::signal_warnings(&data.signal_status);
        if let Some(result) = &rules {
            warnings.extend(postprocess::apply_pinned_overrides(&mut response, &result.pinned, &pre_rule, k));
        }
        warnings.extend(postprocess::apply_tag_constraints(self.store.as_ref(), ctx, &req, &mut response).await);
        warnings.extend(postprocess::apply_include_filter(&mut response, &req.candidates.include_ids));
        response.warnings = warnings;
        response.rerank();

        trace.model_version = model_version.to_string();
        trace.anchors = if data.anchors.is_empty() && data.anchors_fetched {
            vec![NO_RECENT_ACTIVITY.to_string()]
        } else {
            data.anchors.clone()
        };
        trace.signal_status = data.signal_status.clone();
        trace.source_metrics = data.source_metrics.clone();
        trace.reasons = built.reasons;
        if let Some(result) = rules {
            trace.rule_pinned = result.pinned;
            trace.rule_matches = result.matches;
            trace.rule_effects = result.item_effects.into_iter().collect::<BTreeMap<_, _>>();
            trace.rule_evaluated = result.evaluated_rule_ids;
            trace.override_hits = result.override_hits;
        }
        trace.policy_summary = policy;

        debug!(
            org_id = %req.org_id,
            namespace = %req.namespace_or_default(),
            surface = %req.surface,
            k,
            items = response.items.len(),
            warnings = response.warnings.len(),
            model_version = %response.model_version,
            duration_ms = started.elapsed().as_millis() as u64,
            "Recommendation served"
        );
        Ok((response, trace))
    }

    /// Applies the configured request caps and normalizes the starter profile.
    fn sanitize(&self, req: &Request) -> Request {
        let mut req = req.clone();
        if self.config.max_k > 0 && req.k > self.config.max_k {
            req.k = self.config.max_k;
        }
        if let Ok(limit) = usize::try_from(self.config.max_exclude_ids) {
            if limit > 0 && req.candidates.exclude_ids.len() > limit {
                req.candidates.exclude_ids.truncate(limit);
            }
        }
        if req.inject_anchors {
            let mut seen = HashSet::new();
            let mut anchors: Vec<String> = req
                .anchors
                .iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty() && seen.insert(a.clone()))
                .collect();
            if let Ok(limit) = usize::try_from(self.config.max_anchors_injected) {
                if limit > 0 {
                    anchors.truncate(limit);
                }
            }
            req.anchors = anchors;
        }
        req.starter_profile = normalize_tag_weights(&req.starter_profile);
        if req.starter_blend_weight == 0.0 && !req.starter_profile.is_empty() {
            req.starter_blend_weight = self.config.profile_starter_blend_weight;
        }
        req
    }

    async fn apply_rules(
        &self,
        ctx: &RequestContext,
        req: &Request,
        now: DateTime<Utc>,
        data: &mut CandidateData,
        pre_rule: &HashSet<String>,
        policy: &mut PolicySummary,
    ) -> Result<Option<EvaluateResult>> {
        let manager = match &self.rules {
            Some(manager) if self.config.rules_enabled => manager,
            _ => {
                policy.after_rules = data.candidates.len();
                return Ok(None);
            }
        };

        let surface = match req.surface.trim() {
            "" => "default".to_string(),
            surface => surface.to_string(),
        };
        let eval = EvaluateRequest {
            org_id: req.org_id,
            namespace: req.namespace_or_default(),
            surface,
            segment: req.segment.clone(),
            candidates: data.candidates.clone(),
            item_tags: data.tags.clone(),
            now: Some(now),
            brand_tag_prefixes: self.config.brand_tag_prefixes.clone(),
            category_tag_prefixes: self.config.category_tag_prefixes.clone(),
        };
        let result = manager.evaluate(ctx, &eval).await?;

        data.candidates = result.candidates.clone();
        policy.rule_pin_count = result.pinned.len();
        policy.rule_block_count = result.item_effects.values().filter(|e| e.blocked).count();
        policy.rule_boost_count = result
            .item_effects
            .values()
            .filter(|e| e.boost_delta != 0.0)
            .count();
        policy.rule_boost_injected = data
            .candidates
            .iter()
            .filter(|c| !pre_rule.contains(&c.item_id))
            .count();
        policy.after_rules = data.candidates.len();
        Ok(Some(result))
    }

    /// Looks up tags for items that entered the pool through rules.
    async fn populate_missing_tags(
        &self,
        ctx: &RequestContext,
        req: &Request,
        data: &mut CandidateData,
        rules: Option<&EvaluateResult>,
    ) {
        let pinned = rules.into_iter().flat_map(|r| r.pinned.iter().map(|p| &p.item_id));
        let mut missing: Vec<String> = data
            .candidates
            .iter()
            .map(|c| &c.item_id)
            .chain(pinned)
            .filter(|id| !data.tags.contains_key(*id))
            .cloned()
            .collect();
        missing.sort();
        missing.dedup();
        if missing.is_empty() {
            return;
        }
        match self
            .store
            .list_items_tags(ctx, req.org_id, &req.namespace_or_default(), &missing)
            .await
        {
            Ok(found) => {
                data.tags
                    .extend(found.into_iter().map(|(id, tags)| (id, tags.normalized())));
            }
            Err(err) => warn!(error = %err, missing = missing.len(), "Tag lookup for rule items failed"),
        }
    }

    fn diversity_layer(&self) -> DiversityLayer {
        let cap = |value: i64| usize::try_from(value).unwrap_or(0);
        DiversityLayer::new(self.config.mmr_lambda)
            .with_caps(cap(self.config.brand_cap), cap(self.config.category_cap))
            .with_prefixes(&self.config.brand_tag_prefixes, &self.config.category_tag_prefixes)
    }
}

/// Field-level request checks, all failures collected.
pub fn validate_request(req: &Request) -> std::result::Result<(), ValidationErrors> {
    let mut errs = ValidationErrors::new();
    if req.org_id.is_nil() {
        errs.push("org_id", "must be set");
    }
    if req.k < 0 {
        errs.push("k", "must be >= 0");
    }
    if req.recent_event_count < 0 {
        errs.push("recent_event_count", "must be >= 0");
    }
    if !(0.0..=1.0).contains(&req.starter_blend_weight) {
        errs.push("starter_blend_weight", "must be between 0 and 1");
    }
    if let Some(blend) = &req.blend {
        for (field, value) in [
            ("blend.pop", blend.pop),
            ("blend.cooc", blend.cooc),
            ("blend.similarity", blend.similarity),
        ] {
            if value < 0.0 || value.is_nan() {
                errs.push(field, "must be >= 0");
            }
        }
    }
    if let (Some(min), Some(max)) = (req.constraints.min_price, req.constraints.max_price) {
        if min > max {
            errs.push("constraints.price", "min_price must be <= max_price");
        }
    }
    errs.into_result()
}

/// `now` minus a window in days, bounded to a sane range.
pub(crate) fn days_before(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now - Duration::days(days.clamp(0, MAX_WINDOW_DAYS))
}
