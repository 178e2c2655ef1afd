//! Engine store served from published artifacts
//!
//! Each read resolves the scope's manifest, loads the referenced artifact
//! and answers from it. A non-default namespace without data falls back to
//! `default`. Tags come from an optional [`TagStore`].

use crate::error::{EngineError, Result};
use crate::models::{Candidate, ItemTags, PopConstraints};
use crate::services::artifacts::{ArtifactLoader, CachedPayload};
use crate::store::{EngineStore, RequestContext, TagStore};
use artifact_schema::{
    normalize_tags, Artifact, ContentSimPayload, CoocPayload, CoocRow, ImplicitPayload,
    PopularityItem, PopularityPayload, SessionSeqPayload, UserItems,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_NAMESPACE: &str = "default";

pub struct ArtifactAlgoStore {
    loader: Arc<ArtifactLoader>,
    tag_store: Option<Arc<dyn TagStore>>,
}

impl ArtifactAlgoStore {
    pub fn new(loader: Arc<ArtifactLoader>) -> Self {
        Self {
            loader,
            tag_store: None,
        }
    }

    pub fn with_tag_store(mut self, tag_store: Arc<dyn TagStore>) -> Self {
        self.tag_store = Some(tag_store);
        self
    }

    /// Artifact of type `P` for the scope, `None` when the manifest or its
    /// entry is missing.
    async fn load_scoped<P: CachedPayload>(
        &self,
        tenant: &str,
        namespace: &str,
    ) -> Result<Option<Arc<Artifact<P>>>> {
        let Some(manifest) = self.loader.load_manifest(tenant, namespace).await? else {
            return Ok(None);
        };
        match manifest.uri(P::TYPE) {
            Some(uri) => self.loader.load::<P>(uri).await,
            None => Ok(None),
        }
    }

    /// Like [`Self::load_scoped`], retrying `default` when the namespace has
    /// no artifact. Returns the namespace that answered.
    async fn load_with_fallback<P: CachedPayload>(
        &self,
        tenant: &str,
        namespace: &str,
    ) -> Result<Option<(Arc<Artifact<P>>, String)>> {
        if let Some(artifact) = self.load_scoped::<P>(tenant, namespace).await? {
            return Ok(Some((artifact, namespace.to_string())));
        }
        if namespace == DEFAULT_NAMESPACE {
            return Ok(None);
        }
        debug!(tenant, namespace, artifact_type = %P::TYPE, "Falling back to default namespace");
        Ok(self
            .load_scoped::<P>(tenant, DEFAULT_NAMESPACE)
            .await?
            .map(|artifact| (artifact, DEFAULT_NAMESPACE.to_string())))
    }

    async fn filter_popularity(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        k: usize,
        items: &[PopularityItem],
        constraints: &PopConstraints,
    ) -> Result<Vec<Candidate>> {
        let exclude: HashSet<&str> = constraints
            .exclude_item_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .collect();
        let include_tags = normalize_tags(&constraints.include_tags_any);
        let needs_tags = constraints.needs_tags();

        let mut tags: HashMap<String, ItemTags> = HashMap::new();
        if needs_tags {
            let Some(tag_store) = &self.tag_store else {
                return Ok(Vec::new());
            };
            let ids = unique_ids(items.iter().map(|i| i.item_id.as_str()));
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            tags = tag_store.list_items_tags(ctx, org_id, namespace, &ids).await?;
        }

        let mut out = Vec::with_capacity(k.min(items.len()));
        let mut seen: HashSet<&str> = HashSet::with_capacity(items.len());
        for item in items {
            let id = item.item_id.trim();
            if id.is_empty() || !seen.insert(id) || exclude.contains(id) {
                continue;
            }
            if needs_tags {
                let Some(info) = tags.get(id) else {
                    continue;
                };
                if !passes_pop_constraints(info, &include_tags, constraints) {
                    continue;
                }
            }
            out.push(Candidate::new(id, item.value()));
            if out.len() >= k {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl TagStore for ArtifactAlgoStore {
    async fn list_items_tags(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        item_ids: &[String],
    ) -> Result<HashMap<String, ItemTags>> {
        match &self.tag_store {
            Some(store) => store.list_items_tags(ctx, org_id, namespace, item_ids).await,
            None => Ok(HashMap::new()),
        }
    }
}

#[async_trait]
impl EngineStore for ArtifactAlgoStore {
    async fn popularity_top_k(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        _half_life_days: f64,
        k: usize,
        constraints: &PopConstraints,
    ) -> Result<Vec<Candidate>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let Some(tenant) = tenant_key(ctx, org_id) else {
            return Ok(Vec::new());
        };
        ctx.check()?;
        let mut namespace = normalize_namespace(namespace);

        let mut items = self
            .load_scoped::<PopularityPayload>(&tenant, &namespace)
            .await?
            .map(|a| a.payload.items.clone())
            .unwrap_or_default();
        if items.is_empty() && namespace != DEFAULT_NAMESPACE {
            let fallback = self
                .load_scoped::<PopularityPayload>(&tenant, DEFAULT_NAMESPACE)
                .await?
                .map(|a| a.payload.items.clone())
                .unwrap_or_default();
            if !fallback.is_empty() {
                namespace = DEFAULT_NAMESPACE.to_string();
                items = fallback;
            }
        }
        if items.is_empty() {
            return Ok(Vec::new());
        }

        items.sort_by(|a, b| {
            b.value()
                .total_cmp(&a.value())
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        self.filter_popularity(ctx, org_id, &namespace, k, &items, constraints)
            .await
    }

    async fn cooccurrence_top_k_within(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        anchor: &str,
        k: usize,
        _since: DateTime<Utc>,
    ) -> Result<Vec<Candidate>> {
        let anchor = anchor.trim();
        if k == 0 || anchor.is_empty() {
            return Ok(Vec::new());
        }
        let tenant = tenant_key(ctx, org_id).ok_or(EngineError::FeatureUnavailable)?;
        ctx.check()?;
        let namespace = normalize_namespace(namespace);

        let (cooc, answered) = self
            .load_with_fallback::<CoocPayload>(&tenant, &namespace)
            .await?
            .ok_or(EngineError::FeatureUnavailable)?;
        let out = select_cooc_neighbors(&cooc.payload.neighbors, anchor, k);
        if !out.is_empty() || answered == DEFAULT_NAMESPACE {
            return Ok(out);
        }

        if let Some(fallback) = self
            .load_scoped::<CoocPayload>(&tenant, DEFAULT_NAMESPACE)
            .await?
        {
            let fallback_out = select_cooc_neighbors(&fallback.payload.neighbors, anchor, k);
            if !fallback_out.is_empty() {
                return Ok(fallback_out);
            }
        }
        Ok(out)
    }

    async fn collaborative_top_k(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        user_id: &str,
        k: usize,
        exclude: &[String],
    ) -> Result<Vec<Candidate>> {
        let user_id = user_id.trim();
        if k == 0 || user_id.is_empty() {
            return Ok(Vec::new());
        }
        let tenant = tenant_key(ctx, org_id).ok_or(EngineError::FeatureUnavailable)?;
        ctx.check()?;
        let (implicit, _) = self
            .load_with_fallback::<ImplicitPayload>(&tenant, &normalize_namespace(namespace))
            .await?
            .ok_or(EngineError::FeatureUnavailable)?;
        Ok(user_top_k(&implicit.payload.users, user_id, k, exclude))
    }

    async fn content_similarity_top_k(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        tags: &[String],
        k: usize,
        exclude: &[String],
    ) -> Result<Vec<Candidate>> {
        let tags = normalize_tags(tags);
        if k == 0 || tags.is_empty() {
            return Ok(Vec::new());
        }
        let tenant = tenant_key(ctx, org_id).ok_or(EngineError::FeatureUnavailable)?;
        ctx.check()?;
        let (content, _) = self
            .load_with_fallback::<ContentSimPayload>(&tenant, &normalize_namespace(namespace))
            .await?
            .ok_or(EngineError::FeatureUnavailable)?;

        let exclude = exclude_set(exclude);
        let wanted: HashSet<&str> = tags.iter().map(String::as_str).collect();
        let mut items: Vec<Candidate> = content
            .payload
            .items
            .iter()
            .filter_map(|item| {
                let id = item.item_id.trim();
                if id.is_empty() || exclude.contains(id) {
                    return None;
                }
                let overlap = normalize_tags(&item.tags)
                    .iter()
                    .filter(|t| wanted.contains(t.as_str()))
                    .count();
                (overlap > 0).then(|| Candidate::new(id, overlap as f64))
            })
            .collect();
        sort_and_truncate(&mut items, k);
        Ok(items)
    }

    async fn session_sequence_top_k(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        user_id: &str,
        _lookback: usize,
        _horizon_minutes: f64,
        exclude: &[String],
        k: usize,
    ) -> Result<Vec<Candidate>> {
        let user_id = user_id.trim();
        if k == 0 || user_id.is_empty() {
            return Ok(Vec::new());
        }
        let tenant = tenant_key(ctx, org_id).ok_or(EngineError::FeatureUnavailable)?;
        ctx.check()?;
        let (session, _) = self
            .load_with_fallback::<SessionSeqPayload>(&tenant, &normalize_namespace(namespace))
            .await?
            .ok_or(EngineError::FeatureUnavailable)?;
        Ok(user_top_k(&session.payload.users, user_id, k, exclude))
    }

    async fn list_items_availability(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        item_ids: &[String],
    ) -> Result<HashMap<String, bool>> {
        Ok(item_ids
            .iter()
            .filter(|id| !id.is_empty())
            .map(|id| (id.clone(), true))
            .collect())
    }
}

/// Tenant override from the context, else the org id when set.
fn tenant_key(ctx: &RequestContext, org_id: Uuid) -> Option<String> {
    if let Some(tenant) = ctx.tenant_id() {
        return Some(tenant.to_string());
    }
    (!org_id.is_nil()).then(|| org_id.to_string())
}

fn normalize_namespace(namespace: &str) -> String {
    match namespace.trim() {
        "" => DEFAULT_NAMESPACE.to_string(),
        ns => ns.to_string(),
    }
}

fn unique_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.map(str::trim)
        .filter(|id| !id.is_empty() && seen.insert(*id))
        .map(str::to_string)
        .collect()
}

fn exclude_set(exclude: &[String]) -> HashSet<&str> {
    exclude
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect()
}

fn passes_pop_constraints(info: &ItemTags, include_tags: &[String], c: &PopConstraints) -> bool {
    if !include_tags.is_empty() {
        let item_tags = normalize_tags(&info.tags);
        if !item_tags.iter().any(|t| include_tags.contains(t)) {
            return false;
        }
    }
    if let Some(min) = c.min_price {
        if !matches!(info.price, Some(price) if price >= min) {
            return false;
        }
    }
    if let Some(max) = c.max_price {
        if !matches!(info.price, Some(price) if price <= max) {
            return false;
        }
    }
    if let Some(after) = c.created_after {
        if !matches!(info.created_at, Some(created) if created >= after) {
            return false;
        }
    }
    true
}

fn select_cooc_neighbors(rows: &[CoocRow], anchor: &str, k: usize) -> Vec<Candidate> {
    let Some(row) = rows.iter().find(|row| row.item_id == anchor) else {
        return Vec::new();
    };
    let mut neighbors: Vec<_> = row.neighbors.iter().collect();
    neighbors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.item_id.cmp(&b.item_id)));

    let mut seen = HashSet::new();
    neighbors
        .into_iter()
        .filter(|n| {
            let id = n.item_id.trim();
            !id.is_empty() && seen.insert(id)
        })
        .take(k)
        .map(|n| Candidate::new(n.item_id.trim(), n.count as f64))
        .collect()
}

fn user_top_k(users: &[UserItems], user_id: &str, k: usize, exclude: &[String]) -> Vec<Candidate> {
    let Some(user) = users.iter().find(|u| u.user_id.trim() == user_id) else {
        return Vec::new();
    };
    let exclude = exclude_set(exclude);
    let mut items: Vec<Candidate> = user
        .items
        .iter()
        .filter(|e| !e.item_id.is_empty() && e.score > 0.0 && !exclude.contains(e.item_id.as_str()))
        .map(|e| Candidate::new(e.item_id.clone(), e.score))
        .collect();
    sort_and_truncate(&mut items, k);
    items
}

/// Score descending, item id ascending, then the first `k`.
pub(crate) fn sort_and_truncate(items: &mut Vec<Candidate>, k: usize) {
    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    items.truncate(k);
}
