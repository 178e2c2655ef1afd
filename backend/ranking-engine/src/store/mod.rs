//! Persistence seams consumed by the engine
//!
//! Only popularity and tag lookups are required. Every other read has a
//! default body returning `EngineError::FeatureUnavailable`, which the engine
//! records as signal status instead of failing the request.

use crate::error::{EngineError, Result};
use crate::models::{Candidate, ItemTags, PopConstraints};
use crate::services::rules::Rule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-call context: cancellation plus an optional tenant override.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    tenant_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with `Cancelled` once the token fires.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

/// Injectable time source
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[async_trait]
pub trait TagStore: Send + Sync {
    /// Tag records for `item_ids`; unknown items are absent from the map.
    async fn list_items_tags(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        item_ids: &[String],
    ) -> Result<HashMap<String, ItemTags>>;
}

#[async_trait]
pub trait EngineStore: TagStore {
    /// Up to `k` items by popularity, ordered by score descending.
    async fn popularity_top_k(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        half_life_days: f64,
        k: usize,
        constraints: &PopConstraints,
    ) -> Result<Vec<Candidate>>;

    /// Up to `k` items co-visited with `anchor` since the cutoff. Anchor excluded.
    async fn cooccurrence_top_k_within(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        _anchor: &str,
        _k: usize,
        _since: DateTime<Utc>,
    ) -> Result<Vec<Candidate>> {
        Err(EngineError::FeatureUnavailable)
    }

    /// Nearest neighbours by embedding; scores are similarities in [0,1].
    async fn similar_by_embedding_top_k(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        _anchor: &str,
        _k: usize,
    ) -> Result<Vec<Candidate>> {
        Err(EngineError::FeatureUnavailable)
    }

    async fn collaborative_top_k(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        _user_id: &str,
        _k: usize,
        _exclude: &[String],
    ) -> Result<Vec<Candidate>> {
        Err(EngineError::FeatureUnavailable)
    }

    async fn content_similarity_top_k(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        _tags: &[String],
        _k: usize,
        _exclude: &[String],
    ) -> Result<Vec<Candidate>> {
        Err(EngineError::FeatureUnavailable)
    }

    #[allow(clippy::too_many_arguments)]
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
        Err(EngineError::FeatureUnavailable)
    }

    async fn list_items_availability(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        _item_ids: &[String],
    ) -> Result<HashMap<String, bool>> {
        Err(EngineError::FeatureUnavailable)
    }

    /// Item ids the user interacted with via `event_types` since the cutoff.
    async fn list_user_events_since(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        _user_id: &str,
        _since: DateTime<Utc>,
        _event_types: &[i64],
    ) -> Result<Vec<String>> {
        Err(EngineError::FeatureUnavailable)
    }

    /// Distinct recent item ids, most recent first.
    async fn list_user_recent_item_ids(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        _user_id: &str,
        _since: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<String>> {
        Err(EngineError::FeatureUnavailable)
    }

    /// Weighted tag preferences over the window, top `top_n` tags.
    async fn build_user_tag_profile(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        _user_id: &str,
        _window_days: f64,
        _top_n: usize,
    ) -> Result<HashMap<String, f64>> {
        Err(EngineError::FeatureUnavailable)
    }
}

#[async_trait]
pub trait RulesStore: Send + Sync {
    /// Enabled rules for the scope valid at `at`. `segment: None` returns
    /// rules for every segment.
    async fn list_active_rules_for_scope(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        surface: &str,
        segment: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Vec<Rule>>;
}
