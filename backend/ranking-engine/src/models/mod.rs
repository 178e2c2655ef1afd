mod explain;
mod trace;

pub use explain::{
    BlendContribution, BlendExplain, BlendRaw, CapUsage, CapsExplain, ExplainBlock, MmrExplain,
    PersonalizationExplain, PersonalizationExplainRaw,
};
pub use trace::{PolicySummary, Signal, SignalStatus, SourceMetric, TraceData};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Placeholder anchor reported when the user has no usable history
pub const NO_RECENT_ACTIVITY: &str = "(no_recent_activity)";

pub const MODEL_VERSION_POPULARITY: &str = "popularity_v1";
pub const MODEL_VERSION_BLEND: &str = "blend_v1";

/// Item id with a source-specific score, as returned by every store call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub item_id: String,
    pub score: f64,
}

impl Candidate {
    pub fn new(item_id: impl Into<String>, score: f64) -> Self {
        Self {
            item_id: item_id.into(),
            score,
        }
    }
}

/// Catalog metadata used by filters, caps and rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemTags {
    pub item_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ItemTags {
    pub fn new<I, S>(item_id: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            item_id: item_id.into(),
            tags: tags.into_iter().map(|t| t.as_ref().to_string()).collect(),
            price: None,
            created_at: None,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Copy with tags normalized and deduplicated.
    pub fn normalized(&self) -> Self {
        Self {
            item_id: self.item_id.clone(),
            tags: artifact_schema::normalize_tags(&self.tags),
            price: self.price,
            created_at: self.created_at,
        }
    }
}

/// Filters pushed down to the popularity source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopConstraints {
    pub include_tags_any: Vec<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub created_after: Option<DateTime<Utc>>,
    pub exclude_item_ids: Vec<String>,
}

impl PopConstraints {
    /// True when any filter needs item metadata.
    pub fn needs_tags(&self) -> bool {
        !artifact_schema::normalize_tags(&self.include_tags_any).is_empty()
            || self.min_price.is_some()
            || self.max_price.is_some()
            || self.created_after.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlendWeights {
    #[serde(default)]
    pub pop: f64,
    #[serde(default)]
    pub cooc: f64,
    #[serde(default, alias = "sim")]
    pub similarity: f64,
}

impl BlendWeights {
    pub fn new(pop: f64, cooc: f64, similarity: f64) -> Self {
        Self {
            pop,
            cooc,
            similarity,
        }
    }

    pub fn model_version(&self) -> &'static str {
        if self.cooc == 0.0 && self.similarity == 0.0 {
            MODEL_VERSION_POPULARITY
        } else {
            MODEL_VERSION_BLEND
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplainLevel {
    #[default]
    Tags,
    #[serde(alias = "numeric")]
    Summary,
    Full,
}

impl ExplainLevel {
    /// Lenient parse; unknown values fall back to `tags`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "summary" | "numeric" => ExplainLevel::Summary,
            "full" => ExplainLevel::Full,
            _ => ExplainLevel::Tags,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateFilter {
    #[serde(alias = "include")]
    pub include_ids: Vec<String>,
    #[serde(alias = "exclude")]
    pub exclude_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// Item must carry at least one of these tags
    #[serde(alias = "include_tags_any")]
    pub required_tags: Vec<String>,
    pub forbidden_tags: Vec<String>,
    pub max_per_tag: BTreeMap<String, usize>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub created_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub include_reasons: bool,
    pub explain_level: ExplainLevel,
    pub seed: Option<u64>,
    pub include_trace: bool,
}

/// Normalized recommendation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Request {
    pub org_id: Uuid,
    pub namespace: String,
    pub surface: String,
    pub segment: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub anon_id: Option<String>,
    pub k: i64,
    pub anchors: Vec<String>,
    /// Inject anchors into the popularity pool and promote them in the result
    pub inject_anchors: bool,
    pub candidates: CandidateFilter,
    pub constraints: Constraints,
    pub blend: Option<BlendWeights>,
    pub options: RequestOptions,
    pub starter_profile: HashMap<String, f64>,
    pub starter_blend_weight: f64,
    pub recent_event_count: i64,
}

impl Request {
    pub fn new(org_id: Uuid, surface: impl Into<String>, k: i64) -> Self {
        Self {
            org_id,
            namespace: "default".to_string(),
            surface: surface.into(),
            k,
            ..Default::default()
        }
    }

    /// Effective user key: user id, else session id, else anonymous id.
    pub fn user_key(&self) -> Option<String> {
        [&self.user_id, &self.session_id, &self.anon_id]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn namespace_or_default(&self) -> String {
        let ns = self.namespace.trim();
        if ns.is_empty() {
            "default".to_string()
        } else {
            ns.to_string()
        }
    }

    pub fn pop_constraints(&self) -> PopConstraints {
        PopConstraints {
            include_tags_any: self.constraints.required_tags.clone(),
            min_price: self.constraints.min_price,
            max_price: self.constraints.max_price,
            created_after: self.constraints.created_after,
            exclude_item_ids: self.candidates.exclude_ids.clone(),
        }
    }
}

/// Maps a tenant string onto an org id: UUIDs parse verbatim, anything else
/// becomes a v5 UUID in the OID namespace.
pub fn tenant_to_uuid(tenant: &str) -> Uuid {
    let tenant = tenant.trim();
    Uuid::parse_str(tenant).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, tenant.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    pub item_id: String,
    pub score: f64,
    pub rank: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain: Option<ExplainBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    SignalUnavailable,
    SignalPartial,
    ConstraintsFiltered,
    CandidatesIncludeFiltered,
    CandidatesIncludeEmpty,
    RulePinInjected,
    TagLookupFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub code: WarningCode,
    pub detail: String,
}

impl Warning {
    pub fn new(code: WarningCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub model_version: String,
    pub items: Vec<ScoredItem>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub segment: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceData>,
}

impl Response {
    pub fn item_ids(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.item_id.as_str()).collect()
    }

    pub(crate) fn rerank(&mut self) {
        for (idx, item) in self.items.iter_mut().enumerate() {
            item.rank = idx + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_key_precedence() {
        let mut req = Request::new(Uuid::nil(), "home", 10);
        assert_eq!(req.user_key(), None);

        req.anon_id = Some(" anon ".into());
        assert_eq!(req.user_key().as_deref(), Some("anon"));

        req.session_id = Some("sess".into());
        req.user_id = Some("  ".into());
        assert_eq!(req.user_key().as_deref(), Some("sess"));
    }

    #[test]
    fn test_tenant_to_uuid() {
        let id = Uuid::new_v4();
        assert_eq!(tenant_to_uuid(&id.to_string()), id);
        assert_eq!(tenant_to_uuid("acme"), tenant_to_uuid(" acme "));
        assert_ne!(tenant_to_uuid("acme"), Uuid::nil());
    }

    #[test]
    fn test_explain_level_aliases() {
        assert_eq!(ExplainLevel::parse("numeric"), ExplainLevel::Summary);
        assert_eq!(ExplainLevel::parse("FULL"), ExplainLevel::Full);
        assert_eq!(ExplainLevel::parse("bogus"), ExplainLevel::Tags);
        let level: ExplainLevel = serde_json::from_str("\"numeric\"").unwrap();
        assert_eq!(level, ExplainLevel::Summary);
    }

    #[test]
    fn test_model_version_for_weights() {
        assert_eq!(BlendWeights::new(1.0, 0.0, 0.0).model_version(), "popularity_v1");
        assert_eq!(BlendWeights::new(1.0, 0.2, 0.0).model_version(), "blend_v1");
    }
}
