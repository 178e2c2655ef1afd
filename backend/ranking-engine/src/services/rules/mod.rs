//! Merchandising rules: typed rule model, evaluator, cached manager and a
//! tolerant decoder for tenant-authored JSON.

mod decoder;
mod evaluator;
mod manager;
mod store;

pub use decoder::{decode_rules, parse_rule_payloads, RuleScope};
pub use evaluator::Evaluator;
pub(crate) use evaluator::{match_structured, to_matchers};
pub use manager::RulesManager;
pub use store::JsonRulesStore;

use crate::models::{Candidate, ItemTags};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// What a rule does to matched items. Precedence: block > pin > boost.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    Block,
    Pin {
        /// Per-rule pin limit; `None` means only the global slot limit applies
        #[serde(skip_serializing_if = "Option::is_none")]
        max_pins: Option<i64>,
    },
    Boost {
        boost_value: f64,
    },
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Block => "BLOCK",
            RuleAction::Pin { .. } => "PIN",
            RuleAction::Boost { .. } => "BOOST",
        }
    }
}

/// Which items a rule matches
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "target_type", content = "target", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleTarget {
    Item(Vec<String>),
    Tag(String),
    Brand(String),
    Category(String),
}

impl RuleTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleTarget::Item(_) => "ITEM",
            RuleTarget::Tag(_) => "TAG",
            RuleTarget::Brand(_) => "BRAND",
            RuleTarget::Category(_) => "CATEGORY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub rule_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_override_id: Option<Uuid>,
    pub org_id: Uuid,
    pub namespace: String,
    pub surface: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(flatten)]
    pub action: RuleAction,
    #[serde(flatten)]
    pub target: RuleTarget,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub segment_id: String,
    pub priority: i64,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Rule {
    /// Enabled rule scoped to the org with every optional field empty.
    pub fn new(rule_id: Uuid, org_id: Uuid, action: RuleAction, target: RuleTarget) -> Self {
        Self {
            rule_id,
            manual_override_id: None,
            org_id,
            namespace: "default".to_string(),
            surface: String::new(),
            name: String::new(),
            description: String::new(),
            action,
            target,
            segment_id: String::new(),
            priority: 0,
            enabled: true,
            valid_from: None,
            valid_until: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_manual_override(mut self, override_id: Uuid) -> Self {
        self.manual_override_id = Some(override_id);
        self
    }

    /// Rules without a segment apply everywhere.
    pub fn applies_to_segment(&self, segment: &str) -> bool {
        let own = self.segment_id.trim();
        own.is_empty() || own.eq_ignore_ascii_case(segment.trim())
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        if matches!(self.valid_from, Some(from) if at < from) {
            return false;
        }
        !matches!(self.valid_until, Some(until) if at >= until)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EvaluateRequest {
    pub org_id: Uuid,
    pub namespace: String,
    pub surface: String,
    pub segment: String,
    pub candidates: Vec<Candidate>,
    pub item_tags: HashMap<String, ItemTags>,
    pub now: Option<DateTime<Utc>>,
    pub brand_tag_prefixes: Vec<String>,
    pub category_tag_prefixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostDetail {
    pub rule_id: Uuid,
    pub delta: f64,
}

/// Net effect of every rule on one item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemEffect {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_rules: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pin_rules: Vec<Uuid>,
    #[serde(default)]
    pub boost_delta: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boost_rules: Vec<BoostDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinnedItem {
    pub item_id: String,
    pub score: f64,
    pub from_candidates: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub rule_id: Uuid,
    pub action: String,
    pub target: String,
    pub item_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_override_id: Option<Uuid>,
}

/// Per-manual-override telemetry for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideHit {
    pub override_id: Uuid,
    pub rule_id: Uuid,
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boosted_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub served_items: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluateResult {
    /// Surviving candidates, blocked and pinned items removed
    pub candidates: Vec<Candidate>,
    /// Pinned items in pin order
    pub pinned: Vec<PinnedItem>,
    pub item_effects: HashMap<String, ItemEffect>,
    /// Sorted, deduplicated rule reason tokens per item
    pub reason_tags: HashMap<String, Vec<String>>,
    /// Sorted by override id
    pub override_hits: Vec<OverrideHit>,
    pub matches: Vec<Match>,
    pub evaluated_rule_ids: Vec<Uuid>,
}

impl EvaluateResult {
    /// Candidates untouched, no effects.
    pub fn passthrough(candidates: &[Candidate]) -> Self {
        Self {
            candidates: candidates.to_vec(),
            ..Default::default()
        }
    }

    pub fn override_hit_mut(&mut self, rule_id: Uuid) -> Option<&mut OverrideHit> {
        self.override_hits.iter_mut().find(|h| h.rule_id == rule_id)
    }
}
