use super::Candidate;
use crate::services::rules::{ItemEffect, Match, OverrideHit, PinnedItem};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Scoring or retrieval signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Popularity,
    Cooc,
    Embedding,
    Collaborative,
    Content,
    Session,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Popularity => "popularity",
            Signal::Cooc => "cooc",
            Signal::Embedding => "embedding",
            Signal::Collaborative => "collaborative",
            Signal::Content => "content",
            Signal::Session => "session",
        }
    }

    /// Semantic reason token emitted when this signal drove an item
    pub fn reason(&self) -> &'static str {
        match self {
            Signal::Popularity => "recent_popularity",
            Signal::Cooc => "co_visitation",
            Signal::Embedding => "embedding_similarity",
            Signal::Collaborative => "collaborative",
            Signal::Content => "content_similarity",
            Signal::Session => "session_sequence",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Availability of a signal during one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalStatus {
    pub available: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetric {
    pub input: usize,
    pub output: usize,
}

/// Enforcement counters for constraints and rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub total_candidates: usize,
    pub explicit_exclude_hits: usize,
    pub recent_event_exclude_hits: usize,
    pub after_exclusions: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraint_include_tags: Vec<String>,
    pub constraint_filtered_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraint_filtered_ids: Vec<String>,
    pub after_constraint_filters: usize,
    pub rule_block_count: usize,
    pub rule_pin_count: usize,
    pub rule_boost_count: usize,
    pub rule_boost_injected: usize,
    pub rule_block_exposure: usize,
    pub rule_boost_exposure: usize,
    pub rule_pin_exposure: usize,
    pub after_rules: usize,
    pub final_count: usize,
    pub constraint_leak_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraint_leak_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constraint_leak_by_reason: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rule_block_exposure_by_rule: BTreeMap<String, usize>,

    #[serde(skip)]
    pub(crate) constraint_filtered_lookup: HashSet<String>,
    #[serde(skip)]
    pub constraint_filtered_reasons: HashMap<String, String>,
}

/// Algorithm internals captured for audit and debugging
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceData {
    pub k: usize,
    pub model_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anchors: Vec<String>,
    pub signal_status: BTreeMap<Signal, SignalStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates_pre: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_pinned: Vec<PinnedItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_matches: Vec<Match>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rule_effects: BTreeMap<String, ItemEffect>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_evaluated: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub override_hits: Vec<OverrideHit>,
    pub policy_summary: PolicySummary,
    pub source_metrics: BTreeMap<String, SourceMetric>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reasons: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub starter_profile: BTreeMap<String, f64>,
    pub starter_blend_weight: f64,
    pub recent_event_count: i64,
}
