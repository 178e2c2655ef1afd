use serde::{Deserialize, Serialize};

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

fn is_zero_usize(value: &usize) -> bool {
    *value == 0
}

/// Weighted contribution of each signal to the blended score
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlendContribution {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pop: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cooc: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub similarity: f64,
}

/// Unnormalized signal values (full explain only)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlendRaw {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pop: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cooc: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlendExplain {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub alpha: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub beta: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub gamma: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pop_norm: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cooc_norm: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub similarity_norm: f64,
    #[serde(rename = "contrib")]
    pub contributions: BlendContribution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<BlendRaw>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonalizationExplainRaw {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub profile_boost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonalizationExplain {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub overlap: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub boost_multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<PersonalizationExplainRaw>,
}

/// Diversity diagnostics recorded for each item MMR picked
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MmrExplain {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub lambda: f64,
    #[serde(default, rename = "max_sim", skip_serializing_if = "is_zero")]
    pub max_similarity: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub penalty: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub relevance: f64,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub rank: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapUsage {
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsExplain {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<CapUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<CapUsage>,
}

impl CapsExplain {
    pub fn is_empty(&self) -> bool {
        self.brand.is_none() && self.category.is_none()
    }
}

/// Per-item structured explanation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplainBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blend: Option<BlendExplain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personalization: Option<PersonalizationExplain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmr: Option<MmrExplain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caps: Option<CapsExplain>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anchors: Vec<String>,
}

impl ExplainBlock {
    pub fn is_empty(&self) -> bool {
        self.blend.is_none()
            && self.personalization.is_none()
            && self.mmr.is_none()
            && self.caps.is_none()
            && self.anchors.is_empty()
    }
}
