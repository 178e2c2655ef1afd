use crate::config::EngineConfig;
use crate::models::{
    BlendContribution, BlendExplain, BlendRaw, CapUsage, CapsExplain, ExplainBlock, ExplainLevel,
    MmrExplain, PersonalizationExplain, PersonalizationExplainRaw, Request, ScoredItem, Signal,
    BlendWeights, NO_RECENT_ACTIVITY,
};
use crate::services::rules::EvaluateResult;
use crate::services::scoring::CandidateData;
use crate::services::signal_store::sort_and_truncate;
use std::collections::{BTreeMap, BTreeSet, HashSet};

const REASON_DIVERSITY: &str = "diversity";
const REASON_PERSONALIZATION: &str = "personalization";

/// Assembles the ranked list from the final pool and pinned items.
pub(super) struct ResponseBuilder<'a> {
    pub req: &'a Request,
    pub config: &'a EngineConfig,
    pub weights: BlendWeights,
    pub data: &'a CandidateData,
    pub rules: Option<&'a EvaluateResult>,
}

pub(super) struct BuiltResponse {
    pub items: Vec<ScoredItem>,
    /// Reasons per served item, kept for the trace even when the request
    /// does not ask for them
    pub reasons: BTreeMap<String, Vec<String>>,
}

impl ResponseBuilder<'_> {
    /// Pinned items first in pin order, then the pool by score desc and
    /// item id asc, up to `k`.
    pub fn build(&self, k: usize) -> BuiltResponse {
        let mut ordered: Vec<(String, f64)> = Vec::with_capacity(k);
        let mut seen: HashSet<String> = HashSet::new();

        if let Some(rules) = self.rules {
            for pin in &rules.pinned {
                if ordered.len() >= k {
                    break;
                }
                if seen.insert(pin.item_id.clone()) {
                    ordered.push((pin.item_id.clone(), pin.score));
                }
            }
        }

        let mut ranked = self.data.candidates.clone();
        sort_and_truncate(&mut ranked, usize::MAX);
        for candidate in &ranked {
            if ordered.len() >= k {
                break;
            }
            if seen.insert(candidate.item_id.clone()) {
                ordered.push((candidate.item_id.clone(), candidate.score));
            }
        }

        let level = self.req.options.explain_level;
        let mut reasons = BTreeMap::new();
        let items = ordered
            .into_iter()
            .enumerate()
            .map(|(idx, (item_id, score))| {
                let item_reasons = self.reasons(&item_id);
                let explain = match level {
                    ExplainLevel::Tags => None,
                    level => self.explain(&item_id, level),
                };
                let item = ScoredItem {
                    item_id: item_id.clone(),
                    score,
                    rank: idx + 1,
                    reasons: if self.req.options.include_reasons {
                        item_reasons.clone()
                    } else {
                        Vec::new()
                    },
                    explain,
                };
                if !item_reasons.is_empty() {
                    reasons.insert(item_id, item_reasons);
                }
                item
            })
            .collect();

        BuiltResponse { items, reasons }
    }

    fn diversity_active(&self) -> bool {
        self.config.uses_mmr() || self.config.uses_caps()
    }

    /// Semantic reason tokens plus rule tokens, deduplicated and sorted.
    fn reasons(&self, item_id: &str) -> Vec<String> {
        let mut tokens: BTreeSet<String> = BTreeSet::new();
        if let Some(signals) = self.data.signals.get(item_id) {
            if self.weights.pop > 0.0 && signals.pop_raw > 0.0 {
                tokens.insert(Signal::Popularity.reason().to_string());
            }
            if self.weights.cooc > 0.0 && signals.cooc_raw > 0.0 {
                tokens.insert(Signal::Cooc.reason().to_string());
            }
            if self.weights.similarity > 0.0 {
                tokens.extend(signals.similarity_sources.iter().map(|s| s.reason().to_string()));
            }
        }
        if self.diversity_active() {
            tokens.insert(REASON_DIVERSITY.to_string());
        }
        if self.data.is_boosted(item_id) {
            tokens.insert(REASON_PERSONALIZATION.to_string());
        }
        if let Some(rule_tokens) = self.rules.and_then(|r| r.reason_tags.get(item_id)) {
            tokens.extend(rule_tokens.iter().cloned());
        }
        tokens.into_iter().collect()
    }

    fn explain(&self, item_id: &str, level: ExplainLevel) -> Option<ExplainBlock> {
        let full = level == ExplainLevel::Full;
        let mut block = ExplainBlock {
            anchors: if self.data.anchors.is_empty() {
                vec![NO_RECENT_ACTIVITY.to_string()]
            } else {
                self.data.anchors.clone()
            },
            ..Default::default()
        };

        if let Some(signals) = self.data.signals.get(item_id) {
            let w = self.weights;
            block.blend = Some(BlendExplain {
                alpha: w.pop,
                beta: w.cooc,
                gamma: w.similarity,
                pop_norm: signals.pop_norm,
                cooc_norm: signals.cooc_norm,
                similarity_norm: signals.similarity_norm,
                contributions: BlendContribution {
                    pop: w.pop * signals.pop_norm,
                    cooc: w.cooc * signals.cooc_norm,
                    similarity: w.similarity * signals.similarity_norm,
                },
                raw: full.then(|| BlendRaw {
                    pop: signals.pop_raw,
                    cooc: signals.cooc_raw,
                    similarity: signals.similarity_raw,
                }),
            });
        }

        if let Some(boost) = self.data.boosts.get(item_id) {
            block.personalization = Some(PersonalizationExplain {
                overlap: boost.overlap,
                boost_multiplier: boost.multiplier,
                raw: full.then(|| PersonalizationExplainRaw {
                    profile_boost: self.config.profile_boost,
                }),
            });
        }

        block.mmr = match self.data.mmr.get(item_id) {
            Some(info) if full => Some(info.clone()),
            Some(info) => Some(MmrExplain {
                lambda: info.lambda,
                max_similarity: info.max_similarity,
                penalty: info.penalty,
                ..Default::default()
            }),
            None if full && self.config.uses_mmr() => Some(MmrExplain {
                lambda: self.config.mmr_lambda,
                ..Default::default()
            }),
            None => None,
        };

        block.caps = match self.data.caps.get(item_id) {
            Some(info) if full => Some(info.clone()),
            Some(info) => Some(CapsExplain {
                brand: info.brand.as_ref().map(applied_only),
                category: info.category.as_ref().map(applied_only),
            }),
            None if full && self.config.uses_caps() => Some(CapsExplain {
                brand: unapplied(self.config.brand_cap),
                category: unapplied(self.config.category_cap),
            }),
            None => None,
        };

        (!block.is_empty()).then_some(block)
    }
}

fn applied_only(usage: &CapUsage) -> CapUsage {
    CapUsage {
        applied: usage.applied,
        ..Default::default()
    }
}

fn unapplied(cap: i64) -> Option<CapUsage> {
    let limit = usize::try_from(cap).ok().filter(|c| *c > 0)?;
    Some(CapUsage {
        applied: false,
        limit: Some(limit),
        ..Default::default()
    })
}
