use super::{
    BoostDetail, EvaluateRequest, EvaluateResult, ItemEffect, Match, OverrideHit, PinnedItem, Rule,
    RuleAction, RuleTarget,
};
use crate::error::Result;
use crate::models::{Candidate, ItemTags};
use crate::store::RequestContext;
use artifact_schema::normalize_tag;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Pure rule application over one candidate list.
#[derive(Debug, Clone)]
pub struct Evaluator {
    max_pin_slots: usize,
    brand_tag_prefixes: Vec<String>,
    category_tag_prefixes: Vec<String>,
}

#[derive(Default)]
struct ItemState {
    blocked: bool,
    block_rules: Vec<Uuid>,
    pinned: bool,
    pin_rules: Vec<Uuid>,
    boost_delta: f64,
    boost_rules: Vec<BoostDetail>,
}

/// Free tags plus structured brand/category values per item.
struct TagIndex {
    tag_sets: BTreeMap<String, HashSet<String>>,
    brands: BTreeMap<String, Vec<String>>,
    categories: BTreeMap<String, Vec<String>>,
}

impl Evaluator {
    pub fn new(
        max_pin_slots: usize,
        brand_tag_prefixes: Vec<String>,
        category_tag_prefixes: Vec<String>,
    ) -> Self {
        Self {
            max_pin_slots,
            brand_tag_prefixes,
            category_tag_prefixes,
        }
    }

    pub fn apply(
        &self,
        ctx: &RequestContext,
        mut rules: Vec<Rule>,
        req: &EvaluateRequest,
    ) -> Result<EvaluateResult> {
        let mut candidate_map: HashMap<String, Candidate> = HashMap::new();
        let mut order: Vec<String> = Vec::with_capacity(req.candidates.len());
        for cand in &req.candidates {
            if candidate_map
                .insert(cand.item_id.clone(), cand.clone())
                .is_none()
            {
                order.push(cand.item_id.clone());
            }
        }

        let index = self.prepare_indexes(&req.item_tags);

        let mut states: HashMap<String, ItemState> = HashMap::new();
        let mut pinned_order: Vec<String> = Vec::new();
        let mut remaining_pins = self.max_pin_slots;
        let mut matches = Vec::with_capacity(rules.len());
        let mut evaluated: Vec<Uuid> = Vec::with_capacity(rules.len());
        let mut override_stats: HashMap<Uuid, OverrideHit> = HashMap::new();

        // Stable: equal priorities keep input order.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in &rules {
            ctx.check()?;
            evaluated.push(rule.rule_id);

            let matched = dedupe_preserving_order(match_rule(rule, &index));
            if matched.is_empty() {
                continue;
            }

            if let Some(override_id) = rule.manual_override_id {
                let hit = override_stats
                    .entry(rule.rule_id)
                    .or_insert_with(|| OverrideHit {
                        override_id,
                        rule_id: rule.rule_id,
                        action: rule.action.as_str().to_string(),
                        matched_items: Vec::new(),
                        blocked_items: Vec::new(),
                        pinned_items: Vec::new(),
                        boosted_items: Vec::new(),
                        served_items: Vec::new(),
                    });
                append_unique(&mut hit.matched_items, &matched);
            }
            matches.push(Match {
                rule_id: rule.rule_id,
                action: rule.action.as_str().to_string(),
                target: rule.target.as_str().to_string(),
                item_ids: matched.clone(),
                manual_override_id: rule.manual_override_id,
            });

            match &rule.action {
                RuleAction::Block => {
                    for id in &matched {
                        ctx.check()?;
                        let st = states.entry(id.clone()).or_default();
                        if st.pinned {
                            // The slot goes back to the pool; the pinning rule's own count does not.
                            st.pinned = false;
                            if remaining_pins < self.max_pin_slots {
                                remaining_pins += 1;
                            }
                        }
                        st.blocked = true;
                        if !st.block_rules.contains(&rule.rule_id) {
                            st.block_rules.push(rule.rule_id);
                        }
                        if let Some(hit) = override_stats.get_mut(&rule.rule_id) {
                            append_unique(&mut hit.blocked_items, std::slice::from_ref(id));
                        }
                    }
                }
                RuleAction::Pin { max_pins } => {
                    if remaining_pins == 0 {
                        continue;
                    }
                    let per_rule_limit = match max_pins {
                        Some(limit) if *limit >= 0 => (*limit as usize).min(self.max_pin_slots),
                        _ => self.max_pin_slots,
                    };
                    if per_rule_limit == 0 {
                        continue;
                    }
                    let mut rule_pinned = 0usize;
                    for id in &matched {
                        ctx.check()?;
                        if remaining_pins == 0 || rule_pinned >= per_rule_limit {
                            break;
                        }
                        let st = states.entry(id.clone()).or_default();
                        if st.blocked || st.pinned {
                            continue;
                        }
                        st.pinned = true;
                        if !st.pin_rules.contains(&rule.rule_id) {
                            st.pin_rules.push(rule.rule_id);
                        }
                        if let Some(hit) = override_stats.get_mut(&rule.rule_id) {
                            append_unique(&mut hit.pinned_items, std::slice::from_ref(id));
                        }
                        if !pinned_order.contains(id) {
                            pinned_order.push(id.clone());
                        }
                        remaining_pins -= 1;
                        rule_pinned += 1;
                    }
                }
                RuleAction::Boost { boost_value } => {
                    let value = *boost_value;
                    if value == 0.0 || !value.is_finite() {
                        continue;
                    }
                    for id in &matched {
                        ctx.check()?;
                        let st = states.entry(id.clone()).or_default();
                        if st.blocked {
                            continue;
                        }
                        let cand = candidate_map.entry(id.clone()).or_insert_with(|| {
                            order.push(id.clone());
                            Candidate::new(id.clone(), 0.0)
                        });
                        let mut delta = cand.score * value;
                        if delta == 0.0 {
                            delta = value;
                        }
                        cand.score += delta;
                        st.boost_delta += delta;
                        st.boost_rules.push(BoostDetail {
                            rule_id: rule.rule_id,
                            delta,
                        });
                        if let Some(hit) = override_stats.get_mut(&rule.rule_id) {
                            append_unique(&mut hit.boosted_items, std::slice::from_ref(id));
                        }
                    }
                }
            }
        }

        let mut result = EvaluateResult::default();

        for id in &order {
            let Some(cand) = candidate_map.get(id) else {
                continue;
            };
            if let Some(st) = states.get(id) {
                if st.blocked || st.pinned {
                    continue;
                }
            }
            result.candidates.push(cand.clone());
        }

        for id in &pinned_order {
            let Some(st) = states.get(id) else {
                continue;
            };
            if !st.pinned || st.blocked {
                continue;
            }
            let cand = candidate_map.get(id);
            result.pinned.push(PinnedItem {
                item_id: id.clone(),
                score: cand.map(|c| c.score).unwrap_or(0.0),
                from_candidates: cand.is_some(),
                rules: st.pin_rules.clone(),
            });
        }

        for (id, st) in states {
            let mut effect = ItemEffect::default();
            let mut reasons: Vec<String> = Vec::new();
            if st.blocked {
                effect.blocked = true;
                reasons.extend(reason_tokens("rule.block", &st.block_rules));
                effect.block_rules = st.block_rules;
            }
            if st.pinned {
                effect.pinned = true;
                reasons.extend(reason_tokens("rule.pin", &st.pin_rules));
                effect.pin_rules = st.pin_rules;
            }
            if st.boost_delta != 0.0 {
                effect.boost_delta = st.boost_delta;
                reasons.extend(st.boost_rules.iter().map(boost_reason));
                effect.boost_rules = st.boost_rules;
            }
            if effect.blocked || effect.pinned || effect.boost_delta != 0.0 {
                let tokens: BTreeSet<String> =
                    reasons.into_iter().filter(|t| !t.is_empty()).collect();
                if !tokens.is_empty() {
                    result.reason_tags.insert(id.clone(), tokens.into_iter().collect());
                }
                result.item_effects.insert(id, effect);
            }
        }

        result.matches = matches;
        result.evaluated_rule_ids = dedupe_preserving_order(evaluated);
        let mut hits: Vec<OverrideHit> = override_stats.into_values().collect();
        hits.sort_by_key(|h| h.override_id.to_string());
        result.override_hits = hits;

        Ok(result)
    }

    fn prepare_indexes(&self, item_tags: &HashMap<String, ItemTags>) -> TagIndex {
        let brand_matchers = to_matchers(&self.brand_tag_prefixes);
        let category_matchers = to_matchers(&self.category_tag_prefixes);

        let mut index = TagIndex {
            tag_sets: BTreeMap::new(),
            brands: BTreeMap::new(),
            categories: BTreeMap::new(),
        };
        for (item_id, record) in item_tags {
            let mut set = HashSet::new();
            for tag in &record.tags {
                let tag = normalize_tag(tag);
                if tag.is_empty() {
                    continue;
                }
                if let Some(value) = match_structured(&tag, &brand_matchers) {
                    push_unique(index.brands.entry(item_id.clone()).or_default(), value);
                    continue;
                }
                if let Some(value) = match_structured(&tag, &category_matchers) {
                    push_unique(index.categories.entry(item_id.clone()).or_default(), value);
                    continue;
                }
                set.insert(tag);
            }
            if !set.is_empty() {
                index.tag_sets.insert(item_id.clone(), set);
            }
        }
        index
    }
}

fn match_rule(rule: &Rule, index: &TagIndex) -> Vec<String> {
    match &rule.target {
        RuleTarget::Item(ids) => ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
        RuleTarget::Tag(key) => {
            let key = normalize_tag(key);
            if key.is_empty() {
                return Vec::new();
            }
            index
                .tag_sets
                .iter()
                .filter(|(_, set)| set.contains(&key))
                .map(|(id, _)| id.clone())
                .collect()
        }
        RuleTarget::Brand(key) => match_by_list(key, &index.brands),
        RuleTarget::Category(key) => match_by_list(key, &index.categories),
    }
}

fn match_by_list(key: &str, values: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let key = normalize_tag(key);
    if key.is_empty() {
        return Vec::new();
    }
    values
        .iter()
        .filter(|(_, list)| list.contains(&key))
        .map(|(id, _)| id.clone())
        .collect()
}

/// Normalized `prefix:` matchers, deduplicated. Shared with the MMR caps.
pub(crate) fn to_matchers(prefixes: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in prefixes {
        let trimmed = normalize_tag(raw);
        let trimmed = trimmed.trim_end_matches(':');
        if trimmed.is_empty() {
            continue;
        }
        let matcher = format!("{}:", trimmed);
        if !out.contains(&matcher) {
            out.push(matcher);
        }
    }
    out
}

/// Value after the first matching prefix, if non-empty.
pub(crate) fn match_structured(tag: &str, matchers: &[String]) -> Option<String> {
    matchers.iter().find_map(|prefix| {
        tag.strip_prefix(prefix.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn append_unique(dst: &mut Vec<String>, values: &[String]) {
    for v in values {
        if !dst.contains(v) {
            dst.push(v.clone());
        }
    }
}

fn dedupe_preserving_order<T: Clone + Eq + std::hash::Hash>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}

fn reason_tokens<'a>(prefix: &'a str, rule_ids: &'a [Uuid]) -> impl Iterator<Item = String> + 'a {
    rule_ids.iter().map(move |id| format!("{}[{}]", prefix, id))
}

fn boost_reason(detail: &BoostDetail) -> String {
    format!("rule.boost:{:+.2}[{}]", detail.delta, detail.rule_id)
}
