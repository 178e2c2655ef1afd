use super::days_before;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::models::{ItemTags, PolicySummary, Request, Response};
use crate::services::rules::EvaluateResult;
use crate::services::scoring::CandidateData;
use crate::store::{EngineStore, RequestContext};
use artifact_schema::normalize_tags;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

const MAX_REPORTED_IDS: usize = 20;

/// Drops explicitly excluded ids and, when configured, items the user
/// recently interacted with. Explicit hits take precedence in the counts.
pub(super) async fn apply_exclusions(
    store: &dyn EngineStore,
    config: &EngineConfig,
    ctx: &RequestContext,
    req: &Request,
    now: DateTime<Utc>,
    data: &mut CandidateData,
    policy: &mut PolicySummary,
) -> Result<()> {
    let explicit: HashSet<String> = trimmed_ids(&req.candidates.exclude_ids);

    let mut recent: HashSet<String> = HashSet::new();
    if config.rule_exclude_events {
        if let Some(user) = req.user_key() {
            let since = days_before(now, config.purchased_window_days);
            match store
                .list_user_events_since(
                    ctx,
                    req.org_id,
                    &req.namespace_or_default(),
                    &user,
                    since,
                    &config.exclude_event_types,
                )
                .await
            {
                Ok(ids) => recent = trimmed_ids(&ids),
                Err(err) if err.is_feature_unavailable() => {}
                Err(err) => return Err(err),
            }
        }
    }

    if !explicit.is_empty() || !recent.is_empty() {
        data.candidates.retain(|c| {
            if explicit.contains(&c.item_id) {
                policy.explicit_exclude_hits += 1;
                false
            } else if recent.contains(&c.item_id) {
                policy.recent_event_exclude_hits += 1;
                false
            } else {
                true
            }
        });
    }
    policy.after_exclusions = data.candidates.len();
    Ok(())
}

/// Structural filters over the enriched tags: required tags, price bounds
/// and creation cutoff. Every drop is recorded with its reason.
pub(super) fn apply_constraints(req: &Request, data: &mut CandidateData, policy: &mut PolicySummary) {
    let constraints = &req.constraints;
    let include: HashSet<String> = normalize_tags(&constraints.required_tags).into_iter().collect();
    let price_bounded = constraints.min_price.is_some() || constraints.max_price.is_some();
    if include.is_empty() && !price_bounded && constraints.created_after.is_none() {
        policy.after_constraint_filters = data.candidates.len();
        return;
    }

    let mut include_tags: Vec<String> = include.iter().cloned().collect();
    include_tags.sort();
    policy.constraint_include_tags = include_tags;

    let tags = &data.tags;
    data.candidates.retain(|candidate| {
        let Some(reason) = violation(req, &include, price_bounded, tags.get(&candidate.item_id)) else {
            return true;
        };
        policy.constraint_filtered_count += 1;
        if policy.constraint_filtered_ids.len() < MAX_REPORTED_IDS {
            policy.constraint_filtered_ids.push(candidate.item_id.clone());
        }
        policy
            .constraint_filtered_lookup
            .insert(candidate.item_id.clone());
        policy
            .constraint_filtered_reasons
            .insert(candidate.item_id.clone(), reason.to_string());
        false
    });
    policy.after_constraint_filters = data.candidates.len();
}

fn violation(
    req: &Request,
    include: &HashSet<String>,
    price_bounded: bool,
    tags: Option<&ItemTags>,
) -> Option<&'static str> {
    let Some(tags) = tags else {
        return Some("missing_tags");
    };
    let constraints = &req.constraints;

    if !include.is_empty() && !tags.tags.iter().any(|t| include.contains(t)) {
        return Some("include");
    }
    if price_bounded {
        let Some(price) = tags.price else {
            return Some("price_missing");
        };
        if matches!(constraints.min_price, Some(min) if price < min) {
            return Some("price_min");
        }
        if matches!(constraints.max_price, Some(max) if price > max) {
            return Some("price_max");
        }
    }
    if let Some(after) = constraints.created_after {
        match tags.created_at {
            Some(created) if created >= after => {}
            _ => return Some("created_after"),
        }
    }
    None
}

/// Final counts, constraint leak detection and rule exposure. Served items
/// are recorded on the override hits of the rules that shaped them.
pub(super) fn finalize_policy(
    policy: &mut PolicySummary,
    response: &Response,
    rules: Option<&mut EvaluateResult>,
) {
    policy.final_count = response.items.len();

    for item in &response.items {
        if !policy.constraint_filtered_lookup.contains(&item.item_id) {
            continue;
        }
        policy.constraint_leak_count += 1;
        if policy.constraint_leak_ids.len() < MAX_REPORTED_IDS {
            policy.constraint_leak_ids.push(item.item_id.clone());
        }
        let reason = policy
            .constraint_filtered_reasons
            .get(&item.item_id)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        *policy.constraint_leak_by_reason.entry(reason).or_insert(0) += 1;
    }

    let Some(rules) = rules else {
        return;
    };

    let mut served: Vec<(Uuid, String)> = Vec::new();
    for item in &response.items {
        let Some(effect) = rules.item_effects.get(&item.item_id) else {
            continue;
        };
        if effect.boost_delta != 0.0 {
            policy.rule_boost_exposure += 1;
            served.extend(
                effect
                    .boost_rules
                    .iter()
                    .map(|b| (b.rule_id, item.item_id.clone())),
            );
        }
        if effect.pinned {
            policy.rule_pin_exposure += 1;
            served.extend(effect.pin_rules.iter().map(|id| (*id, item.item_id.clone())));
        }
    }
    for (rule_id, item_id) in served {
        if let Some(hit) = rules.override_hit_mut(rule_id) {
            if !hit.served_items.contains(&item_id) {
                hit.served_items.push(item_id);
            }
        }
    }

    for effect in rules.item_effects.values().filter(|e| e.blocked) {
        policy.rule_block_exposure += 1;
        if effect.block_rules.is_empty() {
            *policy
                .rule_block_exposure_by_rule
                .entry("unknown".to_string())
                .or_insert(0) += 1;
        }
        for rule_id in &effect.block_rules {
            *policy
                .rule_block_exposure_by_rule
                .entry(rule_id.to_string())
                .or_insert(0) += 1;
        }
    }
}

fn trimmed_ids(ids: &[String]) -> HashSet<String> {
    ids.iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Candidate, ScoredItem};

    fn data(ids: &[&str]) -> CandidateData {
        CandidateData::new(ids.iter().map(|id| Candidate::new(*id, 1.0)).collect())
    }

    fn ids(data: &CandidateData) -> Vec<&str> {
        data.candidates.iter().map(|c| c.item_id.as_str()).collect()
    }

    #[test]
    fn test_constraint_reasons() {
        let mut req = Request::new(Uuid::from_u128(1), "home", 5);
        req.constraints.required_tags = vec![" Books ".into()];
        req.constraints.max_price = Some(20.0);

        let mut data = data(&["keep", "wrong_tag", "no_price", "pricey", "unknown"]);
        data.tags.insert("keep".into(), ItemTags::new("keep", ["books"]).with_price(10.0));
        data.tags.insert("wrong_tag".into(), ItemTags::new("wrong_tag", ["games"]).with_price(1.0));
        data.tags.insert("no_price".into(), ItemTags::new("no_price", ["books"]));
        data.tags.insert("pricey".into(), ItemTags::new("pricey", ["books"]).with_price(99.0));

        let mut policy = PolicySummary::default();
        apply_constraints(&req, &mut data, &mut policy);

        assert_eq!(ids(&data), vec!["keep"]);
        assert_eq!(policy.constraint_filtered_count, 4);
        assert_eq!(policy.constraint_include_tags, vec!["books"]);
        assert_eq!(policy.constraint_filtered_reasons["wrong_tag"], "include");
        assert_eq!(policy.constraint_filtered_reasons["no_price"], "price_missing");
        assert_eq!(policy.constraint_filtered_reasons["pricey"], "price_max");
        assert_eq!(policy.constraint_filtered_reasons["unknown"], "missing_tags");
        assert_eq!(policy.after_constraint_filters, 1);
    }

    #[test]
    fn test_no_constraints_keeps_untagged_items() {
        let req = Request::new(Uuid::from_u128(1), "home", 5);
        let mut data = data(&["a", "b"]);
        let mut policy = PolicySummary::default();
        apply_constraints(&req, &mut data, &mut policy);
        assert_eq!(ids(&data), vec!["a", "b"]);
        assert_eq!(policy.constraint_filtered_count, 0);
    }

    #[test]
    fn test_finalize_detects_leaks() {
        let mut policy = PolicySummary::default();
        policy.constraint_filtered_lookup.insert("x".into());
        policy
            .constraint_filtered_reasons
            .insert("x".into(), "price_min".into());
        let response = Response {
            items: vec![
                ScoredItem {
                    item_id: "x".into(),
                    score: 1.0,
                    rank: 1,
                    reasons: Vec::new(),
                    explain: None,
                },
                ScoredItem {
                    item_id: "y".into(),
                    score: 0.5,
                    rank: 2,
                    reasons: Vec::new(),
                    explain: None,
                },
            ],
            ..Default::default()
        };

        finalize_policy(&mut policy, &response, None);
        assert_eq!(policy.final_count, 2);
        assert_eq!(policy.constraint_leak_count, 1);
        assert_eq!(policy.constraint_leak_ids, vec!["x"]);
        assert_eq!(policy.constraint_leak_by_reason["price_min"], 1);
    }
}
