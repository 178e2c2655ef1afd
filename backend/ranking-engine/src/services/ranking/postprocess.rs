use crate::models::{Request, Response, ScoredItem, Signal, SignalStatus, Warning, WarningCode};
use crate::services::rules::{EvaluateResult, PinnedItem};
use crate::store::{EngineStore, RequestContext};
use artifact_schema::{normalize_tag, normalize_tags};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// Moves up to `limit` served anchors to the front, in anchor order.
pub(super) fn promote_anchors(response: &mut Response, anchors: &[String], limit: usize) {
    let mut promoted: Vec<ScoredItem> = Vec::new();
    for anchor in anchors {
        if promoted.len() >= limit {
            break;
        }
        let anchor = anchor.trim();
        if let Some(pos) = response.items.iter().position(|i| i.item_id == anchor) {
            promoted.push(response.items.remove(pos));
        }
    }
    if promoted.is_empty() {
        return;
    }
    promoted.append(&mut response.items);
    response.items = promoted;
}

/// Pinned items, then items with a positive rule boost, then everything
/// else; relative order is kept within each group.
pub(super) fn promote_manual_boosts(response: &mut Response, rules: &EvaluateResult) {
    if rules.item_effects.is_empty() {
        return;
    }
    let group = |item: &ScoredItem| match rules.item_effects.get(&item.item_id) {
        Some(effect) if effect.pinned => 0,
        Some(effect) if effect.boost_delta > 0.0 => 1,
        _ => 2,
    };
    // stable
    response.items.sort_by_key(group);
}

/// One warning per unavailable or partial signal, ordered by signal name.
pub(super) fn signal_warnings(status: &BTreeMap<Signal, SignalStatus>) -> Vec<Warning> {
    let mut entries: Vec<(&Signal, &SignalStatus)> = status.iter().collect();
    entries.sort_by_key(|(signal, _)| signal.as_str());

    entries
        .into_iter()
        .filter_map(|(signal, status)| {
            if !status.available {
                let detail = match status.error.as_deref() {
                    Some(err) if err != "unavailable" => format!("{} unavailable: {}", signal, err),
                    _ => format!("{} unavailable", signal),
                };
                Some(Warning::new(WarningCode::SignalUnavailable, detail))
            } else if status.partial {
                let detail = match status.error.as_deref() {
                    Some(err) => format!("{} partial: {}", signal, err),
                    None => format!("{} partial", signal),
                };
                Some(Warning::new(WarningCode::SignalPartial, detail))
            } else {
                None
            }
        })
        .collect()
}

/// Pinned items lead the list in pin order; the list is cut back to `k`.
/// Warns when pins were injected from outside the ranked pool.
pub(super) fn apply_pinned_overrides(
    response: &mut Response,
    pinned: &[PinnedItem],
    pre_rule: &HashSet<String>,
    k: usize,
) -> Option<Warning> {
    if pinned.is_empty() {
        return None;
    }
    let order: HashMap<&str, usize> = pinned
        .iter()
        .enumerate()
        .map(|(idx, p)| (p.item_id.as_str(), idx))
        .collect();
    response
        .items
        .sort_by_key(|item| order.get(item.item_id.as_str()).copied().unwrap_or(usize::MAX));
    response.items.truncate(k);

    let injected = response
        .items
        .iter()
        .filter(|item| order.contains_key(item.item_id.as_str()) && !pre_rule.contains(&item.item_id))
        .count();
    (injected > 0).then(|| {
        Warning::new(
            WarningCode::RulePinInjected,
            format!("{} pinned items were injected into results", injected),
        )
    })
}

/// `forbidden_tags` and `max_per_tag` over freshly looked-up tags. A failed
/// lookup skips the filter with a warning.
pub(super) async fn apply_tag_constraints(
    store: &dyn EngineStore,
    ctx: &RequestContext,
    req: &Request,
    response: &mut Response,
) -> Option<Warning> {
    let forbidden: HashSet<String> = normalize_tags(&req.constraints.forbidden_tags)
        .into_iter()
        .collect();
    let limits: BTreeMap<String, usize> = req
        .constraints
        .max_per_tag
        .iter()
        .map(|(tag, limit)| (normalize_tag(tag), *limit))
        .filter(|(tag, limit)| !tag.is_empty() && *limit > 0)
        .collect();
    if (forbidden.is_empty() && limits.is_empty()) || response.items.is_empty() {
        return None;
    }

    let ids: Vec<String> = response.items.iter().map(|i| i.item_id.clone()).collect();
    let tags = match store
        .list_items_tags(ctx, req.org_id, &req.namespace_or_default(), &ids)
        .await
    {
        Ok(tags) => tags,
        Err(err) => {
            warn!(error = %err, "Tag lookup for post constraints failed");
            return Some(Warning::new(
                WarningCode::TagLookupFailed,
                format!("tag lookup failed: {}", err),
            ));
        }
    };

    let before = response.items.len();
    let mut counts: HashMap<String, usize> = HashMap::new();
    response.items.retain(|item| {
        let item_tags: HashSet<String> = tags
            .get(&item.item_id)
            .map(|t| normalize_tags(&t.tags).into_iter().collect())
            .unwrap_or_default();
        if item_tags.iter().any(|t| forbidden.contains(t)) {
            return false;
        }
        let capped: Vec<&String> = limits
            .iter()
            .filter(|(tag, _)| item_tags.contains(*tag))
            .map(|(tag, _)| tag)
            .collect();
        if capped
            .iter()
            .any(|tag| counts.get(*tag).copied().unwrap_or(0) >= limits[*tag])
        {
            return false;
        }
        for tag in capped {
            *counts.entry(tag.clone()).or_insert(0) += 1;
        }
        true
    });

    let removed = before - response.items.len();
    (removed > 0).then(|| {
        Warning::new(
            WarningCode::ConstraintsFiltered,
            format!("{} items removed by tag constraints", removed),
        )
    })
}

/// Restricts the response to `candidates.include_ids` when given.
pub(super) fn apply_include_filter(response: &mut Response, include_ids: &[String]) -> Option<Warning> {
    let include: HashSet<&str> = include_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect();
    if include.is_empty() {
        return None;
    }

    let before = response.items.len();
    response
        .items
        .retain(|item| include.contains(item.item_id.as_str()));
    if response.items.is_empty() {
        return Some(Warning::new(
            WarningCode::CandidatesIncludeEmpty,
            "no items matched candidates.include_ids",
        ));
    }
    let removed = before - response.items.len();
    (removed > 0).then(|| {
        Warning::new(
            WarningCode::CandidatesIncludeFiltered,
            format!("{} items removed by candidates.include_ids", removed),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemTags;
    use crate::services::rules::ItemEffect;

    fn response(ids: &[&str]) -> Response {
        let mut response = Response {
            items: ids
                .iter()
                .map(|id| ScoredItem {
                    item_id: id.to_string(),
                    score: 1.0,
                    rank: 0,
                    reasons: Vec::new(),
                    explain: None,
                })
                .collect(),
            ..Default::default()
        };
        response.rerank();
        response
    }

    fn pin(id: &str) -> PinnedItem {
        PinnedItem {
            item_id: id.to_string(),
            score: 0.0,
            from_candidates: false,
            rules: Vec::new(),
        }
    }

    #[test]
    fn test_include_filter_warnings() {
        let mut resp = response(&["item_1", "item_2", "item_3"]);
        let warning = apply_include_filter(&mut resp, &["item_1".into(), " item_3 ".into()]).unwrap();
        assert_eq!(resp.item_ids(), vec!["item_1", "item_3"]);
        assert_eq!(warning.code, WarningCode::CandidatesIncludeFiltered);
        assert_eq!(warning.detail, "1 items removed by candidates.include_ids");

        let warning = apply_include_filter(&mut resp, &["zzz".into()]).unwrap();
        assert!(resp.items.is_empty());
        assert_eq!(warning.code, WarningCode::CandidatesIncludeEmpty);
    }

    #[test]
    fn test_pinned_overrides_lead_and_warn() {
        let mut resp = response(&["item_3", "item_2", "item_1"]);
        let pre_rule: HashSet<String> = ["item_1".to_string(), "item_3".to_string()].into();
        let warning =
            apply_pinned_overrides(&mut resp, &[pin("item_1"), pin("item_2")], &pre_rule, 3).unwrap();
        assert_eq!(resp.item_ids(), vec!["item_1", "item_2", "item_3"]);
        assert_eq!(warning.detail, "1 pinned items were injected into results");
    }

    #[test]
    fn test_manual_boosts_follow_pins() {
        let mut resp = response(&["a", "b", "c", "d"]);
        let mut rules = EvaluateResult::default();
        rules.item_effects.insert(
            "c".into(),
            ItemEffect {
                boost_delta: 0.5,
                ..Default::default()
            },
        );
        rules.item_effects.insert(
            "d".into(),
            ItemEffect {
                pinned: true,
                ..Default::default()
            },
        );
        promote_manual_boosts(&mut resp, &rules);
        assert_eq!(resp.item_ids(), vec!["d", "c", "a", "b"]);
    }

    #[test]
    fn test_promote_anchors() {
        let mut resp = response(&["a", "b", "c", "d"]);
        promote_anchors(&mut resp, &["d".into(), "x".into(), "c".into()], 3);
        assert_eq!(resp.item_ids(), vec!["d", "c", "a", "b"]);
    }

    #[test]
    fn test_signal_warnings_sorted_by_name() {
        let mut status = BTreeMap::new();
        status.insert(
            Signal::Session,
            SignalStatus {
                available: false,
                partial: false,
                error: Some("unavailable".into()),
            },
        );
        status.insert(
            Signal::Cooc,
            SignalStatus {
                available: true,
                partial: true,
                error: Some("timeout".into()),
            },
        );
        status.insert(Signal::Popularity, SignalStatus { available: true, ..Default::default() });

        let warnings = signal_warnings(&status);
        let details: Vec<&str> = warnings.iter().map(|w| w.detail.as_str()).collect();
        assert_eq!(details, vec!["cooc partial: timeout", "session unavailable"]);
    }

    #[tokio::test]
    async fn test_tag_constraints_forbidden_and_caps() {
        use crate::services::tags::InMemoryTagStore;
        use crate::store::TagStore;

        struct Tags(InMemoryTagStore);

        #[async_trait::async_trait]
        impl TagStore for Tags {
            async fn list_items_tags(
                &self,
                ctx: &RequestContext,
                org_id: uuid::Uuid,
                namespace: &str,
                item_ids: &[String],
            ) -> crate::error::Result<HashMap<String, ItemTags>> {
                self.0.list_items_tags(ctx, org_id, namespace, item_ids).await
            }
        }

        #[async_trait::async_trait]
        impl EngineStore for Tags {
            async fn popularity_top_k(
                &self,
                _ctx: &RequestContext,
                _org_id: uuid::Uuid,
                _namespace: &str,
                _half_life_days: f64,
                _k: usize,
                _constraints: &crate::models::PopConstraints,
            ) -> crate::error::Result<Vec<crate::models::Candidate>> {
                Ok(Vec::new())
            }
        }

        let inner = InMemoryTagStore::new();
        inner.insert("default", ItemTags::new("a", ["Shoes"]));
        inner.insert("default", ItemTags::new("b", ["shoes"]));
        inner.insert("default", ItemTags::new("c", ["adult"]));
        inner.insert("default", ItemTags::new("d", ["hats"]));
        let store = Tags(inner);

        let mut req = Request::new(uuid::Uuid::from_u128(1), "home", 4);
        req.constraints.forbidden_tags = vec!["ADULT".into()];
        req.constraints.max_per_tag.insert("shoes".into(), 1);

        let mut resp = response(&["a", "b", "c", "d"]);
        let warning = apply_tag_constraints(&store, &RequestContext::new(), &req, &mut resp)
            .await
            .unwrap();
        assert_eq!(resp.item_ids(), vec!["a", "d"]);
        assert_eq!(warning.detail, "2 items removed by tag constraints");
    }
}
