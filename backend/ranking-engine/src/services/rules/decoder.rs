//! Lenient decoding of tenant-authored rule documents.
//!
//! Accepts a bare array, an envelope keyed by `rules`, `items` or `data`, or a
//! single rule object, and tolerates the field aliases and value encodings
//! that admin tooling has produced over time. Rules that cannot be made sense
//! of are skipped, never fatal.

use super::{Rule, RuleAction, RuleTarget};
use crate::error::Result;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

pub type RulePayload = Map<String, Value>;

/// Request scope the decoded rules are filtered against.
#[derive(Debug, Clone)]
pub struct RuleScope<'a> {
    pub org_id: Uuid,
    pub namespace: &'a str,
    pub surface: &'a str,
    /// `None` keeps rules for every segment
    pub segment: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// Splits a raw rules document into individual rule objects.
pub fn parse_rule_payloads(raw: &[u8]) -> Result<Vec<RulePayload>> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if !trimmed.starts_with('[') && !trimmed.starts_with('{') {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed)?;
    Ok(payloads_from_value(value))
}

fn payloads_from_value(value: Value) -> Vec<RulePayload> {
    match value {
        Value::Array(entries) => entries
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        Value::Object(mut map) => {
            for key in ["rules", "items", "data"] {
                if let Some(inner) = map.remove(key) {
                    return payloads_from_value(inner);
                }
            }
            if map.is_empty() {
                Vec::new()
            } else {
                vec![map]
            }
        }
        _ => Vec::new(),
    }
}

/// Parses and builds every usable rule in `raw` for the scope.
pub fn decode_rules(raw: &[u8], scope: &RuleScope<'_>) -> Result<Vec<Rule>> {
    let payloads = parse_rule_payloads(raw)?;
    let total = payloads.len();
    let rules: Vec<Rule> = payloads
        .iter()
        .filter_map(|payload| build_rule(payload, scope))
        .collect();
    debug!(total, kept = rules.len(), "Decoded rules document");
    Ok(rules)
}

pub(crate) fn build_rule(payload: &RulePayload, scope: &RuleScope<'_>) -> Option<Rule> {
    let action_kind = normalize_action(&get_string(payload, &["action", "rule_action", "operation"]))?;

    let (mut target_type, mut target_key, mut item_ids) = extract_target(payload);
    if target_type.is_none() && !item_ids.is_empty() {
        target_type = Some(TargetKind::Item);
    }
    let target_type = target_type?;
    if target_type == TargetKind::Item {
        if item_ids.is_empty() && !target_key.is_empty() {
            item_ids = vec![std::mem::take(&mut target_key)];
        }
        if item_ids.is_empty() {
            return None;
        }
    } else if target_key.trim().is_empty() {
        return None;
    }

    let rule_namespace = get_string(payload, &["namespace", "ns"]);
    let rule_surface = get_string(payload, &["surface", "surf"]);
    let rule_segment = get_string(payload, &["segment_id", "segment", "segmentId"]);
    if !match_scope(&rule_namespace, &rule_surface, &rule_segment, scope) {
        return None;
    }

    let enabled = get_bool(payload, &["enabled", "active", "is_enabled"]).unwrap_or(true);
    if !enabled {
        return None;
    }

    let valid_from = get_time(payload, &["valid_from", "starts_at", "start_at", "start"]);
    if matches!(valid_from, Some(from) if scope.now < from) {
        return None;
    }
    let valid_until = get_time(payload, &["valid_until", "ends_at", "end_at", "end"]);
    if matches!(valid_until, Some(until) if scope.now >= until) {
        return None;
    }

    let action = match action_kind {
        ActionKind::Block => RuleAction::Block,
        ActionKind::Pin => RuleAction::Pin {
            max_pins: get_int(payload, &["max_pins", "maxPins", "max_pinned"]),
        },
        ActionKind::Boost => RuleAction::Boost {
            boost_value: get_float(payload, &["boost_value", "boost", "value", "boostValue"])
                .unwrap_or(0.0),
        },
    };

    let target_key = target_key.trim().to_string();
    let target = match target_type {
        TargetKind::Item => RuleTarget::Item(normalize_string_list(item_ids)),
        TargetKind::Tag => RuleTarget::Tag(target_key),
        TargetKind::Brand => RuleTarget::Brand(target_key),
        TargetKind::Category => RuleTarget::Category(target_key),
    };

    let created_at = get_time(payload, &["created_at", "createdAt"]);
    let updated_at = get_time(payload, &["updated_at", "updatedAt"]).or(created_at);

    Some(Rule {
        rule_id: parse_rule_id(payload, scope.org_id),
        manual_override_id: Uuid::parse_str(&get_string(
            payload,
            &["manual_override_id", "override_id", "manualOverrideId"],
        ))
        .ok(),
        org_id: scope.org_id,
        namespace: if rule_namespace.is_empty() {
            scope.namespace.to_string()
        } else {
            rule_namespace
        },
        surface: if rule_surface.is_empty() {
            scope.surface.to_string()
        } else {
            rule_surface
        },
        name: get_string(payload, &["name", "title"]),
        description: get_string(payload, &["description", "desc"]),
        action,
        target,
        segment_id: rule_segment,
        priority: get_int(payload, &["priority", "order", "rank"]).unwrap_or(0),
        enabled,
        valid_from,
        valid_until,
        created_at,
        updated_at,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionKind {
    Block,
    Pin,
    Boost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetKind {
    Item,
    Tag,
    Brand,
    Category,
}

fn normalize_action(raw: &str) -> Option<ActionKind> {
    match raw.trim().to_uppercase().as_str() {
        "BLOCK" | "BLOCKLIST" | "BAN" | "EXCLUDE" | "SUPPRESS" => Some(ActionKind::Block),
        "PIN" | "PINNED" | "FORCE" => Some(ActionKind::Pin),
        "BOOST" | "PROMOTE" | "INCREASE" => Some(ActionKind::Boost),
        _ => None,
    }
}

fn normalize_target_type(raw: &str) -> Option<TargetKind> {
    match raw.trim().to_uppercase().as_str() {
        "ITEM" | "ITEMS" | "PRODUCT" => Some(TargetKind::Item),
        "TAG" | "LABEL" => Some(TargetKind::Tag),
        "BRAND" => Some(TargetKind::Brand),
        "CATEGORY" | "CAT" => Some(TargetKind::Category),
        _ => None,
    }
}

fn match_scope(
    rule_namespace: &str,
    rule_surface: &str,
    rule_segment: &str,
    scope: &RuleScope<'_>,
) -> bool {
    if !rule_namespace.is_empty() && !rule_namespace.eq_ignore_ascii_case(scope.namespace.trim()) {
        return false;
    }
    if !rule_surface.is_empty() && !rule_surface.eq_ignore_ascii_case(scope.surface.trim()) {
        return false;
    }
    match scope.segment {
        Some(segment) if !rule_segment.is_empty() => {
            let segment = segment.trim();
            !segment.is_empty() && rule_segment.eq_ignore_ascii_case(segment)
        }
        _ => true,
    }
}

fn extract_target(payload: &RulePayload) -> (Option<TargetKind>, String, Vec<String>) {
    let mut target_type = normalize_target_type(&get_string(payload, &["target_type", "targetType"]));
    let mut target_key = get_string(payload, &["target_key", "targetKey", "key"]);
    let mut item_ids = get_string_list(
        payload,
        &[
            "item_ids",
            "item_id",
            "itemIds",
            "itemId",
            "items",
            "target_items",
            "targetItems",
        ],
    );

    for (field, kind) in [
        ("tag", TargetKind::Tag),
        ("brand", TargetKind::Brand),
        ("category", TargetKind::Category),
    ] {
        if !target_key.is_empty() {
            break;
        }
        let value = get_string(payload, &[field]);
        if !value.is_empty() {
            target_key = value;
            target_type.get_or_insert(kind);
        }
    }

    match payload.get("target") {
        Some(Value::Object(nested)) => {
            if target_type.is_none() {
                target_type =
                    normalize_target_type(&get_string(nested, &["type", "target_type", "targetType"]));
            }
            if target_key.is_empty() {
                target_key = get_string(nested, &["key", "target_key", "tag", "value"]);
            }
            if item_ids.is_empty() {
                item_ids = get_string_list(
                    nested,
                    &["item_ids", "itemIds", "items", "target_items", "targetItems"],
                );
            }
        }
        Some(Value::String(raw)) if target_type.is_none() => {
            target_type = normalize_target_type(raw);
        }
        _ => {}
    }

    if target_type.is_none() {
        target_type = normalize_target_type(&get_string(payload, &["target"]));
    }

    (target_type, target_key, item_ids)
}

/// Explicit UUID if present; otherwise a stable id derived from the org and payload.
fn parse_rule_id(payload: &RulePayload, org_id: Uuid) -> Uuid {
    if let Ok(id) = Uuid::parse_str(&get_string(payload, &["rule_id", "id", "ruleId"])) {
        return id;
    }
    let blob = match serde_json::to_vec(payload) {
        Ok(blob) => blob,
        Err(_) => return Uuid::new_v4(),
    };
    let namespace = if org_id.is_nil() {
        Uuid::NAMESPACE_OID
    } else {
        org_id
    };
    let mut seed = format!("{}|", org_id).into_bytes();
    seed.extend_from_slice(&blob);
    Uuid::new_v5(&namespace, &seed)
}

fn normalize_string_list(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let trimmed = item.trim();
        if trimmed.is_empty() || out.iter().any(|seen| seen == trimmed) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

// ==== Value coercion ====

fn get_string(payload: &RulePayload, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .map(string_from_value)
        .find(|s| !s.is_empty())
        .unwrap_or_default()
}

fn get_string_list(payload: &RulePayload, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .map(string_list_from_value)
        .find(|list| !list.is_empty())
        .unwrap_or_default()
}

fn get_bool(payload: &RulePayload, keys: &[&str]) -> Option<bool> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find_map(bool_from_value)
}

fn get_int(payload: &RulePayload, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find_map(int_from_value)
}

fn get_float(payload: &RulePayload, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find_map(float_from_value)
}

fn get_time(payload: &RulePayload, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find_map(time_from_value)
}

fn string_from_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn string_list_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::Array(entries) => entries
            .iter()
            .map(string_from_value)
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    }
}

fn bool_from_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "t" | "true" => Some(true),
            "0" | "f" | "false" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

fn int_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn time_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return Some(t.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::default())))
        }
        Value::Number(n) => n.as_f64().and_then(unix_from_float),
        _ => None,
    }
}

/// Unix timestamp in seconds, milliseconds or nanoseconds.
fn unix_from_float(value: f64) -> Option<DateTime<Utc>> {
    let secs = if value > 1e15 {
        value / 1e9
    } else if value > 1e12 {
        value / 1e3
    } else {
        value
    };
    let whole = secs.trunc();
    let nanos = ((secs - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(now: DateTime<Utc>) -> RuleScope<'static> {
        RuleScope {
            org_id: Uuid::from_u128(7),
            namespace: "default",
            surface: "home",
            segment: Some(""),
            now,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_envelope_shapes() {
        assert!(parse_rule_payloads(b"").unwrap().is_empty());
        assert!(parse_rule_payloads(b" null ").unwrap().is_empty());
        assert_eq!(parse_rule_payloads(br#"[{"a":1},{"b":2}]"#).unwrap().len(), 2);
        assert_eq!(
            parse_rule_payloads(br#"{"data":{"rules":[{"a":1}]}}"#).unwrap().len(),
            1
        );
        assert_eq!(parse_rule_payloads(br#"{"action":"pin"}"#).unwrap().len(), 1);
        assert!(parse_rule_payloads(b"{}").unwrap().is_empty());
        assert!(parse_rule_payloads(b"{not json").is_err());
    }

    #[test]
    fn test_aliases_and_shorthands() {
        let raw = br#"[
            {"operation":"promote","tag":"Summer","value":"0.25","order":"5"},
            {"rule_action":"ban","items":"a, b ,a"},
            {"action":"force","target":{"type":"brand","value":"acme"},"maxPins":2},
            {"action":"suppress","target":"category","key":"shoes"}
        ]"#;
        let rules = decode_rules(raw, &scope(now())).unwrap();
        assert_eq!(rules.len(), 4);

        assert_eq!(rules[0].action, RuleAction::Boost { boost_value: 0.25 });
        assert_eq!(rules[0].target, RuleTarget::Tag("Summer".into()));
        assert_eq!(rules[0].priority, 5);

        assert_eq!(rules[1].action, RuleAction::Block);
        assert_eq!(rules[1].target, RuleTarget::Item(vec!["a".into(), "b".into()]));

        assert_eq!(rules[2].action, RuleAction::Pin { max_pins: Some(2) });
        assert_eq!(rules[2].target, RuleTarget::Brand("acme".into()));

        assert_eq!(rules[3].target, RuleTarget::Category("shoes".into()));
    }

    #[test]
    fn test_item_key_becomes_item_id() {
        let raw = br#"{"action":"pin","target_type":"product","key":"sku-1"}"#;
        let rules = decode_rules(raw, &scope(now())).unwrap();
        assert_eq!(rules[0].target, RuleTarget::Item(vec!["sku-1".into()]));
    }

    #[test]
    fn test_unusable_rules_are_skipped() {
        let raw = br#"[
            {"action":"explode","items":["a"]},
            {"action":"block"},
            {"action":"block","target_type":"tag"},
            {"action":"block","items":["a"],"enabled":"false"},
            {"action":"block","items":["a"],"surface":"pdp"},
            {"action":"block","items":["a"],"segment":"vip"}
        ]"#;
        assert!(decode_rules(raw, &scope(now())).unwrap().is_empty());
    }

    #[test]
    fn test_segment_kept_when_scope_is_open() {
        let raw = br#"{"action":"block","items":["a"],"segment":"VIP"}"#;
        let mut open = scope(now());
        open.segment = None;
        let rules = decode_rules(raw, &open).unwrap();
        assert_eq!(rules[0].segment_id, "VIP");
        assert!(rules[0].applies_to_segment("vip"));
        assert!(!rules[0].applies_to_segment(""));
    }

    #[test]
    fn test_validity_window_formats() {
        let raw = br#"[
            {"action":"block","items":["a"],"starts_at":"2025-06-02"},
            {"action":"block","items":["b"],"ends_at":1748779200},
            {"action":"block","items":["c"],"valid_from":1748000000000,"valid_until":"2025-07-01T00:00:00Z"}
        ]"#;
        let rules = decode_rules(raw, &scope(now())).unwrap();
        // 1748779200 is exactly `now`, so "b" has expired.
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].target, RuleTarget::Item(vec!["c".into()]));
        assert!(rules[0].valid_from.is_some());
    }

    #[test]
    fn test_rule_id_is_stable_without_explicit_id() {
        let raw = br#"{"action":"block","items":["a"]}"#;
        let first = decode_rules(raw, &scope(now())).unwrap();
        let second = decode_rules(raw, &scope(now())).unwrap();
        assert_eq!(first[0].rule_id, second[0].rule_id);

        let explicit = Uuid::from_u128(42);
        let raw = format!(r#"{{"action":"block","items":["a"],"id":"{}"}}"#, explicit);
        let rules = decode_rules(raw.as_bytes(), &scope(now())).unwrap();
        assert_eq!(rules[0].rule_id, explicit);
    }
}
