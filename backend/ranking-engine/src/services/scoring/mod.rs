//! Signal normalization, blending and personalization
//!
//! Every signal is squashed into [0,1) before blending:
//! - popularity, co-visitation, collaborative, content, session: `raw / (raw + 1)`
//! - embedding similarity: clamped to [0,1]
//!
//! The similarity term takes the best of the personal sources; sources that
//! tie within [`SIMILARITY_TIE_EPSILON`] are all credited.

use crate::config::EngineConfig;
use crate::models::{
    BlendWeights, Candidate, CapsExplain, ItemTags, MmrExplain, Request, Signal, SignalStatus,
    SourceMetric, NO_RECENT_ACTIVITY,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub const SIMILARITY_TIE_EPSILON: f64 = 1e-9;

/// Signals that contributed an item to the candidate pool
pub type SourceSet = BTreeSet<Signal>;

/// Normalized and raw values behind one blended score
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlendedSignals {
    pub pop_norm: f64,
    pub cooc_norm: f64,
    pub similarity_norm: f64,
    pub pop_raw: f64,
    pub cooc_raw: f64,
    pub similarity_raw: f64,
    /// Sources that produced the similarity term, in signal order
    pub similarity_sources: Vec<Signal>,
}

/// Personalization outcome for a boosted item
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileBoost {
    pub overlap: f64,
    pub multiplier: f64,
}

/// Working state threaded through the ranking pipeline
#[derive(Debug, Default)]
pub struct CandidateData {
    pub candidates: Vec<Candidate>,
    pub tags: HashMap<String, ItemTags>,
    pub sources: HashMap<String, SourceSet>,
    pub anchors: Vec<String>,
    pub anchors_fetched: bool,

    pub pop_scores: HashMap<String, f64>,
    pub cooc_scores: HashMap<String, f64>,
    pub emb_scores: HashMap<String, f64>,
    pub collab_scores: HashMap<String, f64>,
    pub content_scores: HashMap<String, f64>,
    pub session_scores: HashMap<String, f64>,

    pub signals: HashMap<String, BlendedSignals>,
    pub boosts: HashMap<String, ProfileBoost>,
    pub mmr: HashMap<String, MmrExplain>,
    pub caps: HashMap<String, CapsExplain>,
    pub signal_status: BTreeMap<Signal, SignalStatus>,
    pub source_metrics: BTreeMap<String, SourceMetric>,
}

impl CandidateData {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            ..Default::default()
        }
    }

    pub fn add_source(&mut self, item_id: &str, signal: Signal) {
        if item_id.is_empty() {
            return;
        }
        self.sources
            .entry(item_id.to_string())
            .or_default()
            .insert(signal);
    }

    pub fn record_status(&mut self, signal: Signal, status: SignalStatus) {
        self.signal_status.insert(signal, status);
    }

    pub fn record_metric(&mut self, stage: &str, input: usize, output: usize) {
        self.source_metrics
            .insert(stage.to_string(), SourceMetric { input, output });
    }

    pub fn is_boosted(&self, item_id: &str) -> bool {
        self.boosts.contains_key(item_id)
    }

    /// Anchors excluding the no-history placeholder.
    pub fn effective_anchor_count(&self) -> usize {
        match self.anchors.as_slice() {
            [only] if only == NO_RECENT_ACTIVITY => 0,
            anchors => anchors.len(),
        }
    }

    /// Drops score and source entries for items no longer in the pool.
    pub fn retain_candidates(&mut self) {
        let ids: HashSet<&str> = self.candidates.iter().map(|c| c.item_id.as_str()).collect();
        for scores in [
            &mut self.pop_scores,
            &mut self.collab_scores,
            &mut self.content_scores,
            &mut self.session_scores,
        ] {
            scores.retain(|id, _| ids.contains(id.as_str()));
        }
        self.sources.retain(|id, _| ids.contains(id.as_str()));
    }
}

/// Effective blend weights: request override, else config; negatives clamp
/// to zero and an all-zero blend falls back to popularity only.
pub fn resolve_weights(config: &EngineConfig, req: &Request) -> BlendWeights {
    let base = req.blend.unwrap_or(BlendWeights::new(
        config.blend_alpha,
        config.blend_beta,
        config.blend_gamma,
    ));
    let mut weights = BlendWeights::new(
        base.pop.max(0.0),
        base.cooc.max(0.0),
        base.similarity.max(0.0),
    );
    if weights.pop == 0.0 && weights.cooc == 0.0 && weights.similarity == 0.0 {
        weights.pop = 1.0;
    }
    weights
}

/// `raw / (raw + 1)` for positive values, 0 otherwise.
pub fn squash(raw: f64) -> f64 {
    if raw > 0.0 {
        raw / (raw + 1.0)
    } else {
        0.0
    }
}

/// Rescores every candidate as the weighted sum of its normalized signals.
pub fn apply_blended_scoring(data: &mut CandidateData, weights: &BlendWeights) {
    let mut signals = HashMap::with_capacity(data.candidates.len());
    for candidate in &mut data.candidates {
        let id = candidate.item_id.as_str();
        let pop_raw = data.pop_scores.get(id).copied().unwrap_or(0.0);
        let cooc_raw = data.cooc_scores.get(id).copied().unwrap_or(0.0);

        let mut blended = BlendedSignals {
            pop_norm: squash(pop_raw),
            cooc_norm: squash(cooc_raw),
            pop_raw,
            cooc_raw,
            ..Default::default()
        };

        let similarity = [
            (Signal::Embedding, data.emb_scores.get(id)),
            (Signal::Collaborative, data.collab_scores.get(id)),
            (Signal::Content, data.content_scores.get(id)),
            (Signal::Session, data.session_scores.get(id)),
        ];
        let normalized: Vec<(Signal, f64, f64)> = similarity
            .into_iter()
            .filter_map(|(signal, raw)| {
                let raw = *raw?;
                let norm = match signal {
                    Signal::Embedding => raw.clamp(0.0, 1.0),
                    _ => squash(raw),
                };
                (norm > 0.0).then_some((signal, norm, raw))
            })
            .collect();

        let best = normalized.iter().map(|(_, norm, _)| *norm).fold(0.0, f64::max);
        if best > 0.0 {
            for (signal, norm, raw) in &normalized {
                if (best - norm).abs() <= SIMILARITY_TIE_EPSILON {
                    if blended.similarity_sources.is_empty() {
                        blended.similarity_raw = *raw;
                    }
                    blended.similarity_sources.push(*signal);
                }
            }
            blended.similarity_norm = best;
        }

        candidate.score = weights.pop * blended.pop_norm
            + weights.cooc * blended.cooc_norm
            + weights.similarity * blended.similarity_norm;
        signals.insert(candidate.item_id.clone(), blended);
    }
    data.signals = signals;
}

/// Normalizes tag keys, sums duplicates, drops non-positive weights and
/// rescales so the weights sum to 1.
pub fn normalize_tag_weights(profile: &HashMap<String, f64>) -> HashMap<String, f64> {
    let mut normalized: HashMap<String, f64> = HashMap::with_capacity(profile.len());
    for (tag, weight) in profile {
        if *weight <= 0.0 || weight.is_nan() {
            continue;
        }
        let key = artifact_schema::normalize_tag(tag);
        if key.is_empty() {
            continue;
        }
        *normalized.entry(key).or_insert(0.0) += weight;
    }
    rescale(&mut normalized);
    normalized
}

/// `(1 - w) * primary + w * starter`, renormalized.
pub fn blend_tag_profiles(
    primary: &HashMap<String, f64>,
    starter: &HashMap<String, f64>,
    starter_weight: f64,
) -> HashMap<String, f64> {
    let weight = starter_weight.clamp(0.0, 1.0);
    if weight == 0.0 {
        return primary.clone();
    }
    if primary.is_empty() {
        return starter.clone();
    }

    let mut blended = HashMap::with_capacity(primary.len() + starter.len());
    let profile_weight = 1.0 - weight;
    if profile_weight > 0.0 {
        for (tag, value) in primary.iter().filter(|(_, v)| **v > 0.0) {
            blended.insert(tag.clone(), value * profile_weight);
        }
    }
    for (tag, value) in starter.iter().filter(|(_, v)| **v > 0.0) {
        *blended.entry(tag.clone()).or_insert(0.0) += value * weight;
    }
    rescale(&mut blended);
    blended
}

/// User profile merged with the request's starter profile: starter alone
/// when the user has no history, blended when both exist.
pub fn effective_profile(
    profile: HashMap<String, f64>,
    starter: &HashMap<String, f64>,
    starter_weight: f64,
) -> HashMap<String, f64> {
    if starter.is_empty() {
        return profile;
    }
    if profile.is_empty() {
        return starter.clone();
    }
    if starter_weight > 0.0 {
        return blend_tag_profiles(&profile, starter, starter_weight);
    }
    profile
}

/// Top `limit` tags by weight desc, then tag asc. `limit == 0` keeps all.
pub fn top_profile_tags(profile: &HashMap<String, f64>, limit: usize) -> Vec<String> {
    let mut weights: Vec<(&String, f64)> = profile
        .iter()
        .filter(|(_, w)| **w > 0.0)
        .map(|(t, w)| (t, *w))
        .collect();
    weights.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    if limit > 0 {
        weights.truncate(limit);
    }
    weights.into_iter().map(|(t, _)| t.clone()).collect()
}

fn rescale(values: &mut HashMap<String, f64>) {
    values.retain(|_, v| *v > 0.0);
    let sum: f64 = values.values().sum();
    if sum <= 0.0 {
        values.clear();
        return;
    }
    for value in values.values_mut() {
        *value /= sum;
    }
}

/// Inputs for the profile boost
#[derive(Debug, Clone, Copy)]
pub struct BoostSettings {
    pub profile_boost: f64,
    pub min_events: i64,
    pub cold_start_multiplier: f64,
}

impl BoostSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            profile_boost: config.profile_boost,
            min_events: config.profile_min_events_for_boost,
            cold_start_multiplier: config.profile_cold_start_multiplier,
        }
    }
}

/// Request event count, falling back to the anchor count and capped by it.
pub fn effective_event_count(recent_event_count: i64, anchor_count: usize) -> i64 {
    let anchors = anchor_count as i64;
    if recent_event_count <= 0 {
        anchors
    } else if anchors > 0 && recent_event_count > anchors {
        anchors
    } else {
        recent_event_count
    }
}

/// Multiplies each candidate by `1 + boost * overlap`, where overlap is the
/// profile weight carried by the item's tags. Users below the event threshold
/// get the excess attenuated by the cold-start multiplier.
pub fn apply_profile_boost(
    data: &mut CandidateData,
    profile: &HashMap<String, f64>,
    settings: BoostSettings,
    event_count: i64,
) {
    if profile.is_empty() || settings.profile_boost <= 0.0 {
        return;
    }
    let min_events = settings.min_events.max(0);
    let cold_scale = settings.cold_start_multiplier.clamp(0.0, 1.0);
    let attenuation = if min_events > 0 && event_count < min_events {
        cold_scale
    } else {
        1.0
    };

    for candidate in &mut data.candidates {
        let Some(tags) = data.tags.get(&candidate.item_id) else {
            continue;
        };
        let overlap: f64 = tags.tags.iter().filter_map(|t| profile.get(t)).sum();
        if overlap <= 0.0 {
            continue;
        }
        let mut multiplier = 1.0 + settings.profile_boost * overlap;
        if attenuation < 1.0 {
            multiplier = 1.0 + (multiplier - 1.0) * attenuation;
        }
        candidate.score *= multiplier;
        data.boosts.insert(
            candidate.item_id.clone(),
            ProfileBoost {
                overlap,
                multiplier,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn profile(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(t, w)| (t.to_string(), *w)).collect()
    }

    #[test]
    fn test_resolve_weights_clamps_and_falls_back() {
        let config = EngineConfig::default();
        let mut req = Request::new(uuid::Uuid::nil(), "home", 5);
        let weights = resolve_weights(&config, &req);
        assert_eq!(weights, BlendWeights::new(1.0, 0.1, 0.1));

        req.blend = Some(BlendWeights::new(-1.0, 0.0, 0.0));
        assert_eq!(resolve_weights(&config, &req), BlendWeights::new(1.0, 0.0, 0.0));

        req.blend = Some(BlendWeights::new(0.0, 2.0, -3.0));
        assert_eq!(resolve_weights(&config, &req), BlendWeights::new(0.0, 2.0, 0.0));
    }

    #[test]
    fn test_blend_scores_and_similarity_ties() {
        let mut data = CandidateData::new(vec![Candidate::new("a", 0.0), Candidate::new("b", 0.0)]);
        data.pop_scores.insert("a".into(), 1.0);
        data.cooc_scores.insert("a".into(), 3.0);
        data.emb_scores.insert("b".into(), 0.5);
        data.collab_scores.insert("b".into(), 1.0);

        apply_blended_scoring(&mut data, &BlendWeights::new(1.0, 1.0, 1.0));

        let a = &data.signals["a"];
        assert!(approx(a.pop_norm, 0.5));
        assert!(approx(a.cooc_norm, 0.75));
        assert!(approx(data.candidates[0].score, 1.25));

        // embedding 0.5 and collaborative 1/(1+1) tie
        let b = &data.signals["b"];
        assert!(approx(b.similarity_norm, 0.5));
        assert_eq!(b.similarity_sources, vec![Signal::Embedding, Signal::Collaborative]);
        assert!(approx(data.candidates[1].score, 0.5));
    }

    #[test]
    fn test_normalize_and_blend_profiles() {
        let user = normalize_tag_weights(&profile(&[(" Books ", 1.0), ("books", 1.0), ("Games", 2.0), ("x", -1.0)]));
        assert!(approx(user["books"], 0.5));
        assert!(approx(user["games"], 0.5));
        assert!(!user.contains_key("x"));

        let starter = profile(&[("music", 1.0)]);
        let blended = blend_tag_profiles(&user, &starter, 0.5);
        assert!(approx(blended["books"], 0.25));
        assert!(approx(blended["music"], 0.5));

        assert_eq!(effective_profile(HashMap::new(), &starter, 0.3), starter);
        assert_eq!(effective_profile(user.clone(), &starter, 0.0), user);
    }

    #[test]
    fn test_top_profile_tags_order() {
        let tags = top_profile_tags(&profile(&[("b", 0.3), ("a", 0.3), ("c", 0.4)]), 2);
        assert_eq!(tags, vec!["c", "a"]);
    }

    #[test]
    fn test_profile_boost_with_cold_start() {
        let mut data = CandidateData::new(vec![Candidate::new("a", 1.0), Candidate::new("b", 1.0)]);
        data.tags.insert("a".into(), ItemTags::new("a", ["books"]));
        data.tags.insert("b".into(), ItemTags::new("b", ["games"]));
        let settings = BoostSettings {
            profile_boost: 1.0,
            min_events: 3,
            cold_start_multiplier: 0.5,
        };

        apply_profile_boost(&mut data, &profile(&[("books", 1.0)]), settings, 1);

        assert!(approx(data.candidates[0].score, 1.5));
        assert!(approx(data.candidates[1].score, 1.0));
        assert!(data.is_boosted("a"));
        assert!(!data.is_boosted("b"));
    }

    #[test]
    fn test_effective_event_count() {
        assert_eq!(effective_event_count(0, 4), 4);
        assert_eq!(effective_event_count(10, 4), 4);
        assert_eq!(effective_event_count(2, 4), 2);
        assert_eq!(effective_event_count(5, 0), 5);
    }
}
