use crate::models::{Candidate, CapUsage, CapsExplain, ItemTags, MmrExplain};
use crate::services::rules::{match_structured, to_matchers};
use artifact_schema::normalize_tag;
use std::collections::{HashMap, HashSet};

/// Diversity Layer - greedy MMR with brand/category caps
///
/// Similarity between items is the Jaccard overlap of their free tags.
/// Brand and category tags feed the caps only.
/// lambda = 1.0: relevance only
/// lambda = 0.0: diversity only
#[derive(Debug, Clone)]
pub struct DiversityLayer {
    lambda: f64,
    brand_cap: usize,
    category_cap: usize,
    brand_matchers: Vec<String>,
    category_matchers: Vec<String>,
}

/// Picked items in selection order plus per-item diagnostics
#[derive(Debug, Default)]
pub struct MmrOutcome {
    pub items: Vec<Candidate>,
    pub mmr: HashMap<String, MmrExplain>,
    pub caps: HashMap<String, CapsExplain>,
}

#[derive(Default)]
struct TagIndex {
    free: HashMap<String, HashSet<String>>,
    brands: HashMap<String, Vec<String>>,
    categories: HashMap<String, Vec<String>>,
}

impl DiversityLayer {
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda,
            brand_cap: 0,
            category_cap: 0,
            brand_matchers: to_matchers(&["brand".to_string()]),
            category_matchers: to_matchers(&["category".to_string(), "cat".to_string()]),
        }
    }

    /// Caps of 0 are disabled.
    pub fn with_caps(mut self, brand_cap: usize, category_cap: usize) -> Self {
        self.brand_cap = brand_cap;
        self.category_cap = category_cap;
        self
    }

    /// Overrides the tag prefixes read as brand/category; empty keeps defaults.
    pub fn with_prefixes(mut self, brand: &[String], category: &[String]) -> Self {
        let brand = to_matchers(brand);
        if !brand.is_empty() {
            self.brand_matchers = brand;
        }
        let category = to_matchers(category);
        if !category.is_empty() {
            self.category_matchers = category;
        }
        self
    }

    pub fn is_active(&self) -> bool {
        self.lambda > 0.0 || self.brand_cap > 0 || self.category_cap > 0
    }

    /// Selects up to `top_k` candidates. Stops early when caps leave nothing
    /// eligible; ties keep input order.
    pub fn rerank(
        &self,
        candidates: &[Candidate],
        tags: &HashMap<String, ItemTags>,
        top_k: usize,
    ) -> MmrOutcome {
        let top_k = top_k.max(1);
        let mut outcome = MmrOutcome::default();
        if candidates.is_empty() {
            return outcome;
        }

        let max_score = candidates.iter().map(|c| c.score).fold(0.0, f64::max);
        let index = self.index_tags(tags);
        let mut brand_count: HashMap<String, usize> = HashMap::new();
        let mut category_count: HashMap<String, usize> = HashMap::new();
        let mut selected: Vec<String> = Vec::new();
        let mut remaining: Vec<&Candidate> = candidates.iter().collect();
        let empty = HashSet::new();

        while outcome.items.len() < top_k && !remaining.is_empty() {
            let mut best: Option<(usize, f64, f64)> = None; // (idx, max_sim, norm)
            let mut best_mmr_score = f64::NEG_INFINITY;

            for (i, candidate) in remaining.iter().enumerate() {
                let id = candidate.item_id.as_str();
                if !self.within_caps(id, &index, &brand_count, &category_count) {
                    continue;
                }

                let item_tags = index.free.get(id).unwrap_or(&empty);
                let max_sim = selected
                    .iter()
                    .map(|s| jaccard(item_tags, index.free.get(s).unwrap_or(&empty)))
                    .fold(0.0, f64::max);
                let norm = if max_score > 0.0 {
                    candidate.score / max_score
                } else {
                    0.0
                };
                let mmr_score = self.lambda * norm - (1.0 - self.lambda) * max_sim;

                if mmr_score > best_mmr_score {
                    best_mmr_score = mmr_score;
                    best = Some((i, max_sim, norm));
                }
            }

            // Caps block everything left
            let Some((best_idx, max_sim, norm)) = best else {
                break;
            };

            let pick = remaining.remove(best_idx);
            let id = pick.item_id.clone();
            outcome.mmr.insert(
                id.clone(),
                MmrExplain {
                    lambda: self.lambda,
                    max_similarity: max_sim,
                    penalty: (1.0 - self.lambda) * max_sim,
                    relevance: self.lambda * norm,
                    rank: outcome.items.len() + 1,
                },
            );

            let caps = CapsExplain {
                brand: cap_usage(self.brand_cap, index.brands.get(&id), &brand_count),
                category: cap_usage(self.category_cap, index.categories.get(&id), &category_count),
            };
            if !caps.is_empty() {
                outcome.caps.insert(id.clone(), caps);
            }

            for brand in index.brands.get(&id).into_iter().flatten() {
                *brand_count.entry(brand.clone()).or_insert(0) += 1;
            }
            for category in index.categories.get(&id).into_iter().flatten() {
                *category_count.entry(category.clone()).or_insert(0) += 1;
            }

            selected.push(id);
            outcome.items.push(pick.clone());
        }

        outcome
    }

    fn index_tags(&self, tags: &HashMap<String, ItemTags>) -> TagIndex {
        let mut index = TagIndex::default();
        for (item_id, item_tags) in tags {
            let mut free = HashSet::new();
            for tag in &item_tags.tags {
                let tag = normalize_tag(tag);
                if tag.is_empty() {
                    continue;
                }
                if let Some(brand) = match_structured(&tag, &self.brand_matchers) {
                    push_unique(index.brands.entry(item_id.clone()).or_default(), brand);
                } else if let Some(category) = match_structured(&tag, &self.category_matchers) {
                    push_unique(index.categories.entry(item_id.clone()).or_default(), category);
                } else {
                    free.insert(tag);
                }
            }
            if !free.is_empty() {
                index.free.insert(item_id.clone(), free);
            }
        }
        index
    }

    fn within_caps(
        &self,
        item_id: &str,
        index: &TagIndex,
        brand_count: &HashMap<String, usize>,
        category_count: &HashMap<String, usize>,
    ) -> bool {
        let under = |cap: usize, values: Option<&Vec<String>>, counts: &HashMap<String, usize>| {
            cap == 0
                || values
                    .into_iter()
                    .flatten()
                    .all(|v| counts.get(v).copied().unwrap_or(0) < cap)
        };
        under(self.brand_cap, index.brands.get(item_id), brand_count)
            && under(self.category_cap, index.categories.get(item_id), category_count)
    }
}

fn cap_usage(
    cap: usize,
    values: Option<&Vec<String>>,
    counts: &HashMap<String, usize>,
) -> Option<CapUsage> {
    if cap == 0 {
        return None;
    }
    let mut usage = CapUsage::default();
    if let Some(values) = values.filter(|v| !v.is_empty()) {
        usage.applied = true;
        usage.limit = Some(cap);
        usage.value = values.join(",");
        if let [only] = values.as_slice() {
            usage.count = Some(counts.get(only).copied().unwrap_or(0) + 1);
        }
    }
    Some(usage)
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}
