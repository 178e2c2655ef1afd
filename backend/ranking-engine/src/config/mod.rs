use crate::error::ValidationErrors;
use serde::Deserialize;
use std::time::Duration;

/// Ranking knobs shared by every request served by an [`crate::Engine`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Blend weights
    pub blend_alpha: f64, // popularity
    pub blend_beta: f64,  // co-visitation
    pub blend_gamma: f64, // similarity (embedding/collab/content/session)

    // Personalization
    pub profile_boost: f64,
    pub profile_window_days: f64,
    pub profile_top_n_tags: i64,
    pub profile_min_events_for_boost: i64,
    pub profile_cold_start_multiplier: f64,
    pub profile_starter_blend_weight: f64,

    // MMR and caps (0 disables)
    pub mmr_lambda: f64,
    pub brand_cap: i64,
    pub category_cap: i64,
    pub brand_tag_prefixes: Vec<String>,
    pub category_tag_prefixes: Vec<String>,

    // Windows and exclusions
    pub half_life_days: f64,
    pub co_vis_window_days: i64,
    pub purchased_window_days: i64,
    pub rule_exclude_events: bool,
    pub exclude_event_types: Vec<i64>,

    pub rules_enabled: bool,

    // Fanout and request caps (0 disables the cap)
    pub popularity_fanout: i64,
    pub max_k: i64,
    pub max_fanout: i64,
    pub max_exclude_ids: i64,
    pub max_anchors_injected: i64,

    // Session retriever
    pub session_lookback_events: i64,
    pub session_lookahead_minutes: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            blend_alpha: 1.0,
            blend_beta: 0.1,
            blend_gamma: 0.1,
            profile_boost: 0.7,
            profile_window_days: 30.0,
            profile_top_n_tags: 10,
            profile_min_events_for_boost: 0,
            profile_cold_start_multiplier: 0.5,
            profile_starter_blend_weight: 0.0,
            mmr_lambda: 0.0,
            brand_cap: 0,
            category_cap: 0,
            brand_tag_prefixes: vec!["brand".to_string()],
            category_tag_prefixes: vec!["category".to_string(), "cat".to_string()],
            half_life_days: 14.0,
            co_vis_window_days: 30,
            purchased_window_days: 30,
            rule_exclude_events: false,
            exclude_event_types: Vec::new(),
            rules_enabled: true,
            popularity_fanout: 200,
            max_k: 0,
            max_fanout: 0,
            max_exclude_ids: 0,
            max_anchors_injected: 0,
            session_lookback_events: 10,
            session_lookahead_minutes: 30.0,
        }
    }
}

impl EngineConfig {
    /// Loads from `RECSYS_ENGINE_*` variables (and `.env`), falling back to defaults.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let defaults = EngineConfig::default();
        let config = config::Config::builder()
            .set_default("blend_alpha", defaults.blend_alpha)?
            .set_default("blend_beta", defaults.blend_beta)?
            .set_default("blend_gamma", defaults.blend_gamma)?
            .set_default("profile_boost", defaults.profile_boost)?
            .set_default("profile_window_days", defaults.profile_window_days)?
            .set_default("profile_top_n_tags", defaults.profile_top_n_tags)?
            .set_default(
                "profile_min_events_for_boost",
                defaults.profile_min_events_for_boost,
            )?
            .set_default(
                "profile_cold_start_multiplier",
                defaults.profile_cold_start_multiplier,
            )?
            .set_default(
                "profile_starter_blend_weight",
                defaults.profile_starter_blend_weight,
            )?
            .set_default("mmr_lambda", defaults.mmr_lambda)?
            .set_default("brand_cap", defaults.brand_cap)?
            .set_default("category_cap", defaults.category_cap)?
            .set_default("brand_tag_prefixes", defaults.brand_tag_prefixes.clone())?
            .set_default(
                "category_tag_prefixes",
                defaults.category_tag_prefixes.clone(),
            )?
            .set_default("half_life_days", defaults.half_life_days)?
            .set_default("co_vis_window_days", defaults.co_vis_window_days)?
            .set_default("purchased_window_days", defaults.purchased_window_days)?
            .set_default("rule_exclude_events", defaults.rule_exclude_events)?
            .set_default("exclude_event_types", Vec::<i64>::new())?
            .set_default("rules_enabled", defaults.rules_enabled)?
            .set_default("popularity_fanout", defaults.popularity_fanout)?
            .set_default("max_k", defaults.max_k)?
            .set_default("max_fanout", defaults.max_fanout)?
            .set_default("max_exclude_ids", defaults.max_exclude_ids)?
            .set_default("max_anchors_injected", defaults.max_anchors_injected)?
            .set_default("session_lookback_events", defaults.session_lookback_events)?
            .set_default(
                "session_lookahead_minutes",
                defaults.session_lookahead_minutes,
            )?
            .add_source(
                config::Environment::with_prefix("RECSYS_ENGINE")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("brand_tag_prefixes")
                    .with_list_parse_key("category_tag_prefixes")
                    .with_list_parse_key("exclude_event_types"),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();

        let non_negative_floats = [
            ("blend_alpha", self.blend_alpha),
            ("blend_beta", self.blend_beta),
            ("blend_gamma", self.blend_gamma),
            ("profile_boost", self.profile_boost),
            ("profile_window_days", self.profile_window_days),
            ("half_life_days", self.half_life_days),
            ("session_lookahead_minutes", self.session_lookahead_minutes),
        ];
        for (field, value) in non_negative_floats {
            if value < 0.0 || value.is_nan() {
                errs.push(field, "must be >= 0");
            }
        }

        let non_negative_ints = [
            ("profile_top_n_tags", self.profile_top_n_tags),
            ("brand_cap", self.brand_cap),
            ("category_cap", self.category_cap),
            ("co_vis_window_days", self.co_vis_window_days),
            ("purchased_window_days", self.purchased_window_days),
            ("popularity_fanout", self.popularity_fanout),
            ("max_k", self.max_k),
            ("max_fanout", self.max_fanout),
            ("max_exclude_ids", self.max_exclude_ids),
            ("max_anchors_injected", self.max_anchors_injected),
            ("session_lookback_events", self.session_lookback_events),
        ];
        for (field, value) in non_negative_ints {
            if value < 0 {
                errs.push(field, "must be >= 0");
            }
        }

        if self.profile_min_events_for_boost < -1 {
            errs.push("profile_min_events_for_boost", "must be >= -1");
        }

        let unit_interval = [
            (
                "profile_cold_start_multiplier",
                self.profile_cold_start_multiplier,
            ),
            (
                "profile_starter_blend_weight",
                self.profile_starter_blend_weight,
            ),
            ("mmr_lambda", self.mmr_lambda),
        ];
        for (field, value) in unit_interval {
            if !(0.0..=1.0).contains(&value) {
                errs.push(field, "must be between 0 and 1");
            }
        }

        errs.into_result()
    }

    /// Candidates to request from a source for `k` results: the popularity
    /// fanout when it exceeds `k`, bounded by `max_fanout`.
    pub fn fanout_for(&self, k: usize) -> usize {
        let configured = usize::try_from(self.popularity_fanout).unwrap_or(0);
        let mut fanout = if configured == 0 || configured < k {
            k
        } else {
            configured
        };
        if self.max_fanout > 0 {
            fanout = fanout.min(self.max_fanout as usize);
        }
        if fanout < 1 {
            fanout = k;
        }
        fanout
    }

    pub(crate) fn uses_mmr(&self) -> bool {
        self.mmr_lambda > 0.0
    }

    pub(crate) fn uses_caps(&self) -> bool {
        self.brand_cap > 0 || self.category_cap > 0
    }
}

/// Artifact loader settings
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Manifest location with `{tenant}` and `{surface}` placeholders
    pub manifest_template: String,
    pub manifest_ttl: Duration,
    pub artifact_ttl: Duration,
    /// Reject blobs above this size (0 = unlimited)
    pub max_bytes: u64,
    /// Per-object read deadline (zero = none)
    pub fetch_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            manifest_template: String::new(),
            manifest_ttl: ttl_cache::ttl::MANIFEST,
            artifact_ttl: ttl_cache::ttl::ARTIFACT,
            max_bytes: 0,
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RulesManagerOptions {
    pub refresh_interval: Duration,
    pub max_pin_slots: usize,
    pub enabled: bool,
}

impl Default for RulesManagerOptions {
    fn default() -> Self {
        Self {
            refresh_interval: ttl_cache::ttl::RULES,
            max_pin_slots: 3,
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_fanout_for() {
        let mut config = EngineConfig {
            popularity_fanout: 50,
            ..Default::default()
        };
        assert_eq!(config.fanout_for(10), 50);
        assert_eq!(config.fanout_for(80), 80);

        config.max_fanout = 30;
        assert_eq!(config.fanout_for(10), 30);

        config.popularity_fanout = 0;
        config.max_fanout = 0;
        assert_eq!(config.fanout_for(7), 7);
    }

    #[test]
    fn test_fanout_is_monotonic_in_k() {
        for (popularity_fanout, max_fanout) in [(0, 0), (50, 0), (50, 30), (0, 100), (200, 120)] {
            let config = EngineConfig {
                popularity_fanout,
                max_fanout,
                ..Default::default()
            };
            let mut previous = 0;
            for k in 1..=250usize {
                let fanout = config.fanout_for(k);
                assert!(fanout >= previous, "fanout shrank at k={} for {:?}", k, (popularity_fanout, max_fanout));
                if max_fanout == 0 || k <= max_fanout as usize {
                    assert!(fanout >= k, "fanout {} below k={}", fanout, k);
                } else {
                    assert_eq!(fanout, max_fanout as usize);
                }
                previous = fanout;
            }
        }
    }

    #[test]
    fn test_invalid_config_collects_every_field() {
        let config = EngineConfig {
            blend_alpha: -1.0,
            mmr_lambda: 1.5,
            profile_min_events_for_boost: -2,
            brand_cap: -1,
            ..Default::default()
        };

        let errs = config.validate().unwrap_err();
        let fields: Vec<&str> = errs.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "blend_alpha",
                "brand_cap",
                "profile_min_events_for_boost",
                "mmr_lambda"
            ]
        );
    }
}
