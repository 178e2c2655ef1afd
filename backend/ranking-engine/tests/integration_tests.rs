use artifact_schema::{
    Artifact, ArtifactType, CoocNeighbor, CoocPayload, CoocRow, Manifest, PopularityItem,
    PopularityPayload, Window,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use object_store::{FsObjectStore, ObjectWriter, RoutingReader};
use ranking_engine::models::{BlendWeights, Candidate, ExplainLevel, ItemTags, PopConstraints};
use ranking_engine::{
    ArtifactAlgoStore, ArtifactLoader, Engine, EngineConfig, EngineError, EngineStore,
    FixedClock, JsonRulesStore, LoaderConfig, Request, RequestContext, Response, Result,
    RulesManager, RulesManagerOptions, SimilarItemsEngine, TagStore, WarningCode,
};
use resilience::{Dispatcher, DispatcherConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const ORG: Uuid = Uuid::from_u128(0x0A11_CE00);

/// Catalog-backed store with popularity, tags and optional user history.
#[derive(Default)]
struct CatalogStore {
    popularity: Vec<Candidate>,
    tags: HashMap<String, ItemTags>,
    recent: Option<Vec<String>>,
}

impl CatalogStore {
    fn with_popularity(items: &[(&str, f64)]) -> Self {
        Self {
            popularity: items.iter().map(|(id, s)| Candidate::new(*id, *s)).collect(),
            ..Default::default()
        }
    }

    fn tag(mut self, item_id: &str, tags: &[&str]) -> Self {
        self.tags
            .insert(item_id.to_string(), ItemTags::new(item_id, tags.iter().copied()));
        self
    }
}

#[async_trait]
impl TagStore for CatalogStore {
    async fn list_items_tags(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        item_ids: &[String],
    ) -> Result<HashMap<String, ItemTags>> {
        Ok(item_ids
            .iter()
            .filter_map(|id| self.tags.get(id).map(|t| (id.clone(), t.clone())))
            .collect())
    }
}

#[async_trait]
impl EngineStore for CatalogStore {
    async fn popularity_top_k(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        _half_life_days: f64,
        k: usize,
        _constraints: &PopConstraints,
    ) -> Result<Vec<Candidate>> {
        Ok(self.popularity.iter().take(k).cloned().collect())
    }

    async fn list_user_recent_item_ids(
        &self,
        _ctx: &RequestContext,
        _org_id: Uuid,
        _namespace: &str,
        _user_id: &str,
        _since: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<String>> {
        self.recent.clone().ok_or(EngineError::FeatureUnavailable)
    }
}

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
}

fn engine(store: CatalogStore) -> Engine {
    Engine::new(EngineConfig::default(), Arc::new(store))
        .unwrap()
        .with_clock(Arc::new(FixedClock(fixed_now())))
}

fn engine_with_rules(store: CatalogStore, rules: &str) -> Engine {
    let rules_store = JsonRulesStore::new();
    rules_store.put_document(ORG, rules.to_string());
    let manager = RulesManager::new(Arc::new(rules_store), RulesManagerOptions::default());
    engine(store).with_rules(Arc::new(manager))
}

fn popularity_only(k: i64) -> Request {
    let mut req = Request::new(ORG, "home", k);
    req.blend = Some(BlendWeights::new(1.0, 0.0, 0.0));
    req
}

// ==================== Ranking Tests ====================

#[tokio::test]
async fn test_candidate_include_list_filtering() {
    let store = CatalogStore::with_popularity(&[("item_1", 1.0), ("item_2", 0.9), ("item_3", 0.8)]);
    let mut req = popularity_only(3);
    req.candidates.include_ids = vec!["item_1".into(), "item_3".into()];

    let resp = engine(store)
        .recommend(&RequestContext::new(), &req)
        .await
        .unwrap();

    assert_eq!(resp.item_ids(), vec!["item_1", "item_3"]);
    assert_eq!(resp.items[1].rank, 2);
    assert_eq!(resp.warnings.len(), 1);
    assert_eq!(resp.warnings[0].code, WarningCode::CandidatesIncludeFiltered);
    assert_eq!(
        resp.warnings[0].detail,
        "1 items removed by candidates.include_ids"
    );
}

#[tokio::test]
async fn test_include_list_without_matches() {
    let store = CatalogStore::with_popularity(&[("item_1", 1.0), ("item_2", 0.9)]);
    let mut req = popularity_only(2);
    req.candidates.include_ids = vec!["zzz".into()];

    let resp = engine(store)
        .recommend(&RequestContext::new(), &req)
        .await
        .unwrap();

    assert!(resp.items.is_empty());
    assert_eq!(resp.warnings[0].code, WarningCode::CandidatesIncludeEmpty);
}

#[tokio::test]
async fn test_constraint_filtering_normalizes_tags() {
    let store = CatalogStore::with_popularity(&[("keep", 1.0), ("drop", 0.9)])
        .tag("keep", &["books"])
        .tag("drop", &["games"]);
    let mut req = popularity_only(5);
    req.constraints.required_tags = vec!["Books".into()];

    let (resp, trace) = engine(store)
        .recommend_with_trace(&RequestContext::new(), &req)
        .await
        .unwrap();

    assert_eq!(resp.item_ids(), vec!["keep"]);
    let policy = &trace.policy_summary;
    assert_eq!(policy.constraint_filtered_count, 1);
    assert_eq!(policy.constraint_filtered_reasons["drop"], "include");
    assert_eq!(policy.final_count, 1);
    assert_eq!(policy.constraint_leak_count, 0);
}

#[tokio::test]
async fn test_zero_k_returns_empty_response() {
    let store = CatalogStore::with_popularity(&[("a", 1.0)]);
    let resp = engine(store)
        .recommend(&RequestContext::new(), &Request::new(ORG, "home", 0))
        .await
        .unwrap();
    assert!(resp.items.is_empty());
    assert!(resp.warnings.is_empty());
}

#[tokio::test]
async fn test_invalid_request_is_rejected() {
    let store = CatalogStore::with_popularity(&[("a", 1.0)]);
    let err = engine(store)
        .recommend(&RequestContext::new(), &Request::new(Uuid::nil(), "home", 5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_unavailable_signals_become_warnings() {
    let store = CatalogStore::with_popularity(&[("a", 3.0), ("b", 2.0)]);
    let mut req = Request::new(ORG, "home", 2);
    req.user_id = Some("u1".into());

    let resp = engine(store)
        .recommend(&RequestContext::new(), &req)
        .await
        .unwrap();

    assert_eq!(resp.item_ids(), vec!["a", "b"]);
    let details: Vec<&str> = resp.warnings.iter().map(|w| w.detail.as_str()).collect();
    assert_eq!(
        details,
        vec![
            "collaborative unavailable",
            "content unavailable",
            "cooc unavailable",
            "embedding unavailable",
            "session unavailable",
        ]
    );
    assert!(resp
        .warnings
        .iter()
        .all(|w| w.code == WarningCode::SignalUnavailable));
}

#[tokio::test]
async fn test_no_history_reports_placeholder_anchor() {
    let mut store = CatalogStore::with_popularity(&[("a", 3.0), ("b", 2.0)]);
    store.recent = Some(Vec::new());
    let mut req = popularity_only(2);
    req.user_id = Some("u1".into());
    req.options.explain_level = ExplainLevel::Summary;

    let (resp, trace) = engine(store)
        .recommend_with_trace(&RequestContext::new(), &req)
        .await
        .unwrap();

    let explain = resp.items[0].explain.as_ref().unwrap();
    assert_eq!(explain.anchors, vec![ranking_engine::models::NO_RECENT_ACTIVITY]);
    assert!(explain.blend.as_ref().unwrap().raw.is_none());
    assert_eq!(trace.anchors, vec![ranking_engine::models::NO_RECENT_ACTIVITY]);
}

#[tokio::test]
async fn test_cancelled_request_fails() {
    let store = CatalogStore::with_popularity(&[("a", 1.0)]);
    let ctx = RequestContext::new();
    ctx.cancel_token().cancel();
    let err = engine(store)
        .recommend(&ctx, &popularity_only(1))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

// ==================== Rules Tests ====================

#[tokio::test]
async fn test_rule_pin_injection() {
    let store = CatalogStore::with_popularity(&[("item_1", 1.0), ("item_3", 0.5)]);
    let rules = r#"[
        {"action": "pin", "items": ["item_2"], "priority": 90, "surface": "home"},
        {"action": "pin", "items": ["item_1"], "priority": 100, "surface": "home"}
    ]"#;

    let resp = engine_with_rules(store, rules)
        .recommend(&RequestContext::new(), &popularity_only(3))
        .await
        .unwrap();

    assert_eq!(resp.item_ids(), vec!["item_1", "item_2", "item_3"]);
    let injected: Vec<_> = resp
        .warnings
        .iter()
        .filter(|w| w.code == WarningCode::RulePinInjected)
        .collect();
    assert_eq!(injected.len(), 1);
    assert_eq!(injected[0].detail, "1 pinned items were injected into results");
}

#[tokio::test]
async fn test_block_beats_pin() {
    let store = CatalogStore::with_popularity(&[("item_a", 1.0), ("item_b", 0.5)]);
    let rules = r#"{"rules": [
        {"action": "block", "items": ["item_a"], "priority": 100},
        {"action": "pin", "items": ["item_a"], "priority": 90}
    ]}"#;

    let (resp, trace) = engine_with_rules(store, rules)
        .recommend_with_trace(&RequestContext::new(), &popularity_only(2))
        .await
        .unwrap();

    assert_eq!(resp.item_ids(), vec!["item_b"]);
    assert!(trace.rule_pinned.is_empty());
    assert_eq!(trace.policy_summary.rule_block_count, 1);
}

#[tokio::test]
async fn test_pin_with_zero_max_pins_is_ignored() {
    let store = CatalogStore::with_popularity(&[("item_1", 1.0), ("item_3", 0.5)]);
    let rules = r#"[{"action": "pin", "items": ["item_2"], "max_pins": 0}]"#;

    let resp = engine_with_rules(store, rules)
        .recommend(&RequestContext::new(), &popularity_only(3))
        .await
        .unwrap();

    assert_eq!(resp.item_ids(), vec!["item_1", "item_3"]);
    assert!(resp.warnings.is_empty());
}

#[tokio::test]
async fn test_rule_validity_follows_engine_clock() {
    let store = CatalogStore::with_popularity(&[("item_1", 1.0), ("item_3", 0.5)]);
    // the engine clock sits at 2024-03-15, well before today
    let rules = r#"[
        {"action": "pin", "items": ["item_2"], "surface": "home",
         "valid_from": "2024-03-01T00:00:00Z", "valid_until": "2024-04-01T00:00:00Z"},
        {"action": "block", "items": ["item_1"], "surface": "home",
         "valid_until": "2024-03-01T00:00:00Z"},
        {"action": "block", "items": ["item_3"], "surface": "home",
         "valid_from": "2024-04-01T00:00:00Z"}
    ]"#;

    let resp = engine_with_rules(store, rules)
        .recommend(&RequestContext::new(), &popularity_only(3))
        .await
        .unwrap();

    assert_eq!(resp.item_ids(), vec!["item_2", "item_1", "item_3"]);
}

// ==================== Determinism Tests ====================

#[tokio::test]
async fn test_recommend_is_deterministic() {
    let store = CatalogStore {
        recent: Some(vec!["item_1".into()]),
        ..CatalogStore::with_popularity(&[
            ("item_1", 1.0),
            ("item_2", 0.8),
            ("item_3", 0.8),
            ("item_4", 0.5),
            ("item_5", 0.2),
        ])
    }
    .tag("item_2", &["brand:acme"])
    .tag("item_4", &["brand:acme", "category:shoes"]);
    let rules = r#"[
        {"action": "boost", "tag": "brand:acme", "boost_value": 0.3, "surface": "home"},
        {"action": "pin", "items": ["item_5"], "surface": "home"}
    ]"#;
    let engine = engine_with_rules(store, rules);

    let mut req = Request::new(ORG, "home", 4);
    req.user_id = Some("u1".into());
    let ctx = RequestContext::new();

    let first = engine.recommend(&ctx, &req).await.unwrap();
    let second = engine.recommend(&ctx, &req).await.unwrap();

    assert!(!first.items.is_empty());
    assert!(!first.warnings.is_empty());
    assert_eq!(first.item_ids(), second.item_ids());
    let scored = |resp: &Response| -> Vec<(f64, usize, Vec<String>)> {
        resp.items
            .iter()
            .map(|i| (i.score, i.rank, i.reasons.clone()))
            .collect()
    };
    assert_eq!(scored(&first), scored(&second));
    assert_eq!(first.warnings, second.warnings);
    assert_eq!(first, second);
}

// ==================== Artifact Store Tests ====================

struct ArtifactFixture {
    _dir: tempfile::TempDir,
    store: Arc<ArtifactAlgoStore>,
}

async fn publish_fixture() -> ArtifactFixture {
    let dir = tempfile::tempdir().unwrap();
    let writer = FsObjectStore::new(dir.path());
    let tenant = ORG.to_string();
    let window = Window::day(Utc.with_ymd_and_hms(2024, 3, 14, 0, 0, 0).unwrap());

    let item = |id: &str, score: f64| {
        let mut item = PopularityItem::new(id, 1);
        item.score = Some(score);
        item
    };
    let popularity = Artifact::new(
        tenant.clone(),
        "default",
        "",
        window,
        PopularityPayload {
            items: vec![item("b", 1.0), item("a", 1.0), item("c", 0.5)],
        },
    )
    .seal(fixed_now())
    .unwrap();
    let cooc = Artifact::new(
        tenant.clone(),
        "default",
        "",
        window,
        CoocPayload {
            neighbors: vec![CoocRow {
                item_id: "a".into(),
                neighbors: vec![
                    CoocNeighbor {
                        item_id: "c".into(),
                        count: 4,
                    },
                    CoocNeighbor {
                        item_id: "b".into(),
                        count: 2,
                    },
                ],
            }],
        },
    )
    .seal(fixed_now())
    .unwrap();

    let pop_uri = writer
        .put(
            &format!("{}/default/popularity/{}.json", tenant, popularity.version()),
            "application/json",
            popularity.encode().unwrap(),
        )
        .await
        .unwrap();
    let cooc_uri = writer
        .put(
            &format!("{}/default/cooc/{}.json", tenant, cooc.version()),
            "application/json",
            cooc.encode().unwrap(),
        )
        .await
        .unwrap();
    let manifest = Manifest::new(tenant.clone(), "default").next(
        &[
            (ArtifactType::Popularity, pop_uri),
            (ArtifactType::Cooc, cooc_uri),
        ],
        fixed_now(),
    );
    writer
        .put(
            &format!("{}/default/manifest.json", tenant),
            "application/json",
            manifest.encode().unwrap(),
        )
        .await
        .unwrap();

    let loader = ArtifactLoader::new(
        Arc::new(RoutingReader::new()),
        LoaderConfig {
            manifest_template: format!(
                "file://{}/{{tenant}}/{{surface}}/manifest.json",
                dir.path().display()
            ),
            ..Default::default()
        },
    );
    ArtifactFixture {
        _dir: dir,
        store: Arc::new(ArtifactAlgoStore::new(Arc::new(loader))),
    }
}

#[tokio::test]
async fn test_artifact_popularity_tie_break() {
    let fixture = publish_fixture().await;
    let engine = Engine::new(EngineConfig::default(), fixture.store.clone()).unwrap();

    let resp = engine
        .recommend(&RequestContext::new(), &popularity_only(2))
        .await
        .unwrap();

    assert_eq!(resp.item_ids(), vec!["a", "b"]);
    assert_eq!(resp.items[0].rank, 1);
    assert_eq!(resp.items[1].rank, 2);
    assert!((resp.items[0].score - 0.5).abs() < 1e-9);
    assert!((resp.items[1].score - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_artifact_namespace_falls_back_to_default() {
    let fixture = publish_fixture().await;
    let engine = Engine::new(EngineConfig::default(), fixture.store.clone()).unwrap();
    let mut req = popularity_only(3);
    req.namespace = "shoes".into();

    let resp = engine.recommend(&RequestContext::new(), &req).await.unwrap();
    assert_eq!(resp.item_ids(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_artifact_missing_tenant_is_empty() {
    let fixture = publish_fixture().await;
    let engine = Engine::new(EngineConfig::default(), fixture.store.clone()).unwrap();
    let req = Request::new(Uuid::from_u128(99), "home", 3);

    let resp = engine.recommend(&RequestContext::new(), &req).await.unwrap();
    assert!(resp.items.is_empty());
}

#[tokio::test]
async fn test_similar_items_from_cooc_artifact() {
    let fixture = publish_fixture().await;
    let similar = SimilarItemsEngine::new(fixture.store.clone(), Arc::new(EngineConfig::default()))
        .with_clock(Arc::new(FixedClock(fixed_now())));

    let items = similar
        .find_similar(&RequestContext::new(), ORG, "default", "a", 5)
        .await
        .unwrap();

    let ids: Vec<&str> = items.iter().map(|i| i.item_id.as_str()).collect();
    assert_eq!(ids, vec!["c", "b"]);
    assert_eq!(items[0].reasons, vec!["co_visitation"]);
}

// ==================== Dispatcher Tests ====================

#[tokio::test]
async fn test_saturated_dispatcher_reports_overloaded() {
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig {
        max_in_flight: 1,
        max_queue: 0,
        wait_timeout: Duration::from_millis(10),
    }));
    let store = CatalogStore::with_popularity(&[("a", 1.0)]);
    let engine = engine(store).with_dispatcher(dispatcher.clone());
    let ctx = RequestContext::new();

    let permit = dispatcher.acquire(ctx.cancel_token()).await.unwrap();
    let err = engine.recommend(&ctx, &popularity_only(1)).await.unwrap_err();
    assert!(matches!(err, EngineError::Overloaded));

    drop(permit);
    let resp = tokio_test::assert_ok!(engine.recommend(&ctx, &popularity_only(1)).await);
    assert_eq!(resp.item_ids(), vec!["a"]);
}
