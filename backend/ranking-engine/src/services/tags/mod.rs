//! Item tag lookups backed by the catalog export or an in-memory map

use crate::error::Result;
use crate::models::ItemTags;
use crate::store::{RequestContext, TagStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// One row of the catalog tag export.
#[derive(Debug, Clone, Deserialize)]
struct TagRecord {
    item_id: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TagDocument {
    Rows(Vec<TagRecord>),
    Envelope { items: Vec<TagRecord> },
}

/// Tags keyed by namespace then item id. Lookups in a namespace without the
/// item fall back to `default`.
#[derive(Debug, Default)]
pub struct InMemoryTagStore {
    items: RwLock<HashMap<String, HashMap<String, ItemTags>>>,
}

impl InMemoryTagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, tags: ItemTags) {
        let namespace = normalize_namespace(namespace);
        let tags = tags.normalized();
        self.items
            .write()
            .entry(namespace)
            .or_default()
            .insert(tags.item_id.clone(), tags);
    }

    pub fn len(&self) -> usize {
        self.items.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, namespace: &str, item_ids: &[String]) -> HashMap<String, ItemTags> {
        let namespace = normalize_namespace(namespace);
        let items = self.items.read();
        let primary = items.get(&namespace);
        let fallback = items.get("default");

        let mut out = HashMap::with_capacity(item_ids.len());
        for id in item_ids {
            let id = id.trim();
            if id.is_empty() || out.contains_key(id) {
                continue;
            }
            let found = primary
                .and_then(|m| m.get(id))
                .or_else(|| fallback.and_then(|m| m.get(id)));
            if let Some(tags) = found {
                out.insert(id.to_string(), tags.clone());
            }
        }
        out
    }
}

#[async_trait]
impl TagStore for InMemoryTagStore {
    async fn list_items_tags(
        &self,
        ctx: &RequestContext,
        _org_id: Uuid,
        namespace: &str,
        item_ids: &[String],
    ) -> Result<HashMap<String, ItemTags>> {
        ctx.check()?;
        Ok(self.lookup(namespace, item_ids))
    }
}

/// Tag store loaded once from the JSON written by the catalog import.
#[derive(Debug, Default)]
pub struct FileTagStore {
    inner: InMemoryTagStore,
}

impl FileTagStore {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path).await?;
        let store = Self::from_slice(&raw)?;
        info!(path = %path.display(), items = store.inner.len(), "Loaded item tags");
        Ok(store)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let rows = match serde_json::from_slice::<TagDocument>(raw)? {
            TagDocument::Rows(rows) => rows,
            TagDocument::Envelope { items } => items,
        };
        let inner = InMemoryTagStore::new();
        for row in rows {
            let id = row.item_id.trim();
            if id.is_empty() {
                continue;
            }
            let mut tags = ItemTags::new(id, &row.tags);
            tags.price = row.price;
            tags.created_at = row.created_at;
            inner.insert(&row.namespace, tags);
        }
        Ok(Self { inner })
    }
}

#[async_trait]
impl TagStore for FileTagStore {
    async fn list_items_tags(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        item_ids: &[String],
    ) -> Result<HashMap<String, ItemTags>> {
        self.inner
            .list_items_tags(ctx, org_id, namespace, item_ids)
            .await
    }
}

fn normalize_namespace(namespace: &str) -> String {
    match namespace.trim() {
        "" => "default".to_string(),
        ns => ns.to_string(),
    }
}
