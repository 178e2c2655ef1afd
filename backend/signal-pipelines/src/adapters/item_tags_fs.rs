use crate::error::Result;
use crate::models::CatalogItem;
use crate::store::ItemTagSink;
use async_trait::async_trait;
use object_store::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TagDocument {
    #[serde(default)]
    items: Vec<CatalogItem>,
}

/// Writes `<base>/<tenant>/item_tags.json`, merging with what is already
/// there. Rows are keyed by `(namespace, item_id)`.
#[derive(Debug, Clone)]
pub struct FsItemTagStore {
    base_dir: PathBuf,
}

impl FsItemTagStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn path(&self, tenant: &str) -> PathBuf {
        self.base_dir.join(tenant).join("item_tags.json")
    }
}

#[async_trait]
impl ItemTagSink for FsItemTagStore {
    async fn upsert_item_tags(&self, tenant: &str, items: &[CatalogItem]) -> Result<()> {
        let path = self.path(tenant);
        let existing: TagDocument = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => TagDocument::default(),
            Err(err) => return Err(err.into()),
        };

        let mut rows: BTreeMap<(String, String), CatalogItem> = existing
            .items
            .into_iter()
            .map(|item| ((item.namespace.clone(), item.item_id.clone()), item))
            .collect();
        for item in items {
            rows.insert((item.namespace.clone(), item.item_id.clone()), item.clone());
        }

        let doc = TagDocument {
            items: rows.into_values().collect(),
        };
        write_atomic(&path, &serde_json::to_vec_pretty(&doc)?).await?;
        debug!(path = %path.display(), items = doc.items.len(), "item tags written");
        Ok(())
    }
}
