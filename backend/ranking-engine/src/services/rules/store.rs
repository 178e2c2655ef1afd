use super::decoder::{decode_rules, RuleScope};
use super::Rule;
use crate::error::Result;
use crate::store::{RequestContext, RulesStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Rules kept as one JSON document per org, in memory or as `<dir>/<org_id>.json`.
///
/// In-memory documents take precedence over the directory. A missing
/// document means the org has no rules.
#[derive(Default)]
pub struct JsonRulesStore {
    documents: RwLock<HashMap<Uuid, Vec<u8>>>,
    dir: Option<PathBuf>,
}

impl JsonRulesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            dir: Some(dir.into()),
        }
    }

    /// Replaces the org's rules document.
    pub fn put_document(&self, org_id: Uuid, raw: impl Into<Vec<u8>>) {
        self.documents.write().insert(org_id, raw.into());
    }

    pub fn remove_document(&self, org_id: Uuid) -> bool {
        self.documents.write().remove(&org_id).is_some()
    }

    async fn document(&self, org_id: Uuid) -> Result<Option<Vec<u8>>> {
        let cached = self.documents.read().get(&org_id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        match tokio::fs::read(dir.join(format!("{}.json", org_id))).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl RulesStore for JsonRulesStore {
    async fn list_active_rules_for_scope(
        &self,
        ctx: &RequestContext,
        org_id: Uuid,
        namespace: &str,
        surface: &str,
        segment: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Vec<Rule>> {
        ctx.check()?;
        let Some(raw) = self.document(org_id).await? else {
            return Ok(Vec::new());
        };
        let namespace = match namespace.trim() {
            "" => "default",
            ns => ns,
        };
        let scope = RuleScope {
            org_id,
            namespace,
            surface: surface.trim(),
            segment,
            now: at,
        };
        decode_rules(&raw, &scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rules::RuleTarget;

    #[tokio::test]
    async fn test_in_memory_document() {
        let store = JsonRulesStore::new();
        let org = Uuid::from_u128(3);
        store.put_document(org, r#"{"rules":[{"action":"pin","items":["x"],"surface":"home"}]}"#);

        let ctx = RequestContext::new();
        let home = store
            .list_active_rules_for_scope(&ctx, org, "", "home", None, Utc::now())
            .await
            .unwrap();
        assert_eq!(home.len(), 1);
        assert_eq!(home[0].target, RuleTarget::Item(vec!["x".into()]));
        assert_eq!(home[0].namespace, "default");

        let pdp = store
            .list_active_rules_for_scope(&ctx, org, "", "pdp", None, Utc::now())
            .await
            .unwrap();
        assert!(pdp.is_empty());
    }

    #[tokio::test]
    async fn test_directory_document() {
        let dir = tempfile::tempdir().unwrap();
        let org = Uuid::from_u128(4);
        std::fs::write(
            dir.path().join(format!("{}.json", org)),
            br#"[{"action":"block","tag":"clearance"}]"#,
        )
        .unwrap();

        let store = JsonRulesStore::from_dir(dir.path());
        let ctx = RequestContext::new();
        let rules = store
            .list_active_rules_for_scope(&ctx, org, "default", "home", None, Utc::now())
            .await
            .unwrap();
        assert_eq!(rules.len(), 1);

        let missing = store
            .list_active_rules_for_scope(&ctx, Uuid::from_u128(5), "default", "home", None, Utc::now())
            .await
            .unwrap();
        assert!(missing.is_empty());
    }
}
