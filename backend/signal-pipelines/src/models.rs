use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// One item shown to a user in a served list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureEvent {
    #[serde(default)]
    pub v: u32,
    #[serde(default)]
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub surface: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(default)]
    pub item_id: String,
    #[serde(default)]
    pub rank: i64,
    /// Opaque per-user attributes; carried through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traits: Option<serde_json::Value>,
}

impl ExposureEvent {
    /// Trimmed copy with the schema version defaulted.
    pub fn normalized(mut self) -> Self {
        if self.v == 0 {
            self.v = EVENT_SCHEMA_VERSION;
        }
        for field in [
            &mut self.tenant,
            &mut self.surface,
            &mut self.user_id,
            &mut self.session_id,
            &mut self.request_id,
            &mut self.item_id,
        ] {
            let trimmed = field.trim();
            if trimmed.len() != field.len() {
                *field = trimmed.to_string();
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.v != EVENT_SCHEMA_VERSION {
            return Err(PipelineError::validation(format!(
                "unsupported event version {}",
                self.v
            )));
        }
        let required = [
            ("tenant", &self.tenant),
            ("surface", &self.surface),
            ("session_id", &self.session_id),
            ("item_id", &self.item_id),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(PipelineError::validation(format!("event {} is required", field)));
            }
        }
        if self.ts == DateTime::<Utc>::default() {
            return Err(PipelineError::validation("event ts is required"));
        }
        if self.rank < 0 {
            return Err(PipelineError::validation(format!(
                "event rank must be >= 0, got {}",
                self.rank
            )));
        }
        Ok(())
    }
}

/// Item tag record; the JSON shape read back by the engine's file tag store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub item_id: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: &str) -> ExposureEvent {
        serde_json::from_str::<ExposureEvent>(raw).unwrap().normalized()
    }

    #[test]
    fn test_normalize_and_validate() {
        let ev = event(
            r#"{"ts":"2024-01-01T10:00:00+02:00","tenant":" t1 ","surface":"home","session_id":"s1","item_id":" a ","rank":3}"#,
        );
        assert_eq!(ev.v, 1);
        assert_eq!(ev.tenant, "t1");
        assert_eq!(ev.item_id, "a");
        assert_eq!(ev.ts.to_rfc3339(), "2024-01-01T08:00:00+00:00");
        ev.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let ev = event(r#"{"ts":"2024-01-01T00:00:00Z","tenant":"t1","surface":"home","item_id":"a"}"#);
        assert!(ev.validate().unwrap_err().to_string().contains("session_id"));

        let ev = event(r#"{"tenant":"t1","surface":"home","session_id":"s","item_id":"a"}"#);
        assert!(ev.validate().unwrap_err().to_string().contains("ts"));

        let ev = event(
            r#"{"v":2,"ts":"2024-01-01T00:00:00Z","tenant":"t1","surface":"home","session_id":"s","item_id":"a"}"#,
        );
        assert!(ev.validate().is_err());
    }
}
