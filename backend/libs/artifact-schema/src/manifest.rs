use crate::artifact::ArtifactType;
use crate::error::{SchemaError, SchemaResult};
use crate::window::{format_rfc3339, Window};
use crate::SCHEMA_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pointer document naming the current artifact per type for a (tenant, surface).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub v: u32,
    pub tenant: String,
    pub surface: String,
    #[serde(default)]
    pub current: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: String,
}

impl Manifest {
    pub fn new(tenant: impl Into<String>, surface: impl Into<String>) -> Self {
        Self {
            v: SCHEMA_VERSION,
            tenant: tenant.into(),
            surface: surface.into(),
            current: BTreeMap::new(),
            updated_at: String::new(),
        }
    }

    pub fn uri(&self, artifact_type: ArtifactType) -> Option<&str> {
        self.current
            .get(artifact_type.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    /// Copy of `self` with `updates` overwriting their types, stamped `at`.
    pub fn next(&self, updates: &[(ArtifactType, String)], at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        for (artifact_type, uri) in updates {
            next.current
                .insert(artifact_type.as_str().to_string(), uri.clone());
        }
        next.updated_at = format_rfc3339(&at);
        next
    }

    pub fn validate(&self) -> SchemaResult<()> {
        if self.v != SCHEMA_VERSION {
            return Err(SchemaError::UnsupportedVersion(self.v));
        }
        if self.tenant.trim().is_empty() || self.surface.trim().is_empty() {
            return Err(SchemaError::Serialization(
                "manifest tenant and surface are required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> SchemaResult<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn encode(&self) -> SchemaResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub tenant: String,
    pub surface: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub segment: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
}

/// Registry record for one published artifact version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: ArtifactKey,
    pub window: Window,
    pub version: String,
    pub uri: String,
    pub built_at: String,
}
