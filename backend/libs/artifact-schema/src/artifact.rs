use crate::error::{SchemaError, SchemaResult};
use crate::window::{format_rfc3339, Window};
use crate::SCHEMA_VERSION;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Popularity,
    Cooc,
    Implicit,
    ContentSim,
    SessionSeq,
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 5] = [
        ArtifactType::Popularity,
        ArtifactType::Cooc,
        ArtifactType::Implicit,
        ArtifactType::ContentSim,
        ArtifactType::SessionSeq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Popularity => "popularity",
            ArtifactType::Cooc => "cooc",
            ArtifactType::Implicit => "implicit",
            ArtifactType::ContentSim => "content_sim",
            ArtifactType::SessionSeq => "session_seq",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| SchemaError::TypeMismatch {
                expected: "known artifact type".to_string(),
                actual: s.to_string(),
            })
    }
}

/// Build provenance. Zeroed (all empty) while hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    #[serde(default)]
    pub built_at: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_hash: String,
}

/// Typed artifact body. Each payload serializes to exactly one top-level key.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TYPE: ArtifactType;

    /// Number of top-level rows
    fn row_count(&self) -> usize;

    /// Fails on the first NaN or infinite score. JSON cannot carry them.
    fn check_scores(&self) -> SchemaResult<()> {
        Ok(())
    }
}

fn check_score(item_id: &str, score: f64) -> SchemaResult<()> {
    if score.is_finite() {
        Ok(())
    } else {
        Err(SchemaError::NonFiniteScore {
            item_id: item_id.to_string(),
        })
    }
}

fn check_user_items(users: &[UserItems]) -> SchemaResult<()> {
    users
        .iter()
        .flat_map(|user| &user.items)
        .try_for_each(|entry| check_score(&entry.item_id, entry.score))
}

// ============================================================================
// PAYLOAD ROWS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopularityItem {
    pub item_id: String,
    pub count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl PopularityItem {
    pub fn new(item_id: impl Into<String>, count: i64) -> Self {
        Self {
            item_id: item_id.into(),
            count,
            score: None,
        }
    }

    /// Ranking value: explicit score when present, else the count.
    pub fn value(&self) -> f64 {
        self.score.unwrap_or(self.count as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoocNeighbor {
    pub item_id: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoocRow {
    pub item_id: String,
    #[serde(rename = "items")]
    pub neighbors: Vec<CoocNeighbor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub item_id: String,
    pub score: f64,
}

/// Per-user scored items (implicit and session-sequence artifacts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserItems {
    pub user_id: String,
    pub items: Vec<ScoredEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub item_id: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopularityPayload {
    pub items: Vec<PopularityItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoocPayload {
    pub neighbors: Vec<CoocRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplicitPayload {
    pub users: Vec<UserItems>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSimPayload {
    pub items: Vec<ContentItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSeqPayload {
    pub users: Vec<UserItems>,
}

impl Payload for PopularityPayload {
    const TYPE: ArtifactType = ArtifactType::Popularity;
    fn row_count(&self) -> usize {
        self.items.len()
    }

    fn check_scores(&self) -> SchemaResult<()> {
        self.items
            .iter()
            .filter_map(|item| item.score.map(|score| (item, score)))
            .try_for_each(|(item, score)| check_score(&item.item_id, score))
    }
}

impl Payload for CoocPayload {
    const TYPE: ArtifactType = ArtifactType::Cooc;
    fn row_count(&self) -> usize {
        self.neighbors.len()
    }
}

impl Payload for ImplicitPayload {
    const TYPE: ArtifactType = ArtifactType::Implicit;
    fn row_count(&self) -> usize {
        self.users.len()
    }

    fn check_scores(&self) -> SchemaResult<()> {
        check_user_items(&self.users)
    }
}

impl Payload for ContentSimPayload {
    const TYPE: ArtifactType = ArtifactType::ContentSim;
    fn row_count(&self) -> usize {
        self.items.len()
    }
}

impl Payload for SessionSeqPayload {
    const TYPE: ArtifactType = ArtifactType::SessionSeq;
    fn row_count(&self) -> usize {
        self.users.len()
    }

    fn check_scores(&self) -> SchemaResult<()> {
        check_user_items(&self.users)
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Artifact envelope shared by every signal type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact<P> {
    pub v: u32,
    pub artifact_type: ArtifactType,
    pub tenant: String,
    pub surface: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub segment: String,
    pub window: Window,
    #[serde(flatten)]
    pub payload: P,
    #[serde(default)]
    pub build: BuildInfo,
}

pub type PopularityArtifact = Artifact<PopularityPayload>;
pub type CoocArtifact = Artifact<CoocPayload>;
pub type ImplicitArtifact = Artifact<ImplicitPayload>;
pub type ContentSimArtifact = Artifact<ContentSimPayload>;
pub type SessionSeqArtifact = Artifact<SessionSeqPayload>;

impl<P: Payload> Artifact<P> {
    /// Unsealed artifact; call [`Artifact::seal`] to stamp the build.
    pub fn new(
        tenant: impl Into<String>,
        surface: impl Into<String>,
        segment: impl Into<String>,
        window: Window,
        payload: P,
    ) -> Self {
        Self {
            v: SCHEMA_VERSION,
            artifact_type: P::TYPE,
            tenant: tenant.into(),
            surface: surface.into(),
            segment: segment.into(),
            window,
            payload,
            build: BuildInfo::default(),
        }
    }

    /// Content identity: hex SHA-256 of the compact JSON with `build` zeroed.
    pub fn compute_version(&self) -> SchemaResult<String> {
        let mut unbuilt = self.clone();
        unbuilt.build = BuildInfo::default();
        let bytes = serde_json::to_vec(&unbuilt)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Hashes the payload and stamps `version`, `source_hash` and `built_at`.
    /// Payloads with non-finite scores are rejected.
    pub fn seal(mut self, built_at: DateTime<Utc>) -> SchemaResult<Self> {
        self.payload.check_scores()?;
        let version = self.compute_version()?;
        self.build = BuildInfo {
            built_at: format_rfc3339(&built_at),
            version: version.clone(),
            source_hash: version,
        };
        Ok(self)
    }

    pub fn version(&self) -> &str {
        &self.build.version
    }

    /// Recomputes the hash and compares it with `build.version`.
    pub fn verify_version(&self) -> SchemaResult<()> {
        let computed = self.compute_version()?;
        if computed != self.build.version {
            return Err(SchemaError::VersionMismatch {
                declared: self.build.version.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Pretty JSON blob as written to the object store.
    pub fn encode(&self) -> SchemaResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parses a blob, checking `v` and `artifact_type`.
    pub fn decode(bytes: &[u8]) -> SchemaResult<Self> {
        let header: ArtifactHeader = serde_json::from_slice(bytes)?;
        header.expect(P::TYPE)?;
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Envelope fields readable without knowing the payload type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArtifactHeader {
    pub v: u32,
    pub artifact_type: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub surface: String,
    #[serde(default)]
    pub segment: String,
    pub window: Option<Window>,
    #[serde(default)]
    pub build: BuildInfo,
}

impl ArtifactHeader {
    pub fn parse(bytes: &[u8]) -> SchemaResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn expect(&self, expected: ArtifactType) -> SchemaResult<()> {
        if self.v != SCHEMA_VERSION {
            return Err(SchemaError::UnsupportedVersion(self.v));
        }
        if self.artifact_type != expected.as_str() {
            return Err(SchemaError::TypeMismatch {
                expected: expected.to_string(),
                actual: self.artifact_type.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::parse_rfc3339;

    fn window() -> Window {
        Window::day(parse_rfc3339("2024-01-01T00:00:00Z").unwrap())
    }

    fn popularity() -> PopularityArtifact {
        Artifact::new(
            "t1",
            "home",
            "",
            window(),
            PopularityPayload {
                items: vec![PopularityItem::new("a", 3), PopularityItem::new("b", 1)],
            },
        )
    }

    #[test]
    fn test_wire_layout() {
        let artifact = popularity();
        let json = String::from_utf8(serde_json::to_vec(&artifact).unwrap()).unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"v":1,"artifact_type":"popularity","tenant":"t1","surface":"home","#,
                r#""window":{"start":"2024-01-01T00:00:00Z","end":"2024-01-02T00:00:00Z"},"#,
                r#""items":[{"item_id":"a","count":3},{"item_id":"b","count":1}],"#,
                r#""build":{"built_at":"","version":""}}"#
            )
        );
    }

    #[test]
    fn test_seal_sets_version_and_source_hash() {
        let built_at = parse_rfc3339("2024-01-02T03:04:05Z").unwrap();
        let sealed = popularity().seal(built_at).unwrap();

        assert_eq!(sealed.build.version.len(), 64);
        assert_eq!(sealed.build.version, sealed.build.source_hash);
        assert_eq!(sealed.build.built_at, "2024-01-02T03:04:05Z");
        assert_eq!(sealed.build.version, popularity().compute_version().unwrap());
        sealed.verify_version().unwrap();
    }

    #[test]
    fn test_version_ignores_build_time() {
        let a = popularity()
            .seal(parse_rfc3339("2024-01-02T00:00:00Z").unwrap())
            .unwrap();
        let b = popularity()
            .seal(parse_rfc3339("2025-06-01T00:00:00Z").unwrap())
            .unwrap();
        assert_eq!(a.version(), b.version());
    }

    #[test]
    fn test_mutating_payload_changes_version() {
        let sealed = popularity().seal(Utc::now()).unwrap();
        let mut tampered = sealed.clone();
        tampered.payload.items[0].count = 4;

        assert_ne!(tampered.compute_version().unwrap(), sealed.version());
        assert!(matches!(
            tampered.verify_version(),
            Err(SchemaError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_round_trip() {
        let sealed = popularity().seal(Utc::now()).unwrap();
        let blob = sealed.encode().unwrap();

        let decoded = PopularityArtifact::decode(&blob).unwrap();
        assert_eq!(decoded, sealed);
        decoded.verify_version().unwrap();
    }

    #[test]
    fn test_decode_rejects_wrong_type() {
        let blob = popularity().encode().unwrap();
        let err = CoocArtifact::decode(&blob).unwrap_err();
        assert!(matches!(err, SchemaError::TypeMismatch { .. }));
    }

    #[test]
    fn test_optional_score_round_trips() {
        let mut artifact = popularity();
        artifact.payload.items.push(PopularityItem {
            item_id: "c".to_string(),
            count: 0,
            score: Some(0.5),
        });
        let sealed = artifact.seal(Utc::now()).unwrap();
        let decoded = PopularityArtifact::decode(&sealed.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload.items[2].value(), 0.5);
        decoded.verify_version().unwrap();
    }

    #[test]
    fn test_seal_rejects_non_finite_scores() {
        let implicit = Artifact::new(
            "t1",
            "home",
            "",
            window(),
            ImplicitPayload {
                users: vec![UserItems {
                    user_id: "u1".into(),
                    items: vec![
                        ScoredEntry { item_id: "a".into(), score: 0.5 },
                        ScoredEntry { item_id: "b".into(), score: f64::NAN },
                    ],
                }],
            },
        );
        let err = implicit.seal(Utc::now()).unwrap_err();
        assert!(matches!(err, SchemaError::NonFiniteScore { ref item_id } if item_id == "b"));

        let mut scored = popularity();
        scored.payload.items[1].score = Some(f64::INFINITY);
        assert!(matches!(
            scored.seal(Utc::now()),
            Err(SchemaError::NonFiniteScore { .. })
        ));
    }
}
