//! Artifact schema shared by the offline pipelines and the ranking engine
//!
//! Every signal artifact is wrapped in the same versioned envelope:
//! - `v`, `artifact_type`, `tenant`, `surface`, optional `segment`, `window`
//! - one payload key (`items`, `neighbors` or `users`)
//! - `build` carrying `built_at`, `version` and `source_hash`
//!
//! `version` is the hex SHA-256 of the compact JSON with `build` zeroed, so
//! identical inputs always publish identical versions.

mod error;

pub mod artifact;
pub mod manifest;
pub mod window;

pub use artifact::{
    Artifact, ArtifactHeader, ArtifactType, BuildInfo, CoocArtifact, CoocNeighbor, CoocPayload,
    CoocRow, ContentItem, ContentSimArtifact, ContentSimPayload, ImplicitArtifact,
    ImplicitPayload, Payload, PopularityArtifact, PopularityItem, PopularityPayload, ScoredEntry,
    SessionSeqArtifact, SessionSeqPayload, UserItems,
};
pub use error::{SchemaError, SchemaResult};
pub use manifest::{ArtifactKey, ArtifactRef, Manifest};
pub use window::{date_start, day_start, format_rfc3339, parse_rfc3339, Window};

/// Current envelope version for artifacts and manifests
pub const SCHEMA_VERSION: u32 = 1;

/// Trim + lowercase; every tag comparison goes through this.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

/// Normalized, deduplicated tags in first-seen order; empties dropped.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = normalize_tag(tag.as_ref());
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}
