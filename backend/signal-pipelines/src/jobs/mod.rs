//! Pipeline jobs: ingest, signal computation, catalog import and publish
//!
//! Compute jobs stream canonical events for one window and return a sealed
//! artifact blob plus its registry ref (uri still empty until publish).

pub mod content_sim;
pub mod cooc;
pub mod implicit;
pub mod import_tags;
pub mod ingest;
pub mod popularity;
pub mod publish;
pub mod session_seq;

pub use content_sim::ComputeContentSim;
pub use cooc::ComputeCooc;
pub use implicit::ComputeImplicit;
pub use import_tags::ImportItemTags;
pub use ingest::{IngestEvents, IngestStats};
pub use popularity::ComputePopularity;
pub use publish::PublishArtifacts;
pub use session_seq::ComputeSessionSeq;

use crate::error::{PipelineError, Result};
use artifact_schema::{format_rfc3339, Artifact, ArtifactKey, ArtifactRef, Payload, Window};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use tokio_util::sync::CancellationToken;

/// A computed artifact ready for staging and publish
#[derive(Debug, Clone)]
pub struct BuiltArtifact {
    pub artifact_ref: ArtifactRef,
    pub blob: Vec<u8>,
}

/// Hashes `payload` into a versioned envelope and encodes it.
pub fn seal_artifact<P: Payload>(
    tenant: &str,
    surface: &str,
    segment: &str,
    window: Window,
    payload: P,
    built_at: DateTime<Utc>,
) -> Result<BuiltArtifact> {
    let artifact = Artifact::new(tenant, surface, segment, window, payload).seal(built_at)?;
    let blob = artifact.encode()?;
    Ok(BuiltArtifact {
        artifact_ref: ArtifactRef {
            key: ArtifactKey {
                tenant: tenant.to_string(),
                surface: surface.to_string(),
                segment: segment.to_string(),
                artifact_type: P::TYPE,
            },
            window,
            version: artifact.version().to_string(),
            uri: String::new(),
            built_at: format_rfc3339(&built_at),
        },
        blob,
    })
}

pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Descending score, then ascending id
pub(crate) fn by_score_then_id<S: PartialOrd>(a: (&str, S), b: (&str, S)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.cmp(b.0))
}
