//! Seams between the pipeline jobs and their storage backends

use crate::error::Result;
use crate::models::{CatalogItem, ExposureEvent};
use artifact_schema::{ArtifactRef, Manifest, Window};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Bounded event stream. A producer error is delivered in-band and ends the stream.
pub type EventStream = mpsc::Receiver<Result<ExposureEvent>>;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Raw exposure events as produced by the serving side
#[async_trait]
pub trait RawEventSource: Send + Sync {
    async fn read_exposure_events(
        &self,
        tenant: &str,
        surface: &str,
        window: Window,
    ) -> Result<EventStream>;
}

/// Day-partitioned, validated exposure events
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Replaces the whole partition for `day`; an empty slice drops it.
    async fn replace_exposure_events(
        &self,
        tenant: &str,
        surface: &str,
        day: DateTime<Utc>,
        events: &[ExposureEvent],
    ) -> Result<()>;

    async fn read_exposure_events(
        &self,
        tenant: &str,
        surface: &str,
        window: Window,
    ) -> Result<EventStream>;
}

#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn read_items(&self) -> Result<Vec<CatalogItem>>;
}

/// Destination of imported item tags
#[async_trait]
pub trait ItemTagSink: Send + Sync {
    async fn upsert_item_tags(&self, tenant: &str, items: &[CatalogItem]) -> Result<()>;
}

/// Append-only record of published versions plus the live manifest
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Duplicate versions are a no-op.
    async fn record(&self, artifact_ref: &ArtifactRef) -> Result<()>;

    async fn load_manifest(&self, tenant: &str, surface: &str) -> Result<Option<Manifest>>;

    async fn swap_manifest(&self, tenant: &str, surface: &str, next: &Manifest) -> Result<()>;
}

#[async_trait]
pub trait ArtifactValidator: Send + Sync {
    async fn validate_canonical(&self, tenant: &str, surface: &str, window: Window) -> Result<()>;

    fn validate_artifact(&self, artifact_ref: &ArtifactRef, blob: &[u8]) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Drains `stream` into `f`, stopping at the first producer error.
pub async fn for_each_event<F>(mut stream: EventStream, mut f: F) -> Result<()>
where
    F: FnMut(ExposureEvent) -> Result<()>,
{
    while let Some(event) = stream.recv().await {
        f(event?)?;
    }
    Ok(())
}
