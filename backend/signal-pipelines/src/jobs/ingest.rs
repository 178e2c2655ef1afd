use super::check_cancelled;
use crate::error::{PipelineError, Result};
use crate::models::ExposureEvent;
use crate::store::{CanonicalStore, Clock, RawEventSource};
use artifact_schema::{day_start, Window};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub events: usize,
    pub days: usize,
}

/// Copies raw events into the canonical store, one full partition per day.
///
/// Every day of the window is replaced, including days with no events, so
/// re-running a window never duplicates or leaves stale data behind.
pub struct IngestEvents {
    raw: Arc<dyn RawEventSource>,
    canonical: Arc<dyn CanonicalStore>,
    clock: Arc<dyn Clock>,
    max_events: usize,
}

impl IngestEvents {
    pub fn new(
        raw: Arc<dyn RawEventSource>,
        canonical: Arc<dyn CanonicalStore>,
        clock: Arc<dyn Clock>,
        max_events: usize,
    ) -> Self {
        Self {
            raw,
            canonical,
            clock,
            max_events,
        }
    }

    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        tenant: &str,
        surface: &str,
        window: Window,
    ) -> Result<IngestStats> {
        window
            .validate()
            .map_err(|e| PipelineError::invalid(format!("invalid window: {}", e)))?;
        let start = self.clock.now();
        info!(tenant, surface, "ingest: start");

        let mut by_day: BTreeMap<DateTime<Utc>, Vec<ExposureEvent>> =
            window.days().into_iter().map(|day| (day, Vec::new())).collect();

        let mut stream = self.raw.read_exposure_events(tenant, surface, window).await?;
        let mut count = 0usize;
        while let Some(event) = stream.recv().await {
            check_cancelled(cancel)?;
            let event = event?;
            if !window.contains(event.ts) {
                continue;
            }
            count += 1;
            if self.max_events > 0 && count > self.max_events {
                return Err(PipelineError::limit("events", count, self.max_events));
            }
            if let Some(bucket) = by_day.get_mut(&day_start(event.ts)) {
                bucket.push(event);
            }
        }

        for (day, events) in &by_day {
            check_cancelled(cancel)?;
            self.canonical
                .replace_exposure_events(tenant, surface, *day, events)
                .await?;
            debug!(tenant, surface, day = %day.format("%Y-%m-%d"), events = events.len(), "ingest: partition replaced");
        }

        let stats = IngestStats {
            events: count,
            days: by_day.len(),
        };
        info!(
            tenant,
            surface,
            events = stats.events,
            days = stats.days,
            duration_ms = (self.clock.now() - start).num_milliseconds(),
            "ingest: done"
        );
        Ok(stats)
    }
}
