use crate::adapters::raw_jsonl::parse_exposure_lines;
use crate::error::Result;
use crate::models::ExposureEvent;
use crate::store::{CanonicalStore, EventStream, EVENT_CHANNEL_CAPACITY};
use artifact_schema::Window;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::write_atomic;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// Canonical events as one JSONL file per UTC day:
/// `<base>/<tenant>/<surface>/exposures/YYYY-MM-DD.jsonl`
#[derive(Debug, Clone)]
pub struct FsCanonicalStore {
    base_dir: PathBuf,
}

impl FsCanonicalStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn day_path(&self, tenant: &str, surface: &str, day: DateTime<Utc>) -> PathBuf {
        day_path(&self.base_dir, tenant, surface, day)
    }
}

fn day_path(base: &Path, tenant: &str, surface: &str, day: DateTime<Utc>) -> PathBuf {
    base.join(tenant)
        .join(surface)
        .join("exposures")
        .join(format!("{}.jsonl", day.format("%Y-%m-%d")))
}

#[async_trait]
impl CanonicalStore for FsCanonicalStore {
    async fn replace_exposure_events(
        &self,
        tenant: &str,
        surface: &str,
        day: DateTime<Utc>,
        events: &[ExposureEvent],
    ) -> Result<()> {
        let path = self.day_path(tenant, surface, day);
        if events.is_empty() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "canonical partition dropped"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            return Ok(());
        }

        let mut body = Vec::with_capacity(events.len() * 160);
        for event in events {
            serde_json::to_writer(&mut body, event)?;
            body.push(b'\n');
        }
        write_atomic(&path, &body).await?;
        Ok(())
    }

    async fn read_exposure_events(
        &self,
        tenant: &str,
        surface: &str,
        window: Window,
    ) -> Result<EventStream> {
        let paths: Vec<PathBuf> = window
            .days()
            .into_iter()
            .map(|day| self.day_path(tenant, surface, day))
            .collect();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for path in paths {
                let body = match tokio::fs::read(&path).await {
                    Ok(body) => body,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        let _ = tx.send(Err(err.into())).await;
                        return;
                    }
                };
                let events = match parse_exposure_lines(&path.display().to_string(), &body) {
                    Ok(events) => events,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                for event in events.into_iter().filter(|e| window.contains(e.ts)) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
