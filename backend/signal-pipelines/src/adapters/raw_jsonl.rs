/// JSONL raw exposure source over any object reader (local dir or S3 prefix)
use crate::error::{PipelineError, Result};
use crate::models::ExposureEvent;
use crate::store::{EventStream, RawEventSource, EVENT_CHANNEL_CAPACITY};
use artifact_schema::Window;
use async_trait::async_trait;
use object_store::ObjectReader;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const FLAT_FILE: &str = "exposure.jsonl";

/// Reads `<base>/exposure.jsonl` when it exists, otherwise
/// `<base>/<tenant>/<surface>/exposure.YYYY-MM-DD.jsonl` for each day of the
/// window. Missing files yield no events.
pub struct JsonlRawSource {
    reader: Arc<dyn ObjectReader>,
    base: String,
}

impl JsonlRawSource {
    /// `base` is a directory path, `file://` uri or `s3://bucket/prefix`.
    pub fn new(reader: Arc<dyn ObjectReader>, base: impl Into<String>) -> Self {
        Self {
            reader,
            base: base.into(),
        }
    }

    fn uri(&self, rel: &str) -> String {
        format!("{}/{}", self.base.trim_end_matches('/'), rel)
    }

    async fn fetch(&self, uri: &str) -> Result<Option<Vec<u8>>> {
        match self.reader.get(uri).await {
            Ok(body) => Ok(Some(body)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_bodies(&self, tenant: &str, surface: &str, window: Window) -> Result<Vec<(String, Vec<u8>)>> {
        let flat = self.uri(FLAT_FILE);
        if let Some(body) = self.fetch(&flat).await? {
            return Ok(vec![(flat, body)]);
        }

        let mut bodies = Vec::new();
        for day in window.days() {
            let uri = self.uri(&format!(
                "{}/{}/exposure.{}.jsonl",
                tenant,
                surface,
                day.format("%Y-%m-%d")
            ));
            if let Some(body) = self.fetch(&uri).await? {
                bodies.push((uri, body));
            }
        }
        Ok(bodies)
    }
}

/// Parses JSONL, normalizing and validating every non-blank line.
pub fn parse_exposure_lines(source: &str, body: &[u8]) -> Result<Vec<ExposureEvent>> {
    let text = std::str::from_utf8(body)
        .map_err(|e| PipelineError::validation(format!("{}: {}", source, e)))?;
    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: ExposureEvent = serde_json::from_str(line).map_err(|e| {
            PipelineError::validation(format!("decode exposure jsonl {}:{}: {}", source, idx + 1, e))
        })?;
        let event = event.normalized();
        event.validate().map_err(|e| {
            PipelineError::validation(format!("invalid exposure event {}:{}: {}", source, idx + 1, e))
        })?;
        events.push(event);
    }
    Ok(events)
}

#[async_trait]
impl RawEventSource for JsonlRawSource {
    async fn read_exposure_events(
        &self,
        tenant: &str,
        surface: &str,
        window: Window,
    ) -> Result<EventStream> {
        let bodies = self.load_bodies(tenant, surface, window).await?;
        debug!(tenant, surface, files = bodies.len(), "raw exposure files resolved");

        let (tenant, surface) = (tenant.to_string(), surface.to_string());
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for (uri, body) in bodies {
                let events = match parse_exposure_lines(&uri, &body) {
                    Ok(events) => events,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                for event in events {
                    // the flat file may hold several scopes
                    if !window.contains(event.ts) || event.tenant != tenant || event.surface != surface {
                        continue;
                    }
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::for_each_event;
    use artifact_schema::parse_rfc3339;
    use object_store::RoutingReader;

    fn window() -> Window {
        Window::day(parse_rfc3339("2024-01-01T00:00:00Z").unwrap())
    }

    async fn collect(source: &JsonlRawSource) -> Result<Vec<ExposureEvent>> {
        let mut out = Vec::new();
        let stream = source.read_exposure_events("t1", "home", window()).await?;
        for_each_event(stream, |ev| {
            out.push(ev);
            Ok(())
        })
        .await?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_per_day_files_and_window_filter() {
        let dir = tempfile::tempdir().unwrap();
        let day_dir = dir.path().join("t1/home");
        std::fs::create_dir_all(&day_dir).unwrap();
        std::fs::write(
            day_dir.join("exposure.2024-01-01.jsonl"),
            concat!(
                r#"{"ts":"2024-01-01T01:00:00Z","tenant":"t1","surface":"home","session_id":"s1","item_id":"a"}"#,
                "\n\n",
                r#"{"ts":"2024-01-02T01:00:00Z","tenant":"t1","surface":"home","session_id":"s1","item_id":"late"}"#,
                "\n"
            ),
        )
        .unwrap();

        let source = JsonlRawSource::new(Arc::new(RoutingReader::new()), dir.path().display().to_string());
        let events = collect(&source).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].item_id, "a");
    }

    #[tokio::test]
    async fn test_missing_files_yield_empty_stream() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonlRawSource::new(Arc::new(RoutingReader::new()), dir.path().display().to_string());
        assert!(collect(&source).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("exposure.jsonl"),
            r#"{"ts":"2024-01-01T01:00:00Z","tenant":"t1","surface":"home","item_id":"a"}"#,
        )
        .unwrap();
        let source = JsonlRawSource::new(Arc::new(RoutingReader::new()), dir.path().display().to_string());
        let err = collect(&source).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationFailed);
    }
}
