use crate::error::Result;
use artifact_schema::{day_start, format_rfc3339};
use chrono::{DateTime, Utc};
use object_store::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Checkpoint {
    last_completed_day: DateTime<Utc>,
    updated_at: String,
}

/// Last fully published day per `(tenant, surface)`, stored at
/// `<base>/<tenant>/<surface>.json`.
#[derive(Debug, Clone)]
pub struct FsCheckpoints {
    base_dir: PathBuf,
}

impl FsCheckpoints {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path(&self, tenant: &str, surface: &str) -> PathBuf {
        self.base_dir.join(tenant).join(format!("{}.json", surface))
    }

    pub async fn last_completed(&self, tenant: &str, surface: &str) -> Result<Option<DateTime<Utc>>> {
        match tokio::fs::read(self.path(tenant, surface)).await {
            Ok(raw) => {
                let checkpoint: Checkpoint = serde_json::from_slice(&raw)?;
                Ok(Some(checkpoint.last_completed_day))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn mark_completed(
        &self,
        tenant: &str,
        surface: &str,
        day: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            last_completed_day: day_start(day),
            updated_at: format_rfc3339(&now),
        };
        write_atomic(&self.path(tenant, surface), &serde_json::to_vec_pretty(&checkpoint)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artifact_schema::parse_rfc3339;

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FsCheckpoints::new(dir.path());
        assert!(checkpoints.last_completed("t1", "home").await.unwrap().is_none());

        let day = parse_rfc3339("2024-01-03T15:00:00Z").unwrap();
        checkpoints.mark_completed("t1", "home", day, day).await.unwrap();
        assert_eq!(
            checkpoints.last_completed("t1", "home").await.unwrap(),
            Some(parse_rfc3339("2024-01-03T00:00:00Z").unwrap())
        );
    }
}
