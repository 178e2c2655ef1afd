use crate::error::{PipelineError, Result};
use artifact_schema::{ArtifactKey, ArtifactRef, Window};
use object_store::write_atomic;
use std::path::PathBuf;

const CURRENT_POINTER: &str = "current.version";
const NO_SEGMENT: &str = "_";

/// Local staging area for freshly computed blobs:
/// `<base>/<tenant>/<surface>/<segment|_>/<type>/<START>_<END>/<version>.json`
/// next to a `current.version` pointer.
#[derive(Debug, Clone)]
pub struct FsStaging {
    base_dir: PathBuf,
}

/// A staged blob reloaded from disk
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    pub version: String,
    pub blob: Vec<u8>,
}

impl FsStaging {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn window_dir(&self, key: &ArtifactKey, window: &Window) -> PathBuf {
        let segment = match key.segment.trim() {
            "" => NO_SEGMENT,
            s => s,
        };
        self.base_dir
            .join(&key.tenant)
            .join(&key.surface)
            .join(segment)
            .join(key.artifact_type.as_str())
            .join(format!(
                "{}_{}",
                window.start.format("%Y-%m-%d"),
                window.end.format("%Y-%m-%d")
            ))
    }

    /// Writes the blob and moves the pointer to it; returns the blob path.
    pub async fn put(&self, artifact_ref: &ArtifactRef, blob: &[u8]) -> Result<PathBuf> {
        if artifact_ref.key.tenant.is_empty() || artifact_ref.key.surface.is_empty() {
            return Err(PipelineError::invalid("staging key needs tenant and surface"));
        }
        if artifact_ref.version.is_empty() {
            return Err(PipelineError::invalid("ref version must be set"));
        }
        let dir = self.window_dir(&artifact_ref.key, &artifact_ref.window);
        let path = dir.join(format!("{}.json", artifact_ref.version));
        write_atomic(&path, blob).await?;
        write_atomic(
            &dir.join(CURRENT_POINTER),
            format!("{}\n", artifact_ref.version).as_bytes(),
        )
        .await?;
        Ok(path)
    }

    /// Current staged blob; without a pointer the last `.json` by name wins.
    pub async fn load_current(&self, key: &ArtifactKey, window: &Window) -> Result<Option<StagedArtifact>> {
        let dir = self.window_dir(key, window);
        let version = match tokio::fs::read_to_string(dir.join(CURRENT_POINTER)).await {
            Ok(raw) => {
                let version = raw.trim().to_string();
                if version.is_empty() {
                    return Err(PipelineError::validation("staging current.version is empty"));
                }
                version
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                match last_json_version(&dir).await? {
                    Some(version) => version,
                    None => return Ok(None),
                }
            }
            Err(err) => return Err(err.into()),
        };
        let blob = tokio::fs::read(dir.join(format!("{}.json", version))).await?;
        Ok(Some(StagedArtifact { version, blob }))
    }
}

async fn last_json_version(dir: &std::path::Path) -> Result<Option<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut versions = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(version) = name.strip_suffix(".json") {
            if !version.starts_with('.') {
                versions.push(version.to_string());
            }
        }
    }
    versions.sort();
    Ok(versions.pop())
}
