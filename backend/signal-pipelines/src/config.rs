use crate::error::{PipelineError, Result};
use object_store::S3Config;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Offline pipeline settings, loaded from a JSON file plus
/// `RECSYS_PIPELINES__*` environment overrides. Zero or empty values fall
/// back to the defaults below.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub out_dir: String,
    pub raw_events_dir: String,
    pub canonical_dir: String,
    pub checkpoint_dir: String,
    pub artifacts_dir: String,
    pub registry_dir: String,
    /// Legacy alias for `object_store.dir`
    pub object_store_dir: String,
    /// Optional catalog CSV; enables the content-similarity job
    pub catalog_csv: String,
    pub raw_source: RawSourceConfig,
    pub object_store: ObjectStoreConfig,
    pub db: DbConfig,
    pub limits: Limits,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    pub dir: String,
    pub s3: S3Config,
    pub postgres: PostgresSourceConfig,
    pub kafka: KafkaSourceConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PostgresSourceConfig {
    pub dsn: String,
    pub tenant_table: String,
    pub exposure_table: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KafkaSourceConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub group_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    #[serde(rename = "type")]
    pub store_type: String,
    pub dir: String,
    pub s3: S3Config,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub dsn: String,
    pub auto_create_tenant: bool,
    pub statement_timeout_s: u64,
}

/// Per-run caps. Crossing one aborts the run with `LimitExceeded`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_days_backfill: usize,
    pub max_events_per_run: usize,
    pub max_sessions_per_run: usize,
    pub max_items_per_session: usize,
    pub max_distinct_items_per_run: usize,
    pub max_neighbors_per_item: usize,
    pub max_items_per_artifact: usize,
    pub min_cooc_support: i64,
    pub max_items_per_user: usize,
    pub max_users_per_run: usize,
}

impl Limits {
    fn apply_defaults(&mut self) {
        fn or(value: &mut usize, default: usize) {
            if *value == 0 {
                *value = default;
            }
        }
        or(&mut self.max_days_backfill, 365);
        or(&mut self.max_events_per_run, 1_000_000);
        or(&mut self.max_sessions_per_run, 1_000_000);
        or(&mut self.max_items_per_session, 200);
        or(&mut self.max_distinct_items_per_run, 2_000_000);
        or(&mut self.max_neighbors_per_item, 50);
        or(&mut self.max_items_per_artifact, 1000);
        or(&mut self.max_items_per_user, 200);
        or(&mut self.max_users_per_run, 1_000_000);
        if self.min_cooc_support <= 0 {
            self.min_cooc_support = 2;
        }
    }
}

pub const RAW_SOURCE_FS: &str = "fs";
pub const RAW_SOURCE_S3: &str = "s3";

impl PipelineConfig {
    /// Reads `path` (JSON), layers environment overrides and fills defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let path = path.as_ref();
        let raw = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Json))
            .add_source(
                config::Environment::with_prefix("RECSYS_PIPELINES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;

        let mut cfg: PipelineConfig = raw.try_deserialize()?;
        cfg.apply_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults rooted at `out_dir`; used by tests and ad-hoc runs.
    pub fn with_out_dir(out_dir: impl Into<String>) -> Self {
        let mut cfg = PipelineConfig {
            out_dir: out_dir.into(),
            ..Default::default()
        };
        cfg.apply_defaults();
        cfg
    }

    pub fn apply_defaults(&mut self) {
        if self.out_dir.trim().is_empty() {
            self.out_dir = ".out".to_string();
        }
        let under_out = |name: &str| join(&self.out_dir, name);

        if self.raw_source.source_type.trim().is_empty() {
            self.raw_source.source_type = RAW_SOURCE_FS.to_string();
        }
        self.raw_source.source_type = self.raw_source.source_type.trim().to_lowercase();
        if self.raw_source.dir.trim().is_empty() {
            self.raw_source.dir = if self.raw_events_dir.trim().is_empty() {
                under_out("raw")
            } else {
                self.raw_events_dir.clone()
            };
        }
        if self.raw_source.postgres.tenant_table.is_empty() {
            self.raw_source.postgres.tenant_table = "tenants".to_string();
        }
        if self.raw_source.postgres.exposure_table.is_empty() {
            self.raw_source.postgres.exposure_table = "exposure_events".to_string();
        }

        if self.canonical_dir.trim().is_empty() {
            self.canonical_dir = under_out("canonical");
        }
        if self.artifacts_dir.trim().is_empty() {
            self.artifacts_dir = under_out("artifacts");
        }
        if self.registry_dir.trim().is_empty() {
            self.registry_dir = under_out("registry");
        }
        if self.checkpoint_dir.trim().is_empty() {
            self.checkpoint_dir = under_out("checkpoints");
        }

        if self.object_store.store_type.trim().is_empty() {
            self.object_store.store_type = "fs".to_string();
        }
        self.object_store.store_type = self.object_store.store_type.trim().to_lowercase();
        if self.object_store.dir.trim().is_empty() {
            self.object_store.dir = if self.object_store_dir.trim().is_empty() {
                under_out("objectstore")
            } else {
                self.object_store_dir.clone()
            };
        }
        self.object_store_dir = self.object_store.dir.clone();

        self.limits.apply_defaults();
    }

    pub fn validate(&self) -> Result<()> {
        match self.raw_source.source_type.as_str() {
            RAW_SOURCE_FS => {}
            RAW_SOURCE_S3 => {
                if self.raw_source.s3.bucket.trim().is_empty() {
                    return Err(PipelineError::Config(
                        "raw_source.s3.bucket is required".to_string(),
                    ));
                }
            }
            other => {
                return Err(PipelineError::Config(format!(
                    "unsupported raw_source.type {:?}",
                    other
                )))
            }
        }
        match self.object_store.store_type.as_str() {
            "fs" => Ok(()),
            "s3" if !self.object_store.s3.bucket.trim().is_empty() => Ok(()),
            "s3" => Err(PipelineError::Config(
                "object_store.s3.bucket is required".to_string(),
            )),
            other => Err(PipelineError::Config(format!(
                "unsupported object_store.type {:?}",
                other
            ))),
        }
    }

    pub fn catalog_path(&self) -> Option<PathBuf> {
        let path = self.catalog_csv.trim();
        (!path.is_empty()).then(|| PathBuf::from(path))
    }
}

fn join(base: &str, name: &str) -> String {
    Path::new(base).join(name).to_string_lossy().into_owned()
}
