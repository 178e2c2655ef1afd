//! Day-level orchestration and backfills

use crate::adapters::{
    BuiltinValidator, CsvCatalogReader, FsCanonicalStore, FsCheckpoints, FsRegistry, FsStaging,
    JsonlRawSource, ValidatorOptions,
};
use crate::config::{PipelineConfig, RAW_SOURCE_S3};
use crate::error::{PipelineError, Result};
use crate::jobs::cooc::CoocLimits;
use crate::jobs::{
    BuiltArtifact, ComputeContentSim, ComputeCooc, ComputeImplicit, ComputePopularity,
    ComputeSessionSeq, IngestEvents, PublishArtifacts,
};
use crate::store::{
    ArtifactRegistry, ArtifactValidator, CanonicalStore, CatalogReader, Clock, RawEventSource,
};
use artifact_schema::{day_start, Manifest, Window};
use chrono::{DateTime, Duration, Utc};
use object_store::{FsObjectStore, ObjectReader, ObjectWriter, RoutingReader, S3ObjectStore};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything produced for one window
#[derive(Debug, Clone)]
pub struct DayOutcome {
    pub events: usize,
    pub manifest: Manifest,
}

/// ingest → validate → compute → stage → publish, for one window.
pub struct Pipeline {
    ingest: IngestEvents,
    validator: Arc<dyn ArtifactValidator>,
    popularity: ComputePopularity,
    cooc: ComputeCooc,
    implicit: ComputeImplicit,
    session_seq: ComputeSessionSeq,
    content_sim: Option<ComputeContentSim>,
    staging: FsStaging,
    publish: PublishArtifacts,
}

/// Backends a [`Pipeline`] is assembled from
pub struct PipelineDeps {
    pub raw: Arc<dyn RawEventSource>,
    pub canonical: Arc<dyn CanonicalStore>,
    pub objects: Arc<dyn ObjectWriter>,
    pub registry: Arc<dyn ArtifactRegistry>,
    pub catalog: Option<Arc<dyn CatalogReader>>,
    pub clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(cfg: &PipelineConfig, deps: PipelineDeps) -> Self {
        let limits = &cfg.limits;
        let clock = deps.clock;
        let validator: Arc<dyn ArtifactValidator> = Arc::new(BuiltinValidator::new(
            deps.canonical.clone(),
            ValidatorOptions {
                min_events: 0,
                max_events: limits.max_events_per_run,
                max_distinct_items: limits.max_distinct_items_per_run,
                max_distinct_sessions: limits.max_sessions_per_run,
                max_rows: limits.max_items_per_artifact,
                max_neighbors: limits.max_neighbors_per_item,
                max_items_per_user: limits.max_items_per_user,
            },
        ));

        Self {
            ingest: IngestEvents::new(
                deps.raw,
                deps.canonical.clone(),
                clock.clone(),
                limits.max_events_per_run,
            ),
            validator: validator.clone(),
            popularity: ComputePopularity::new(
                deps.canonical.clone(),
                clock.clone(),
                limits.max_items_per_artifact,
                limits.max_distinct_items_per_run,
            ),
            cooc: ComputeCooc::new(
                deps.canonical.clone(),
                clock.clone(),
                CoocLimits {
                    max_sessions: limits.max_sessions_per_run,
                    max_items_per_session: limits.max_items_per_session,
                    max_distinct_items: limits.max_distinct_items_per_run,
                    max_neighbors: limits.max_neighbors_per_item,
                    max_rows: limits.max_items_per_artifact,
                    min_support: limits.min_cooc_support,
                },
            ),
            implicit: ComputeImplicit::new(
                deps.canonical.clone(),
                clock.clone(),
                0,
                limits.max_users_per_run,
                limits.max_items_per_user,
            ),
            session_seq: ComputeSessionSeq::new(
                deps.canonical,
                clock.clone(),
                0,
                limits.max_users_per_run,
                limits.max_items_per_user,
            ),
            content_sim: deps.catalog.map(|catalog| {
                ComputeContentSim::new(Some(catalog), clock.clone(), limits.max_distinct_items_per_run)
            }),
            staging: FsStaging::new(&cfg.artifacts_dir),
            publish: PublishArtifacts::new(deps.objects, validator, deps.registry, clock),
        }
    }

    /// Filesystem and S3 backends as named by `cfg`.
    pub async fn from_config(cfg: &PipelineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut reader = RoutingReader::new();
        let objects: Arc<dyn ObjectWriter> = if cfg.object_store.store_type == "s3" {
            let store = Arc::new(S3ObjectStore::connect(cfg.object_store.s3.clone()).await);
            reader = reader.with_s3(store.clone());
            store
        } else {
            Arc::new(FsObjectStore::new(&cfg.object_store.dir))
        };

        let raw_base = if cfg.raw_source.source_type == RAW_SOURCE_S3 {
            let s3 = &cfg.raw_source.s3;
            if cfg.object_store.store_type != "s3" || cfg.object_store.s3.bucket != s3.bucket {
                let store = Arc::new(S3ObjectStore::connect(s3.clone()).await);
                reader = reader.with_s3(store);
            }
            let prefix = s3.prefix.trim_matches('/');
            if prefix.is_empty() {
                format!("s3://{}", s3.bucket)
            } else {
                format!("s3://{}/{}", s3.bucket, prefix)
            }
        } else {
            cfg.raw_source.dir.clone()
        };
        let reader: Arc<dyn ObjectReader> = Arc::new(reader);

        let catalog: Option<Arc<dyn CatalogReader>> = cfg
            .catalog_path()
            .map(|path| Arc::new(CsvCatalogReader::new(path)) as Arc<dyn CatalogReader>);

        Ok(Self::new(
            cfg,
            PipelineDeps {
                raw: Arc::new(JsonlRawSource::new(reader, raw_base)),
                canonical: Arc::new(FsCanonicalStore::new(&cfg.canonical_dir)),
                objects,
                registry: Arc::new(FsRegistry::new(&cfg.registry_dir)),
                catalog,
                clock,
            },
        ))
    }

    pub async fn run_day(
        &self,
        cancel: &CancellationToken,
        tenant: &str,
        surface: &str,
        segment: &str,
        window: Window,
    ) -> Result<DayOutcome> {
        let stats = self.ingest.execute(cancel, tenant, surface, window).await?;
        self.validator.validate_canonical(tenant, surface, window).await?;

        let mut built: Vec<BuiltArtifact> = vec![
            self.popularity.execute(cancel, tenant, surface, segment, window).await?,
            self.cooc.execute(cancel, tenant, surface, segment, window).await?,
            self.implicit.execute(cancel, tenant, surface, segment, window).await?,
            self.session_seq.execute(cancel, tenant, surface, segment, window).await?,
        ];
        if let Some(content_sim) = &self.content_sim {
            built.push(content_sim.execute(cancel, tenant, surface, segment, window).await?);
        }

        for artifact in &built {
            self.staging.put(&artifact.artifact_ref, &artifact.blob).await?;
        }
        let manifest = self.publish.execute(tenant, surface, &built).await?;
        Ok(DayOutcome {
            events: stats.events,
            manifest,
        })
    }
}

/// Runs day windows one at a time over an inclusive day range.
pub struct Backfill {
    max_days: usize,
    checkpoints: Option<FsCheckpoints>,
    clock: Arc<dyn Clock>,
}

impl Backfill {
    pub fn new(max_days: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_days,
            checkpoints: None,
            clock,
        }
    }

    /// Skip days at or before the stored checkpoint and advance it after each day.
    pub fn incremental(mut self, checkpoints: FsCheckpoints) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Returns the number of days run.
    pub async fn execute<F, Fut>(
        &self,
        cancel: &CancellationToken,
        tenant: &str,
        surface: &str,
        start_day: DateTime<Utc>,
        end_day: DateTime<Utc>,
        mut run: F,
    ) -> Result<usize>
    where
        F: FnMut(Window) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let start = day_start(start_day);
        let end = day_start(end_day);
        if end < start {
            return Err(PipelineError::invalid("end day is before start day"));
        }
        let days = (end - start).num_days() as usize + 1;
        if self.max_days > 0 && days > self.max_days {
            return Err(PipelineError::limit("backfill days", days, self.max_days));
        }

        let resume_after = match &self.checkpoints {
            Some(checkpoints) => checkpoints.last_completed(tenant, surface).await?,
            None => None,
        };

        let mut ran = 0usize;
        let mut day = start;
        while day <= end {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if resume_after.is_some_and(|done| day <= done) {
                info!(tenant, surface, day = %day.format("%Y-%m-%d"), "backfill: day already completed");
                day += Duration::days(1);
                continue;
            }

            let window = Window::day(day);
            info!(tenant, surface, day = %day.format("%Y-%m-%d"), "backfill: day start");
            if let Err(err) = run(window).await {
                warn!(tenant, surface, day = %day.format("%Y-%m-%d"), error = %err, "backfill: day failed");
                return Err(err);
            }
            if let Some(checkpoints) = &self.checkpoints {
                checkpoints
                    .mark_completed(tenant, surface, day, self.clock.now())
                    .await?;
            }
            ran += 1;
            day += Duration::days(1);
        }
        Ok(ran)
    }
}
