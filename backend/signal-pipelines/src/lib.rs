//! Offline signal pipelines
//!
//! Ingests raw exposure events into a canonical per-day store, computes the
//! signal artifacts the ranking engine serves from (popularity, co-visitation,
//! implicit, session sequence and content similarity), validates them and
//! publishes them behind a per-(tenant, surface) manifest.

pub mod adapters;
pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod store;
pub mod workflow;

pub use config::{Limits, PipelineConfig};
pub use error::{ErrorKind, PipelineError, Result};
pub use jobs::{seal_artifact, BuiltArtifact};
pub use models::{CatalogItem, ExposureEvent};
pub use store::{
    ArtifactRegistry, ArtifactValidator, CanonicalStore, CatalogReader, Clock, FixedClock,
    ItemTagSink, RawEventSource, SystemClock,
};
pub use workflow::{Backfill, DayOutcome, Pipeline, PipelineDeps};
