pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod store;

pub use config::{EngineConfig, LoaderConfig, RulesManagerOptions};
pub use error::{EngineError, Result, ValidationError, ValidationErrors};
pub use models::{Request, Response, ScoredItem, TraceData, Warning, WarningCode};
pub use services::{
    ArtifactAlgoStore, ArtifactLoader, DiversityLayer, Engine, FileTagStore, InMemoryTagStore,
    JsonRulesStore, RecallLayer, RulesManager, SimilarItemsEngine,
};
pub use store::{Clock, EngineStore, FixedClock, RequestContext, RulesStore, SystemClock, TagStore};
