//! Storage backends for the pipeline seams in [`crate::store`]

pub mod canonical_fs;
pub mod catalog_csv;
pub mod checkpoint;
pub mod item_tags_fs;
pub mod raw_jsonl;
pub mod registry_fs;
pub mod staging;
pub mod validator;

pub use canonical_fs::FsCanonicalStore;
pub use catalog_csv::CsvCatalogReader;
pub use checkpoint::FsCheckpoints;
pub use item_tags_fs::FsItemTagStore;
pub use raw_jsonl::JsonlRawSource;
pub use registry_fs::FsRegistry;
pub use staging::{FsStaging, StagedArtifact};
pub use validator::{BuiltinValidator, ValidatorOptions};
