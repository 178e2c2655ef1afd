use thiserror::Error;

pub type SchemaResult<T> = std::result::Result<T, SchemaError>;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u32),

    #[error("artifact type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("version mismatch: build says {declared}, payload hashes to {computed}")]
    VersionMismatch { declared: String, computed: String },

    #[error("invalid window: {0}")]
    InvalidWindow(String),

    #[error("non-finite score for item {item_id}")]
    NonFiniteScore { item_id: String },

    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}

impl From<serde_json::Error> for SchemaError {
    fn from(err: serde_json::Error) -> Self {
        SchemaError::Serialization(err.to_string())
    }
}
