use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Coarse error class used by callers (and the CLI exit code) to match errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    LimitExceeded,
    ValidationFailed,
    Dependency,
    NotFound,
    Config,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::LimitExceeded => "limit_exceeded",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::Dependency => "dependency",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Config => "config",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("pipeline cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PipelineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            PipelineError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            PipelineError::Dependency(_) => ErrorKind::Dependency,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        PipelineError::InvalidArgument(message.into())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        PipelineError::ValidationFailed(message.into())
    }

    pub(crate) fn limit(what: &str, seen: usize, max: usize) -> Self {
        PipelineError::LimitExceeded(format!("{}: {} exceeds {}", what, seen, max))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            PipelineError::NotFound(err.to_string())
        } else {
            PipelineError::Dependency(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::ValidationFailed(format!("json: {}", err))
    }
}

impl From<object_store::ObjectStoreError> for PipelineError {
    fn from(err: object_store::ObjectStoreError) -> Self {
        if err.is_not_found() {
            PipelineError::NotFound(err.to_string())
        } else {
            PipelineError::Dependency(err.to_string())
        }
    }
}

impl From<artifact_schema::SchemaError> for PipelineError {
    fn from(err: artifact_schema::SchemaError) -> Self {
        PipelineError::ValidationFailed(err.to_string())
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}
