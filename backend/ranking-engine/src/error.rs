use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Single field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Ordered list of validation failures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationError::new(field, message));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> std::result::Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(ValidationErrors),

    #[error("feature unavailable")]
    FeatureUnavailable,

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("request overloaded")]
    Overloaded,

    #[error("request cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    pub fn is_feature_unavailable(&self) -> bool {
        matches!(self, EngineError::FeatureUnavailable)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

impl From<ValidationErrors> for EngineError {
    fn from(err: ValidationErrors) -> Self {
        EngineError::InvalidArgument(err)
    }
}

impl From<object_store::ObjectStoreError> for EngineError {
    fn from(err: object_store::ObjectStoreError) -> Self {
        EngineError::Dependency(err.to_string())
    }
}

impl From<artifact_schema::SchemaError> for EngineError {
    fn from(err: artifact_schema::SchemaError) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Dependency(err.to_string())
    }
}

impl From<resilience::DispatchError> for EngineError {
    fn from(err: resilience::DispatchError) -> Self {
        match err {
            resilience::DispatchError::Overloaded => EngineError::Overloaded,
            resilience::DispatchError::Cancelled => EngineError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_display() {
        let mut errs = ValidationErrors::new();
        errs.push("org_id", "must be set");
        errs.push("k", "must be >= 0");
        assert_eq!(errs.to_string(), "org_id: must be set; k: must be >= 0");
        assert!(EngineError::from(errs).to_string().starts_with("invalid argument"));
    }

    #[test]
    fn test_feature_unavailable_sentinel() {
        assert!(EngineError::FeatureUnavailable.is_feature_unavailable());
        assert!(!EngineError::Dependency("x".into()).is_feature_unavailable());
    }
}
