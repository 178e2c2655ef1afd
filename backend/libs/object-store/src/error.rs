use thiserror::Error;

pub type Result<T> = std::result::Result<T, ObjectStoreError>;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {uri}")]
    NotFound { uri: String },

    #[error("invalid object uri: {0}")]
    InvalidUri(String),

    #[error("object {uri} exceeds {limit} bytes")]
    TooLarge { uri: String, limit: u64 },

    #[error("I/O error for {uri}: {message}")]
    Io { uri: String, message: String },

    #[error("S3 error for {uri}: {message}")]
    S3 { uri: String, message: String },
}

impl ObjectStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectStoreError::NotFound { .. })
    }

    pub(crate) fn io(uri: impl Into<String>, err: std::io::Error) -> Self {
        let uri = uri.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            ObjectStoreError::NotFound { uri }
        } else {
            ObjectStoreError::Io {
                uri,
                message: err.to_string(),
            }
        }
    }
}
