//! Error types for reference resolution and image I/O

use thiserror::Error;

/// Result type for proto-env operations
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Errors produced while resolving references, fetching sources, and
/// reading or writing images.
///
/// Schema-validity problems found by the builder are not errors: they come
/// back as [`crate::FileAnnotation`]s.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    User(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("network error: {message}")]
    Network { message: String, transient: bool },

    #[error("download of {url} failed with HTTP status {status}")]
    Download { url: String, status: u16 },

    #[error("config parse error: {0}")]
    ConfigParse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl SchemaError {
    /// Build a network error that may succeed on a second attempt
    pub fn transient(message: impl Into<String>) -> Self {
        SchemaError::Network {
            message: message.into(),
            transient: true,
        }
    }

    /// Build a network error that retrying will not fix
    pub fn persistent(message: impl Into<String>) -> Self {
        SchemaError::Network {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether a single retry is allowed for this error
    pub fn is_transient(&self) -> bool {
        matches!(self, SchemaError::Network { transient: true, .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SchemaError::Cancelled(_))
    }
}
