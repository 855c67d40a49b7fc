//! Storage error types and backend error mapping.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    Duplicate(String),

    #[error("adding images is disabled: missing {0}")]
    BackendDisabled(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid location: {0}")]
    InvalidUri(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("checksum mismatch for {key}: expected {expected}, got {actual}")]
    HashMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl From<depot_core::Error> for StorageError {
    fn from(err: depot_core::Error) -> Self {
        match err {
            depot_core::Error::InvalidUri(msg) => StorageError::InvalidUri(msg),
            depot_core::Error::Config(msg) => StorageError::Config(msg),
            depot_core::Error::InvalidChecksum(msg) => StorageError::Backend(msg),
        }
    }
}

/// A failure reported by a Swift client.
///
/// `status` carries the HTTP status when the server answered; transport
/// failures (connection refused, malformed responses) have none.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ClientError {
    pub status: Option<u16>,
    pub message: String,
}

impl ClientError {
    /// An error response from the server.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// A failure before or while talking to the server.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    /// Whether the server refused to create an object that already exists.
    pub fn is_conflict(&self) -> bool {
        matches!(self.status, Some(409 | 412))
    }
}

/// Result type for Swift client calls.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Convert a client error into a storage error for the object at `key`.
///
/// 404 maps to `NotFound`, 409/412 to `Duplicate`; everything else is a
/// backend failure carrying the client's message.
pub fn map_client_error(err: ClientError, key: &str) -> StorageError {
    if err.is_not_found() {
        return StorageError::NotFound(key.to_string());
    }
    if err.is_conflict() {
        return StorageError::Duplicate(key.to_string());
    }
    StorageError::Backend(err.message)
}
