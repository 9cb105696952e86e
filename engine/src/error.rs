//! Error types for the Pocket engine.

use crate::{CollectionName, DocumentId};
use thiserror::Error;

/// All possible errors from the Pocket engine.
///
/// Clock and CRDT operations never produce these; they are raised by the
/// document store, the optimistic tracker and protocol validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Store errors
    #[error("document not found: {collection}/{id}")]
    DocumentNotFound {
        collection: CollectionName,
        id: DocumentId,
    },

    #[error("document already exists: {collection}/{id}")]
    DocumentAlreadyExists {
        collection: CollectionName,
        id: DocumentId,
    },

    #[error("store error: {0}")]
    Store(String),

    // Change errors
    #[error("invalid change: {0}")]
    InvalidChange(String),

    #[error("optimistic update not found: {0}")]
    UpdateNotFound(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    // Protocol errors
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::DocumentNotFound {
            collection: "todos".into(),
            id: "t1".into(),
        };
        assert_eq!(err.to_string(), "document not found: todos/t1");

        let err = Error::VersionMismatch {
            expected: "1.0.0".into(),
            actual: "2.0.0".into(),
        };
        assert_eq!(
            err.to_string(),
            "protocol version mismatch: expected 1.0.0, got 2.0.0"
        );
    }
}
