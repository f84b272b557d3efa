//! Error types for the object graph.

use thiserror::Error;

/// Errors from building stores and instantiating objects.
///
/// Only construction failures surface to callers as errors. Everything that can
/// go wrong while reconciling an already-loaded document is logged and skipped.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The elements collection has no `level` record.
    #[error("document has no root level")]
    MissingRootLevel,

    /// A record's `type` does not name a known kind.
    #[error("unknown object type: {0:?}")]
    UnknownType(String),

    /// A record has no string `id` field.
    #[error("record {key:?} has no id field")]
    MissingId { key: String },

    /// A record's `id` field disagrees with its storage key.
    #[error("record {key:?} has mismatched id {id:?}")]
    KeyMismatch { key: String, id: String },

    /// A storage key does not parse as this store's key type.
    #[error("invalid object key: {0:?}")]
    InvalidKey(String),

    /// A store method that needs a transaction was called outside one.
    #[error("mutation attempted outside make_changes")]
    OutsideTransaction,
}

impl StoreError {
    /// Whether this error aborts loading a whole store rather than one record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::MissingRootLevel | StoreError::UnknownType(_))
    }
}

/// Errors from loading an [`EditorConfig`](crate::EditorConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}
