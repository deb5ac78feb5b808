//! Error types for all reactdb operations.

use std::sync::Arc;

use thiserror::Error;

/// Top-level error type for reactdb operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Transaction(#[from] TxnError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Query(#[from] QueryError),

    /// A condition that should never happen; a programming error, not retried.
    #[error("internal consistency error in {database}/{collection}: {message}")]
    InternalConsistency {
        database: String,
        collection: String,
        message: String,
    },

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("feature not enabled: {0}")]
    PluginMissing(&'static str),

    /// A live-query recomputation failed. Shared between all subscribers.
    #[error("query recomputation failed: {0}")]
    Recompute(#[source] Arc<Error>),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage instance is closed")]
    Closed,

    #[error("connection to '{0}' is closed")]
    ConnectionClosed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("write conflict on document '{0}'")]
    Conflict(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),
}

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("NaN is not a valid index value")]
    NaN,

    #[error("field '{field}' holds a value that cannot be indexed")]
    UnsupportedValue { field: String },

    #[error("null character (U+0000) is not allowed in field names")]
    NullCharInName,
}

#[derive(Debug, Error)]
pub enum TxnError {
    /// Another transaction committed a write to a key this one read.
    #[error("transaction conflict")]
    Conflict,

    #[error("transaction commit failed: {0}")]
    CommitFailed(String),

    #[error("transaction gave up after {0} conflicting attempts")]
    RetriesExhausted(usize),
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("document is missing primary key '{0}'")]
    MissingPrimaryKey(String),

    #[error("primary key '{0}' must be a string")]
    PrimaryKeyNotString(String),

    #[error("document must be a JSON object")]
    NotAnObject,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    Invalid(String),

    #[error("exec(required) is only allowed on findOne queries")]
    RequiredOnFind,

    #[error("findOne query on '{collection}' returned no document")]
    NoDocument { collection: String },

    #[error("database is destroyed")]
    Destroyed,
}

pub type Result<T> = std::result::Result<T, Error>;
