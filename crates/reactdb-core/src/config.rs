//! Tunables for storage instances and the query cache.
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields take the defaults below.

use serde::Deserialize;

use crate::error::{Error, StorageError};

/// Default number of tombstones removed per `cleanup` call.
pub const DEFAULT_CLEANUP_BATCH_SIZE: usize = 50;

/// Default number of change events retained for incremental recomputation.
pub const DEFAULT_CHANGE_BUFFER_LIMIT: usize = 100;

/// Default number of attempts for a transaction that hits a write conflict.
pub const DEFAULT_MAX_TRANSACTION_RETRIES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Tombstones removed per `cleanup` call.
    pub batch_size: usize,
    /// Capacity of the change event buffer.
    pub change_buffer_limit: usize,
    pub max_transaction_retries: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_CLEANUP_BATCH_SIZE,
            change_buffer_limit: DEFAULT_CHANGE_BUFFER_LIMIT,
            max_transaction_retries: DEFAULT_MAX_TRANSACTION_RETRIES,
        }
    }
}

impl StorageSettings {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| StorageError::Serialization(e.to_string()).into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryCacheSettings {
    /// The replacement policy stops uncaching once the cache is this small.
    pub tries_to_keep: usize,
    /// Queries that were created but never executed are dropped after this long.
    pub unexecuted_lifetime_ms: u64,
}

impl Default for QueryCacheSettings {
    fn default() -> Self {
        Self {
            tries_to_keep: 100,
            unexecuted_lifetime_ms: 30_000,
        }
    }
}

impl QueryCacheSettings {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| StorageError::Serialization(e.to_string()).into())
    }
}
