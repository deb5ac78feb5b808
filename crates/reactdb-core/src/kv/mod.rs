//! The ordered transactional key-value store that storage instances run on.
//!
//! A backend hands out transactions. Reads inside a transaction see the
//! transaction's own writes; writes become visible to others only when
//! [`KvTransaction::commit`] succeeds, all at once. A commit that raced a
//! conflicting commit fails with [`TxnError::Conflict`](crate::error::TxnError)
//! and may be retried.

pub mod memory;
pub mod pool;
pub mod subspace;

use std::ops::Bound;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryBackend;
pub use pool::ConnectionPool;
pub use subspace::Subspace;

/// A key/value pair returned by range reads.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// A range of keys with inclusive or exclusive ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
}

impl KeyRange {
    pub fn new(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        Self { start, end }
    }

    /// A range holding exactly one key.
    pub fn single(key: &[u8]) -> Self {
        Self {
            start: Bound::Included(key.to_vec()),
            end: Bound::Included(key.to_vec()),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => key >= s.as_slice(),
            Bound::Excluded(s) => key > s.as_slice(),
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(e) => key <= e.as_slice(),
            Bound::Excluded(e) => key < e.as_slice(),
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    /// True when no key can fall inside the range.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }

    pub(crate) fn as_bounds(&self) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        (self.start.clone(), self.end.clone())
    }
}

#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Start a new transaction.
    async fn begin(&self) -> Result<Box<dyn KvTransaction>>;

    /// Release the connection. Later `begin` calls fail.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait KvTransaction: Send {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Ascending range read, at most `limit` pairs when given.
    async fn get_range(&mut self, range: &KeyRange, limit: Option<usize>) -> Result<Vec<KvPair>>;

    fn set(&mut self, key: &[u8], value: &[u8]);

    fn delete(&mut self, key: &[u8]);

    fn clear_range(&mut self, range: &KeyRange);

    /// Atomically publish every buffered write.
    async fn commit(self: Box<Self>) -> Result<()>;
}
