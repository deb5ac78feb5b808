use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result, StorageError, TxnError};

use super::{KeyRange, KvBackend, KvPair, KvTransaction};

struct MemoryState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Commit version that last touched each key, deletions included.
    versions: BTreeMap<Vec<u8>, u64>,
    version: u64,
    closed: bool,
}

/// An in-process ordered key-value store with optimistic transactions.
///
/// Transactions buffer their writes in an overlay and record every key and
/// range they read. At commit the read set is validated against keys written
/// by transactions that committed after this one began; any overlap aborts
/// with [`TxnError::Conflict`]. Committed state is therefore serializable.
pub struct MemoryBackend {
    name: String,
    state: Arc<RwLock<MemoryState>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(MemoryState {
                data: BTreeMap::new(),
                versions: BTreeMap::new(),
                version: 0,
                closed: false,
            })),
            fail_next_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make the next commit fail after validation, leaving nothing applied.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of committed keys (all subspaces).
    pub fn len(&self) -> usize {
        self.state.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>> {
        let read_version = {
            let state = self.state.read();
            if state.closed {
                return Err(StorageError::ConnectionClosed(self.name.clone()).into());
            }
            state.version
        };
        Ok(Box::new(MemoryTransaction {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
            fail_next_commit: Arc::clone(&self.fail_next_commit),
            read_version,
            reads: Vec::new(),
            writes: BTreeMap::new(),
            clears: Vec::new(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.state.write().closed = true;
        Ok(())
    }
}

struct MemoryTransaction {
    name: String,
    state: Arc<RwLock<MemoryState>>,
    fail_next_commit: Arc<AtomicBool>,
    read_version: u64,
    reads: Vec<KeyRange>,
    /// `None` marks a buffered delete.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    clears: Vec<KeyRange>,
}

impl MemoryTransaction {
    fn cleared(&self, key: &[u8]) -> bool {
        self.clears.iter().any(|r| r.contains(key))
    }

    fn closed_error(&self) -> Error {
        StorageError::ConnectionClosed(self.name.clone()).into()
    }
}

#[async_trait]
impl KvTransaction for MemoryTransaction {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.reads.push(KeyRange::single(key));
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        if self.cleared(key) {
            return Ok(None);
        }
        let state = self.state.read();
        if state.closed {
            return Err(self.closed_error());
        }
        Ok(state.data.get(key).cloned())
    }

    async fn get_range(&mut self, range: &KeyRange, limit: Option<usize>) -> Result<Vec<KvPair>> {
        if range.is_empty() || limit == Some(0) {
            return Ok(Vec::new());
        }
        self.reads.push(range.clone());

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = {
            let state = self.state.read();
            if state.closed {
                return Err(self.closed_error());
            }
            state
                .data
                .range(range.as_bounds())
                .filter(|(k, _)| !self.cleared(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        // Overlay this transaction's own writes.
        for (key, value) in self.writes.range(range.as_bounds()) {
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        let limit = limit.unwrap_or(usize::MAX);
        Ok(merged.into_iter().take(limit).collect())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    fn clear_range(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }
        self.writes.retain(|k, _| !range.contains(k));
        self.clears.push(range.clone());
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            name,
            state,
            fail_next_commit,
            read_version,
            reads,
            writes,
            clears,
        } = *self;

        let mut state = state.write();
        if state.closed {
            return Err(StorageError::ConnectionClosed(name).into());
        }

        for read in &reads {
            let conflicting = state
                .versions
                .range(read.as_bounds())
                .any(|(_, &v)| v > read_version);
            if conflicting {
                return Err(TxnError::Conflict.into());
            }
        }

        if fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(TxnError::CommitFailed("injected failure".to_string()).into());
        }

        if writes.is_empty() && clears.is_empty() {
            return Ok(());
        }

        state.version += 1;
        let version = state.version;
        let MemoryState { data, versions, .. } = &mut *state;

        for range in &clears {
            let keys: Vec<Vec<u8>> =
                data.range(range.as_bounds()).map(|(k, _)| k.clone()).collect();
            for key in keys {
                data.remove(&key);
                versions.insert(key, version);
            }
        }
        for (key, value) in writes {
            match value {
                Some(v) => {
                    data.insert(key.clone(), v);
                }
                None => {
                    data.remove(&key);
                }
            }
            versions.insert(key, version);
        }
        Ok(())
    }
}
