use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::Result;

use super::{KvBackend, MemoryBackend};

type BackendFactory = Box<dyn Fn(&str) -> Result<Arc<dyn KvBackend>> + Send + Sync>;

/// Backend connections keyed by cluster address.
///
/// A connection is opened on the first `connect` for an address and shared
/// by every storage instance created afterwards for that address. It stays
/// open until `close` (or `close_all`) is called explicitly.
pub struct ConnectionPool {
    factory: BackendFactory,
    connections: Mutex<HashMap<String, Arc<dyn KvBackend>>>,
}

impl ConnectionPool {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<dyn KvBackend>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// A pool whose connections are independent [`MemoryBackend`]s.
    pub fn in_memory() -> Self {
        Self::new(|address| Ok(Arc::new(MemoryBackend::new(address)) as Arc<dyn KvBackend>))
    }

    /// Return the open connection for `address`, opening it if needed.
    pub fn connect(&self, address: &str) -> Result<Arc<dyn KvBackend>> {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(address) {
            return Ok(Arc::clone(existing));
        }
        let backend = (self.factory)(address)?;
        info!(address, "opened backend connection");
        connections.insert(address.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    pub fn is_open(&self, address: &str) -> bool {
        self.connections.lock().contains_key(address)
    }

    /// Close and forget the connection for `address`. No-op if not open.
    pub async fn close(&self, address: &str) -> Result<()> {
        let removed = self.connections.lock().remove(address);
        if let Some(backend) = removed {
            backend.close().await?;
            debug!(address, "closed backend connection");
        }
        Ok(())
    }

    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<(String, Arc<dyn KvBackend>)> = self.connections.lock().drain().collect();
        for (address, backend) in drained {
            backend.close().await?;
            debug!(address = %address, "closed backend connection");
        }
        Ok(())
    }
}
