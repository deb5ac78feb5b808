use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::clock::monotonic_micros;
use crate::collection::CollectionCore;
use crate::config::QueryCacheSettings;

use super::mango::MangoQuery;
use super::rx_query::{QueryOp, RxQuery};

/// Deterministic identity of a query: `{op, query, other}` as JSON with
/// object keys sorted at every level.
pub fn query_signature(op: QueryOp, query: &MangoQuery, other: &Value) -> String {
    let mut root = Map::new();
    root.insert("op".to_string(), serde_json::to_value(op).unwrap_or_default());
    root.insert("query".to_string(), serde_json::to_value(query).unwrap_or_default());
    root.insert("other".to_string(), other.clone());
    canonical(&Value::Object(root)).to_string()
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), canonical(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Decides which cached queries to drop. Runs after every cache lookup.
pub trait CacheReplacementPolicy: Send + Sync {
    fn run(&self, cache: &QueryCache);
}

/// Once the cache holds `tries_to_keep` queries: drop unsubscribed queries
/// that never ran and are older than `unexecuted_lifetime_ms`, then the least
/// recently used unsubscribed ones until `tries_to_keep` remain. Queries that
/// never ran only expire through their lifetime.
#[derive(Debug, Default, Clone)]
pub struct DefaultCacheReplacementPolicy {
    settings: QueryCacheSettings,
}

impl DefaultCacheReplacementPolicy {
    pub fn new(settings: QueryCacheSettings) -> Self {
        Self { settings }
    }
}

impl CacheReplacementPolicy for DefaultCacheReplacementPolicy {
    fn run(&self, cache: &QueryCache) {
        let keep = self.settings.tries_to_keep;
        if cache.len() < keep {
            return;
        }
        let lifetime_micros = self.settings.unexecuted_lifetime_ms.saturating_mul(1000);
        let min_creation_time = monotonic_micros().saturating_sub(lifetime_micros);

        let mut candidates = Vec::new();
        let mut removed = 0usize;
        for query in cache.queries() {
            if query.subscriber_count() > 0 {
                continue;
            }
            let stats = query.stats();
            if stats.last_ensure_equal == 0 {
                if stats.creation_time < min_creation_time {
                    cache.uncache(&query);
                    removed += 1;
                }
                continue;
            }
            candidates.push((stats.last_ensure_equal, query));
        }

        let excess = candidates.len().saturating_sub(keep);
        if excess > 0 {
            candidates.sort_by_key(|(last_used, _)| *last_used);
            for (_, query) in candidates.into_iter().take(excess) {
                cache.uncache(&query);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, remaining = cache.len(), "uncached queries");
        }
    }
}

/// One live [`RxQuery`] per signature.
pub struct QueryCache {
    queries: Mutex<HashMap<String, Arc<RxQuery>>>,
    policy: Arc<dyn CacheReplacementPolicy>,
}

impl QueryCache {
    pub fn new(policy: Arc<dyn CacheReplacementPolicy>) -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// The cached query with this signature, creating it if needed. Runs the
    /// replacement policy afterwards.
    pub(crate) fn get_or_create(
        self: &Arc<Self>,
        op: QueryOp,
        query: MangoQuery,
        other: Value,
        core: &Arc<CollectionCore>,
    ) -> Arc<RxQuery> {
        let signature = query_signature(op, &query, &other);
        let found = {
            let mut queries = self.queries.lock();
            Arc::clone(queries.entry(signature).or_insert_with(|| {
                Arc::new(RxQuery::new(op, query, other, Arc::clone(core), Arc::downgrade(self)))
            }))
        };
        self.policy.run(self);
        found
    }

    pub fn get(&self, signature: &str) -> Option<Arc<RxQuery>> {
        self.queries.lock().get(signature).cloned()
    }

    pub fn len(&self) -> usize {
        self.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queries(&self) -> Vec<Arc<RxQuery>> {
        self.queries.lock().values().cloned().collect()
    }

    /// Forget `query`. Holders keep a working query that is no longer shared.
    pub fn uncache(&self, query: &RxQuery) {
        let mut queries = self.queries.lock();
        if queries
            .get(query.signature())
            .is_some_and(|cached| std::ptr::eq(cached.as_ref(), query))
        {
            queries.remove(query.signature());
        }
        query.mark_uncached();
    }

    pub fn clear(&self) {
        let drained: Vec<Arc<RxQuery>> = self.queries.lock().drain().map(|(_, q)| q).collect();
        for query in drained {
            query.mark_uncached();
        }
    }
}
