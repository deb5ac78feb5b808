use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::{QueryCacheSettings, StorageSettings};
use crate::error::{Error, QueryError, Result, SchemaError, StorageError};
use crate::kv::ConnectionPool;
use crate::query::{
    CacheReplacementPolicy, DefaultCacheReplacementPolicy, DefaultEventReducer, EventReducer,
    IndexScanPlanner, MangoMatcher, MangoQuery, QueryBuilder, QueryCache, QueryMatcher, QueryOp,
    QueryPlanner, RxQuery,
};
use crate::storage::{
    BulkWriteCategorizer, DefaultCategorizer, StorageInstance, StorageInstanceParams,
};
use crate::types::{
    BulkWriteResponse, BulkWriteRow, DELETED_FIELD, Document, LWT_FIELD, RxSchema, get_path,
    primary_key_of, set_last_write_time,
};

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// A named set of collections sharing one backend connection.
pub struct Database {
    name: String,
    pool: Arc<ConnectionPool>,
    address: String,
    destroyed: Arc<AtomicBool>,
    collections: Mutex<HashMap<String, Arc<Collection>>>,
}

impl Database {
    pub fn new(name: impl Into<String>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            name: name.into(),
            pool,
            address: "default".to_string(),
            destroyed: Arc::new(AtomicBool::new(false)),
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Backend address the collections connect to.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Start creating a collection.
    pub fn collection(&self, name: &str, schema: RxSchema) -> CollectionBuilder<'_> {
        CollectionBuilder::new(self, name.to_string(), schema)
    }

    pub fn get_collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.lock().get(name).cloned()
    }

    /// Mark the database destroyed and destroy every collection. Live
    /// queries stop recomputing and their subscriptions end.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let collections: Vec<Arc<Collection>> =
            self.collections.lock().drain().map(|(_, c)| c).collect();
        for collection in collections {
            collection.destroy().await?;
        }
        info!(database = %self.name, "destroyed database");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CollectionBuilder
// ---------------------------------------------------------------------------

/// Builder for a collection. Every collaborator has a default.
pub struct CollectionBuilder<'a> {
    database: &'a Database,
    name: String,
    schema: RxSchema,
    settings: StorageSettings,
    cache_settings: QueryCacheSettings,
    clock: Arc<dyn Clock>,
    planner: Arc<dyn QueryPlanner>,
    matcher: Arc<dyn QueryMatcher>,
    reducer: Arc<dyn EventReducer>,
    categorizer: Arc<dyn BulkWriteCategorizer>,
    query_builder: Option<Arc<dyn QueryBuilder>>,
    cache_policy: Option<Arc<dyn CacheReplacementPolicy>>,
    local: bool,
}

impl<'a> CollectionBuilder<'a> {
    fn new(database: &'a Database, name: String, schema: RxSchema) -> Self {
        Self {
            database,
            name,
            schema,
            settings: StorageSettings::default(),
            cache_settings: QueryCacheSettings::default(),
            clock: Arc::new(SystemClock),
            planner: Arc::new(IndexScanPlanner),
            matcher: Arc::new(MangoMatcher),
            reducer: Arc::new(DefaultEventReducer),
            categorizer: Arc::new(DefaultCategorizer),
            query_builder: None,
            cache_policy: None,
            local: false,
        }
    }

    pub fn settings(mut self, settings: StorageSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn cache_settings(mut self, settings: QueryCacheSettings) -> Self {
        self.cache_settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn planner(mut self, planner: Arc<dyn QueryPlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn matcher(mut self, matcher: Arc<dyn QueryMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn reducer(mut self, reducer: Arc<dyn EventReducer>) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn categorizer(mut self, categorizer: Arc<dyn BulkWriteCategorizer>) -> Self {
        self.categorizer = categorizer;
        self
    }

    /// Enable `where_eq`, `sort_by`, `skip` and `limit` on the collection's queries.
    pub fn query_builder(mut self, builder: Arc<dyn QueryBuilder>) -> Self {
        self.query_builder = Some(builder);
        self
    }

    /// Replaces the default policy built from `cache_settings`.
    pub fn cache_policy(mut self, policy: Arc<dyn CacheReplacementPolicy>) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    /// Store local-only documents. Writes to a local collection do not
    /// wake live queries; they see them on their next explicit run.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn execute(self) -> Result<Arc<Collection>> {
        let database = self.database;
        if database.is_destroyed() {
            return Err(QueryError::Destroyed.into());
        }
        let mut collections = database.collections.lock();
        if collections.contains_key(&self.name) {
            return Err(StorageError::CollectionExists(self.name).into());
        }

        let mut params =
            StorageInstanceParams::new(database.name.clone(), self.name.clone(), self.schema);
        if self.local {
            params = params.local();
        }
        let storage = StorageInstance::builder(params)
            .address(database.address.clone())
            .settings(self.settings)
            .clock(self.clock)
            .categorizer(self.categorizer)
            .open(&database.pool)?;

        let policy: Arc<dyn CacheReplacementPolicy> = match self.cache_policy {
            Some(policy) => policy,
            None => Arc::new(DefaultCacheReplacementPolicy::new(self.cache_settings)),
        };
        let collection = Arc::new(Collection {
            core: Arc::new(CollectionCore {
                storage: Arc::new(storage),
                planner: self.planner,
                matcher: self.matcher,
                reducer: self.reducer,
                query_builder: self.query_builder,
                destroyed: AtomicBool::new(false),
                database_destroyed: Arc::clone(&database.destroyed),
            }),
            cache: Arc::new(QueryCache::new(policy)),
        });
        collections.insert(self.name, Arc::clone(&collection));
        Ok(collection)
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// What queries of one collection share: storage and the query collaborators.
pub struct CollectionCore {
    pub(crate) storage: Arc<StorageInstance>,
    pub(crate) planner: Arc<dyn QueryPlanner>,
    pub(crate) matcher: Arc<dyn QueryMatcher>,
    pub(crate) reducer: Arc<dyn EventReducer>,
    pub(crate) query_builder: Option<Arc<dyn QueryBuilder>>,
    destroyed: AtomicBool,
    database_destroyed: Arc<AtomicBool>,
}

impl CollectionCore {
    /// True once the collection or its database was destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire) || self.database_destroyed.load(Ordering::Acquire)
    }
}

pub struct Collection {
    core: Arc<CollectionCore>,
    cache: Arc<QueryCache>,
}

impl Collection {
    pub fn name(&self) -> &str {
        self.core.storage.collection_name()
    }

    pub fn storage(&self) -> &Arc<StorageInstance> {
        &self.core.storage
    }

    pub fn query_cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.is_destroyed()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(QueryError::Destroyed.into());
        }
        Ok(())
    }

    /// The live query for `query`, shared with every identical one.
    pub fn find(&self, query: MangoQuery) -> Arc<RxQuery> {
        self.query(QueryOp::Find, query, Value::Null)
    }

    /// Like [`find`](Self::find) with a limit of one.
    pub fn find_one(&self, query: MangoQuery) -> Arc<RxQuery> {
        self.query(QueryOp::FindOne, query.limit(1), Value::Null)
    }

    pub fn find_one_by_id(&self, id: &str) -> Arc<RxQuery> {
        let mut selector = serde_json::Map::new();
        selector.insert(self.core.storage.primary_path().to_string(), Value::from(id));
        self.find_one(MangoQuery::with_selector(Value::Object(selector)))
    }

    /// A live query with a caller-defined tag. Queries only share an instance
    /// when their tags are equal too.
    pub fn query(&self, op: QueryOp, query: MangoQuery, other: Value) -> Arc<RxQuery> {
        self.cache.get_or_create(op, query, other, &self.core)
    }

    pub async fn bulk_write(&self, rows: Vec<BulkWriteRow>) -> Result<BulkWriteResponse> {
        self.ensure_alive()?;
        self.core.storage.bulk_write(rows, "rx-collection-bulk-write").await
    }

    /// Insert one new document. `_deleted` and `_meta.lwt` are filled in
    /// when missing.
    pub async fn insert(&self, document: Document) -> Result<Document> {
        self.ensure_alive()?;
        let mut document = document;
        let fields = document.as_object_mut().ok_or(SchemaError::NotAnObject)?;
        fields.entry(DELETED_FIELD).or_insert(Value::Bool(false));
        if get_path(&document, LWT_FIELD).is_none() {
            set_last_write_time(&mut document, self.core.storage.now_ms());
        }
        let id = primary_key_of(&document, self.core.storage.primary_path())?.to_string();

        let mut response = self.bulk_write(vec![BulkWriteRow::insert(document)]).await?;
        if response.error.contains_key(&id) {
            return Err(StorageError::Conflict(id).into());
        }
        response.success.remove(&id).ok_or_else(|| Error::InternalConsistency {
            database: self.core.storage.database_name().to_string(),
            collection: self.name().to_string(),
            message: format!("insert of '{id}' neither succeeded nor conflicted"),
        })
    }

    /// Stop all live queries and close the storage instance.
    pub async fn destroy(&self) -> Result<()> {
        if self.core.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cache.clear();
        if !self.core.storage.is_closed() {
            self.core.storage.close().await?;
        }
        debug!(collection = %self.name(), "destroyed collection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryOutput;
    use serde_json::json;

    fn database() -> Database {
        Database::new("db", Arc::new(ConnectionPool::in_memory()))
    }

    #[tokio::test]
    async fn test_insert_fills_meta() {
        let db = database();
        let users = db.collection("users", RxSchema::new("id")).execute().unwrap();
        let stored = users.insert(json!({"id": "a", "name": "amy"})).await.unwrap();
        assert_eq!(stored["_deleted"], json!(false));
        assert!(get_path(&stored, LWT_FIELD).is_some());

        assert!(matches!(
            users.insert(json!({"id": "a"})).await,
            Err(Error::Storage(StorageError::Conflict(_)))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_collection_rejected() {
        let db = database();
        db.collection("users", RxSchema::new("id")).execute().unwrap();
        assert!(matches!(
            db.collection("users", RxSchema::new("id")).execute(),
            Err(Error::Storage(StorageError::CollectionExists(_)))
        ));
        assert!(db.get_collection("users").is_some());
    }

    #[tokio::test]
    async fn test_find_one_by_id() {
        let db = database();
        let users = db.collection("users", RxSchema::new("id")).execute().unwrap();
        users.insert(json!({"id": "a", "n": 1})).await.unwrap();

        let query = users.find_one_by_id("a");
        assert_eq!(query.find_one_by_id(), Some("a"));
        let found = query.exec_required().await.unwrap();
        assert_eq!(found["n"], json!(1));
        assert_eq!(query.stats().exec_over_database_count, 1);

        let missing = users.find_one_by_id("zzz");
        assert!(matches!(
            missing.exec_required().await,
            Err(Error::Query(QueryError::NoDocument { .. }))
        ));
        assert_eq!(missing.exec().await.unwrap(), QueryOutput::One(None));
    }

    #[tokio::test]
    async fn test_destroyed_database_rejects_writes() {
        let db = database();
        let users = db.collection("users", RxSchema::new("id")).execute().unwrap();
        db.destroy().await.unwrap();
        assert!(users.is_destroyed());
        assert!(users.storage().is_closed());
        assert!(matches!(
            users.insert(json!({"id": "a"})).await,
            Err(Error::Query(QueryError::Destroyed))
        ));
        assert!(db.collection("other", RxSchema::new("id")).execute().is_err());
    }
}
