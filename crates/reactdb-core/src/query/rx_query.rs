use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::clock::monotonic_micros;
use crate::collection::CollectionCore;
use crate::error::{Error, QueryError, Result, StorageError};
use crate::storage::ChangeEventBuffer;
use crate::types::{
    BulkWriteRow, DELETED_FIELD, Document, DocumentsById, get_path, set_last_write_time,
};

use super::builder::QueryBuilder;
use super::cache::{QueryCache, query_signature};
use super::event_reduce::{ReduceInput, ReduceOutcome};
use super::mango::{MangoQuery, SortDirection, is_find_one_by_id_query};
use super::planner::PreparedQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryOp {
    Find,
    FindOne,
}

/// A cached query result. `time` strictly increases with every new result.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub documents: Vec<Document>,
    pub by_id: DocumentsById,
    pub time: u64,
}

impl QueryResult {
    fn new(documents: Vec<Document>, primary_path: &str) -> Self {
        let by_id = documents
            .iter()
            .filter_map(|doc| {
                let id = get_path(doc, primary_path)?.as_str()?;
                Some((id.to_string(), doc.clone()))
            })
            .collect();
        Self {
            documents,
            by_id,
            time: monotonic_micros(),
        }
    }
}

/// A result shaped for the query kind.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Many(Vec<Document>),
    One(Option<Document>),
}

impl QueryOutput {
    pub fn into_documents(self) -> Vec<Document> {
        match self {
            QueryOutput::Many(documents) => documents,
            QueryOutput::One(document) => document.into_iter().collect(),
        }
    }

    pub fn into_one(self) -> Option<Document> {
        self.into_documents().into_iter().next()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// How often the query ran against storage instead of being reduced.
    pub exec_over_database_count: u64,
    pub creation_time: u64,
    /// Last time `ensure_equal` got its turn; 0 if never.
    pub last_ensure_equal: u64,
}

struct QueryState {
    /// Last change buffer counter folded into `result`; `None` until first run.
    last_counter: Option<u64>,
    result: Option<Arc<QueryResult>>,
    exec_over_database_count: u64,
    last_ensure_equal: u64,
}

#[derive(Clone)]
enum Emission {
    Ready(Arc<QueryResult>),
    Failed(Arc<Error>),
}

impl Emission {
    fn same_as(&self, other: &Emission) -> bool {
        match (self, other) {
            (Emission::Ready(a), Emission::Ready(b)) => a.time == b.time,
            (Emission::Failed(a), Emission::Failed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

struct Driver {
    task: JoinHandle<()>,
    receiver: watch::Receiver<Option<Emission>>,
}

struct Subscribers {
    count: usize,
    driver: Option<Driver>,
}

/// A live query over one collection.
///
/// The cached result is brought up to date by [`ensure_equal`](Self::ensure_equal),
/// either by reducing buffered change events into it or by running the query
/// against storage. Recomputations of one query are serialized in FIFO order.
/// All subscribers share one driver task, started by the first subscription
/// and stopped when the last one is dropped.
pub struct RxQuery {
    op: QueryOp,
    query: MangoQuery,
    other: Value,
    signature: String,
    core: Arc<CollectionCore>,
    cache: Weak<QueryCache>,
    find_one_by_id: Option<String>,
    prepared: Mutex<Option<Arc<PreparedQuery>>>,
    state: Mutex<QueryState>,
    recompute: AsyncMutex<()>,
    subscribers: Mutex<Subscribers>,
    creation_time: u64,
    uncached: AtomicBool,
}

impl RxQuery {
    pub(crate) fn new(
        op: QueryOp,
        query: MangoQuery,
        other: Value,
        core: Arc<CollectionCore>,
        cache: Weak<QueryCache>,
    ) -> Self {
        let signature = query_signature(op, &query, &other);
        let find_one_by_id = is_find_one_by_id_query(core.storage.primary_path(), &query);
        Self {
            op,
            query,
            other,
            signature,
            core,
            cache,
            find_one_by_id,
            prepared: Mutex::new(None),
            state: Mutex::new(QueryState {
                last_counter: None,
                result: None,
                exec_over_database_count: 0,
                last_ensure_equal: 0,
            }),
            recompute: AsyncMutex::new(()),
            subscribers: Mutex::new(Subscribers {
                count: 0,
                driver: None,
            }),
            creation_time: monotonic_micros(),
            uncached: AtomicBool::new(false),
        }
    }

    pub fn op(&self) -> QueryOp {
        self.op
    }

    pub fn mango_query(&self) -> &MangoQuery {
        &self.query
    }

    pub fn other(&self) -> &Value {
        &self.other
    }

    /// Canonical identity used by the query cache.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The id this query looks up directly, if it is a find-by-id query.
    pub fn find_one_by_id(&self) -> Option<&str> {
        self.find_one_by_id.as_deref()
    }

    pub fn collection_name(&self) -> &str {
        self.core.storage.collection_name()
    }

    pub fn is_cached(&self) -> bool {
        !self.uncached.load(Ordering::Acquire)
    }

    pub(crate) fn mark_uncached(&self) {
        self.uncached.store(true, Ordering::Release);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().count
    }

    pub fn stats(&self) -> QueryStats {
        let state = self.state.lock();
        QueryStats {
            exec_over_database_count: state.exec_over_database_count,
            creation_time: self.creation_time,
            last_ensure_equal: state.last_ensure_equal,
        }
    }

    /// The current cached result, if the query ran at least once.
    pub fn result(&self) -> Option<Arc<QueryResult>> {
        self.state.lock().result.clone()
    }

    /// Whether the cached result already reflects every buffered change.
    pub fn is_in_sync(&self) -> bool {
        let counter = self.core.storage.change_buffer().counter();
        self.state.lock().last_counter.is_some_and(|last| last >= counter)
    }

    fn prepared(&self) -> Result<Arc<PreparedQuery>> {
        let mut slot = self.prepared.lock();
        if let Some(prepared) = slot.as_ref() {
            return Ok(Arc::clone(prepared));
        }
        let schema = self.core.storage.schema();
        let prepared = Arc::new(self.core.planner.prepare(schema, &self.query)?);
        *slot = Some(Arc::clone(&prepared));
        Ok(prepared)
    }

    /// Bring the cached result up to date with the change buffer.
    ///
    /// Returns `true` when the cached result changed. A full run that finds
    /// the same documents still advances the counter but reports `false`.
    pub async fn ensure_equal(&self) -> Result<bool> {
        if self.core.is_destroyed() || self.is_in_sync() {
            return Ok(false);
        }
        let _turn = self.recompute.lock().await;
        self.state.lock().last_ensure_equal = monotonic_micros();
        if self.core.is_destroyed() || self.is_in_sync() {
            return Ok(false);
        }

        let buffer = self.core.storage.change_buffer();
        let (last_counter, current) = {
            let state = self.state.lock();
            (state.last_counter, state.result.clone())
        };

        let mut must_re_exec = true;
        let mut changed = false;
        if let (Some(last), Some(current)) = (last_counter, current) {
            match buffer.get_since(last + 1) {
                Err(out_of_bounds) => {
                    debug!(
                        query = %self.signature,
                        %out_of_bounds,
                        "change buffer overrun, running query again"
                    );
                }
                Ok(since) => {
                    // The counter only moves together with the result it describes.
                    let prepared = self.prepared()?;
                    let events = ChangeEventBuffer::reduce_to_last_per_document(since.events);
                    let outcome = self.core.reducer.reduce(ReduceInput {
                        query: &prepared,
                        current: &current.documents,
                        events: &events,
                        matcher: self.core.matcher.as_ref(),
                    });
                    match outcome {
                        ReduceOutcome::RunFullQueryAgain => {
                            trace!(
                                query = %self.signature,
                                events = events.len(),
                                "events not reducible"
                            );
                        }
                        ReduceOutcome::Unchanged => {
                            must_re_exec = false;
                            self.state.lock().last_counter = Some(since.counter);
                        }
                        ReduceOutcome::NewResults(documents) => {
                            must_re_exec = false;
                            changed = true;
                            let result =
                                QueryResult::new(documents, self.core.storage.primary_path());
                            let mut state = self.state.lock();
                            state.last_counter = Some(since.counter);
                            state.result = Some(Arc::new(result));
                        }
                    }
                }
            }
        }

        if must_re_exec {
            let counter = buffer.counter();
            let documents = self.exec_over_database().await?;
            let mut state = self.state.lock();
            state.last_counter = Some(counter);
            let differs = state.result.as_ref().is_none_or(|r| r.documents != documents);
            if differs {
                let result = QueryResult::new(documents, self.core.storage.primary_path());
                state.result = Some(Arc::new(result));
                changed = true;
            }
        }
        Ok(changed)
    }

    async fn exec_over_database(&self) -> Result<Vec<Document>> {
        self.state.lock().exec_over_database_count += 1;
        let storage = &self.core.storage;
        if let Some(id) = &self.find_one_by_id {
            let mut found = storage.find_documents_by_id(std::slice::from_ref(id), false).await?;
            return Ok(found.remove(id).into_iter().collect());
        }
        let prepared = self.prepared()?;
        storage.query(&prepared, self.core.matcher.as_ref()).await
    }

    fn shape(&self, result: &QueryResult) -> QueryOutput {
        match self.op {
            QueryOp::Find => QueryOutput::Many(result.documents.clone()),
            QueryOp::FindOne => QueryOutput::One(result.documents.first().cloned()),
        }
    }

    /// Run the query once and return its current result.
    pub async fn exec(&self) -> Result<QueryOutput> {
        if self.core.is_destroyed() {
            return Err(QueryError::Destroyed.into());
        }
        self.ensure_equal().await?;
        let result = self.result().ok_or(QueryError::Destroyed)?;
        Ok(self.shape(&result))
    }

    /// Like [`exec`](Self::exec) for `findOne` queries, failing when nothing matches.
    pub async fn exec_required(&self) -> Result<Document> {
        if self.op != QueryOp::FindOne {
            return Err(QueryError::RequiredOnFind.into());
        }
        self.exec().await?.into_one().ok_or_else(|| {
            QueryError::NoDocument {
                collection: self.collection_name().to_string(),
            }
            .into()
        })
    }

    /// Delete every document in the result. Returns what was deleted.
    pub async fn remove(&self) -> Result<QueryOutput> {
        let output = self.exec().await?;
        let documents = match &output {
            QueryOutput::Many(documents) => documents.clone(),
            QueryOutput::One(document) => document.iter().cloned().collect(),
        };
        if documents.is_empty() {
            return Ok(output);
        }

        let storage = &self.core.storage;
        let now = storage.now_ms();
        let rows: Vec<BulkWriteRow> = documents
            .into_iter()
            .map(|previous| {
                let mut tombstone = previous.clone();
                if let Some(fields) = tombstone.as_object_mut() {
                    fields.insert(DELETED_FIELD.to_string(), Value::Bool(true));
                }
                set_last_write_time(&mut tombstone, now);
                BulkWriteRow::update(previous, tombstone)
            })
            .collect();
        let response = storage.bulk_write(rows, "rx-query-remove").await?;
        if let Some(id) = response.error.keys().next() {
            return Err(StorageError::Conflict(id.clone()).into());
        }
        Ok(output)
    }

    /// Modify every document in the result. Needs an update capability,
    /// which this crate does not ship.
    pub async fn update(&self, _changes: Value) -> Result<QueryOutput> {
        Err(Error::PluginMissing("update"))
    }

    fn builder(&self) -> Result<&dyn QueryBuilder> {
        self.core
            .query_builder
            .as_deref()
            .ok_or(Error::PluginMissing("query-builder"))
    }

    /// The query for `query` with this query's op and tag, shared through
    /// the cache while the collection is alive.
    fn derive(&self, query: MangoQuery) -> Arc<RxQuery> {
        match self.cache.upgrade() {
            Some(cache) => cache.get_or_create(self.op, query, self.other.clone(), &self.core),
            None => Arc::new(RxQuery::new(
                self.op,
                query,
                self.other.clone(),
                Arc::clone(&self.core),
                Weak::new(),
            )),
        }
    }

    pub fn where_eq(&self, field: &str, value: Value) -> Result<Arc<RxQuery>> {
        let query = self.builder()?.where_eq(&self.query, field, value)?;
        Ok(self.derive(query))
    }

    pub fn sort_by(&self, field: &str, direction: SortDirection) -> Result<Arc<RxQuery>> {
        let query = self.builder()?.sort(&self.query, field, direction)?;
        Ok(self.derive(query))
    }

    pub fn skip(&self, skip: Option<usize>) -> Result<Arc<RxQuery>> {
        let query = self.builder()?.skip(&self.query, skip)?;
        Ok(self.derive(query))
    }

    pub fn limit(&self, limit: Option<usize>) -> Result<Arc<RxQuery>> {
        let builder = self.builder()?;
        if self.op == QueryOp::FindOne {
            return Err(QueryError::Invalid(
                "limit() cannot be changed on a findOne query".to_string(),
            )
            .into());
        }
        let query = builder.limit(&self.query, limit)?;
        Ok(self.derive(query))
    }

    /// Subscribe to the live result. Must be called inside a tokio runtime.
    ///
    /// The first subscriber starts the shared driver, which runs the query
    /// and then follows the collection's change stream.
    pub fn subscribe(self: &Arc<Self>) -> QuerySubscription {
        let mut subscribers = self.subscribers.lock();
        let receiver = match &subscribers.driver {
            Some(driver) => driver.receiver.clone(),
            None => {
                let (sender, receiver) = watch::channel(None);
                let task = tokio::spawn(drive(Arc::downgrade(self), sender));
                subscribers.driver = Some(Driver {
                    task,
                    receiver: receiver.clone(),
                });
                trace!(query = %self.signature, "started live query driver");
                receiver
            }
        };
        subscribers.count += 1;
        QuerySubscription {
            query: Arc::clone(self),
            receiver,
            last_seen: None,
        }
    }

    fn release_subscriber(&self) {
        let mut subscribers = self.subscribers.lock();
        subscribers.count = subscribers.count.saturating_sub(1);
        if subscribers.count == 0
            && let Some(driver) = subscribers.driver.take()
        {
            driver.task.abort();
            trace!(query = %self.signature, "stopped live query driver");
        }
    }
}

impl std::fmt::Debug for RxQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxQuery")
            .field("op", &self.op)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

async fn drive(query: Weak<RxQuery>, sender: watch::Sender<Option<Emission>>) {
    let Some(changes) = query.upgrade().map(|q| q.core.storage.change_stream()) else {
        return;
    };
    let mut changes = match changes {
        Ok(changes) => changes,
        Err(error) => {
            sender.send_replace(Some(Emission::Failed(Arc::new(error))));
            return;
        }
    };

    if !refresh(&query, &sender).await {
        return;
    }
    while let Some(bulk) = changes.recv().await {
        // Fold bulks that piled up during the last recomputation into one run.
        let mut relevant = !bulk.is_local;
        while let Ok(next) = changes.try_recv() {
            relevant |= !next.is_local;
        }
        if relevant && !refresh(&query, &sender).await {
            return;
        }
    }
}

/// Recompute once and publish the result if it is new. `false` once the
/// query itself is gone.
async fn refresh(query: &Weak<RxQuery>, sender: &watch::Sender<Option<Emission>>) -> bool {
    let Some(query) = query.upgrade() else {
        return false;
    };
    match query.ensure_equal().await {
        Ok(_) => {
            if let Some(result) = query.result() {
                sender.send_if_modified(|slot| {
                    let unchanged = matches!(
                        slot,
                        Some(Emission::Ready(current)) if current.time == result.time
                    );
                    if unchanged {
                        return false;
                    }
                    *slot = Some(Emission::Ready(result));
                    true
                });
            }
        }
        Err(error) => {
            warn!(query = %query.signature, %error, "live query recomputation failed");
            sender.send_replace(Some(Emission::Failed(Arc::new(error))));
        }
    }
    true
}

/// One consumer of a live query. Dropping it unsubscribes.
pub struct QuerySubscription {
    query: Arc<RxQuery>,
    receiver: watch::Receiver<Option<Emission>>,
    last_seen: Option<Emission>,
}

impl QuerySubscription {
    /// The next result that differs from the last one seen, or `None` once
    /// the collection is closed.
    pub async fn next(&mut self) -> Option<Result<QueryOutput>> {
        loop {
            let fresh = {
                let current = self.receiver.borrow_and_update();
                let seen = |emission: &Emission| {
                    self.last_seen.as_ref().is_some_and(|last| last.same_as(emission))
                };
                match current.as_ref() {
                    Some(emission) if !seen(emission) => Some(emission.clone()),
                    _ => None,
                }
            };
            if let Some(emission) = fresh {
                self.last_seen = Some(emission.clone());
                return Some(match emission {
                    Emission::Ready(result) => Ok(self.query.shape(&result)),
                    Emission::Failed(error) => Err(Error::Recompute(error)),
                });
            }
            if self.receiver.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn query(&self) -> &Arc<RxQuery> {
        &self.query
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.query.release_subscriber();
    }
}
