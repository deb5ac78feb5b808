use std::cmp::Ordering;
use std::future::Future;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::StorageSettings;
use crate::encoding::encode_prefix;
use crate::error::{Error, Result, StorageError, TxnError};
use crate::kv::{ConnectionPool, KvBackend, Subspace};
use crate::query::{PreparedQuery, QueryMatcher};
use crate::types::{
    BulkWriteResponse, BulkWriteRow, Checkpoint, ChangedDocuments, Document, DocumentsById,
    EventBulk, RxSchema, is_deleted, last_write_time, primary_key_of,
};

use super::categorize::{BulkWriteCategorizer, DefaultCategorizer};
use super::change_buffer::ChangeEventBuffer;
use super::change_stream::Multicast;
use super::index_meta::{
    IndexMeta, build_index_metas, changes_index_fields, cleanup_index_fields, index_name,
};
use super::scan::run_query;

/// Subspace holding `primary key -> document`.
pub const MAIN_STORE: &str = "main";

/// Receives every event bulk written after subscribing.
pub type ChangeStreamReceiver = mpsc::UnboundedReceiver<Arc<EventBulk>>;

/// Namespace of one storage instance inside the backend.
pub fn namespace(database_name: &str, collection_name: &str, schema_version: u32) -> String {
    format!("rxdb::{database_name}::{collection_name}::{schema_version}")
}

pub(crate) fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    rmp_serde::to_vec(doc).map_err(|e| StorageError::Serialization(e.to_string()).into())
}

pub(crate) fn decode_document(raw: &[u8]) -> Result<Document> {
    rmp_serde::from_slice(raw).map_err(|e| StorageError::Serialization(e.to_string()).into())
}

/// A request to resolve diverging document states between two writers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolutionTask {
    pub id: String,
    pub new_document_state: Document,
    pub real_master_state: Document,
    pub assumed_master_state: Option<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolutionSolution {
    pub id: String,
    pub is_equal: bool,
    pub document: Option<Document>,
}

/// Identity of a storage instance.
#[derive(Debug, Clone)]
pub struct StorageInstanceParams {
    pub database_name: String,
    pub collection_name: String,
    pub schema: RxSchema,
    /// Set for local-document stores; their bulks are ignored by live queries.
    pub is_local: bool,
}

impl StorageInstanceParams {
    pub fn new(
        database_name: impl Into<String>,
        collection_name: impl Into<String>,
        schema: RxSchema,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            collection_name: collection_name.into(),
            schema,
            is_local: false,
        }
    }

    pub fn local(mut self) -> Self {
        self.is_local = true;
        self
    }
}

/// Builder for [`StorageInstance`].
pub struct StorageInstanceBuilder {
    params: StorageInstanceParams,
    address: String,
    settings: StorageSettings,
    clock: Arc<dyn Clock>,
    categorizer: Arc<dyn BulkWriteCategorizer>,
}

impl StorageInstanceBuilder {
    /// Backend address passed to the connection pool.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn settings(mut self, settings: StorageSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn categorizer(mut self, categorizer: Arc<dyn BulkWriteCategorizer>) -> Self {
        self.categorizer = categorizer;
        self
    }

    pub fn open(self, pool: &ConnectionPool) -> Result<StorageInstance> {
        let backend = pool.connect(&self.address)?;
        let params = self.params;
        let root = Subspace::new(&namespace(
            &params.database_name,
            &params.collection_name,
            params.schema.version,
        ))?;
        let main = root.at(MAIN_STORE)?;
        let indexes = build_index_metas(&params.schema, &root)?;

        info!(
            database = %params.database_name,
            collection = %params.collection_name,
            indexes = indexes.len(),
            "opened storage instance"
        );
        Ok(StorageInstance {
            database_name: params.database_name,
            collection_name: params.collection_name,
            schema: params.schema,
            is_local: params.is_local,
            change_buffer: ChangeEventBuffer::new(self.settings.change_buffer_limit),
            settings: self.settings,
            backend: RwLock::new(Some(backend)),
            root,
            main,
            indexes,
            categorizer: self.categorizer,
            clock: self.clock,
            changes: Multicast::new(),
            conflict_tasks: Multicast::new(),
            write_lock: Mutex::new(()),
        })
    }
}

/// Documents and their secondary indexes for one collection, stored in one
/// namespace of a transactional key-value backend.
///
/// Writes go through a per-instance writer lock that also covers appending
/// to the change buffer and publishing on the change stream, so the stream
/// order equals the commit order. Reads run in their own transactions.
pub struct StorageInstance {
    database_name: String,
    collection_name: String,
    schema: RxSchema,
    is_local: bool,
    settings: StorageSettings,
    /// `None` once closed.
    backend: RwLock<Option<Arc<dyn KvBackend>>>,
    root: Subspace,
    main: Subspace,
    indexes: Vec<IndexMeta>,
    categorizer: Arc<dyn BulkWriteCategorizer>,
    clock: Arc<dyn Clock>,
    change_buffer: ChangeEventBuffer,
    changes: Multicast<Arc<EventBulk>>,
    conflict_tasks: Multicast<ConflictResolutionTask>,
    write_lock: Mutex<()>,
}

impl StorageInstance {
    pub fn builder(params: StorageInstanceParams) -> StorageInstanceBuilder {
        StorageInstanceBuilder {
            params,
            address: "default".to_string(),
            settings: StorageSettings::default(),
            clock: Arc::new(SystemClock),
            categorizer: Arc::new(DefaultCategorizer),
        }
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn schema(&self) -> &RxSchema {
        &self.schema
    }

    pub fn primary_path(&self) -> &str {
        &self.schema.primary_key
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    pub fn indexes(&self) -> &[IndexMeta] {
        &self.indexes
    }

    pub fn change_buffer(&self) -> &ChangeEventBuffer {
        &self.change_buffer
    }

    /// Current time of this instance's clock, in milliseconds.
    pub fn now_ms(&self) -> f64 {
        self.clock.now_ms()
    }

    pub fn is_closed(&self) -> bool {
        self.backend.read().is_none()
    }

    fn backend(&self) -> Result<Arc<dyn KvBackend>> {
        self.backend.read().clone().ok_or_else(|| StorageError::Closed.into())
    }

    fn consistency_error(&self, message: impl Into<String>) -> Error {
        Error::InternalConsistency {
            database: self.database_name.clone(),
            collection: self.collection_name.clone(),
            message: message.into(),
        }
    }

    /// The index with exactly these fields.
    pub fn index_for(&self, fields: &[String]) -> Result<&IndexMeta> {
        self.indexes
            .iter()
            .find(|index| index.fields == fields)
            .ok_or_else(|| StorageError::IndexNotFound(index_name(fields)).into())
    }

    /// Run `attempt` until it does not fail with a transaction conflict, at
    /// most `max_transaction_retries` times.
    async fn with_retries<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max = self.settings.max_transaction_retries.max(1);
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Err(Error::Transaction(TxnError::Conflict)) if tries < max => {
                    debug!(operation, tries, "transaction conflict, retrying");
                }
                Err(Error::Transaction(TxnError::Conflict)) => {
                    warn!(
                        operation,
                        tries,
                        collection = %self.collection_name,
                        "giving up after conflicts"
                    );
                    return Err(TxnError::RetriesExhausted(tries).into());
                }
                other => return other,
            }
        }
    }

    /// Write a batch of rows in one transaction.
    ///
    /// Rows whose `previous` does not match the stored document are reported
    /// in `error` and not written. Accepted rows are applied to the main
    /// store and every index; their events are appended to the change buffer
    /// and published on the change stream once the transaction committed.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn bulk_write(
        &self,
        rows: Vec<BulkWriteRow>,
        context: &str,
    ) -> Result<BulkWriteResponse> {
        self.backend()?;
        if rows.is_empty() {
            return Ok(BulkWriteResponse::default());
        }

        let _writer = self.write_lock.lock().await;
        let backend = self.backend()?;
        let backend = backend.as_ref();
        let rows = rows.as_slice();
        let (response, bulk) = self
            .with_retries("bulk_write", move || self.try_bulk_write(backend, rows, context))
            .await?;

        debug!(
            collection = %self.collection_name,
            written = response.success.len(),
            conflicts = response.error.len(),
            context,
            "bulk write committed"
        );
        if let Some(bulk) = bulk {
            let bulk = Arc::new(bulk);
            let counter = self.change_buffer.append(&bulk);
            trace!(counter, events = bulk.events.len(), "appended event bulk");
            self.changes.publish(bulk);
        }
        Ok(response)
    }

    async fn try_bulk_write(
        &self,
        backend: &dyn KvBackend,
        rows: &[BulkWriteRow],
        context: &str,
    ) -> Result<(BulkWriteResponse, Option<EventBulk>)> {
        let primary_path = self.primary_path();
        let mut tx = backend.begin().await?;

        let mut docs_in_db = DocumentsById::new();
        for row in rows {
            let id = primary_key_of(&row.document, primary_path)?;
            if docs_in_db.contains_key(id) {
                continue;
            }
            if let Some(raw) = tx.get(&self.main.pack(id.as_bytes())).await? {
                docs_in_db.insert(id.to_string(), decode_document(&raw)?);
            }
        }

        let categorized = self
            .categorizer
            .categorize(primary_path, &docs_in_db, rows, context)?;

        let mut response = BulkWriteResponse::default();
        for conflict in categorized.errors {
            response.error.insert(conflict.document_id.clone(), conflict);
        }

        for row in &categorized.inserts {
            let id = primary_key_of(&row.document, primary_path)?;
            tx.set(&self.main.pack(id.as_bytes()), &encode_document(&row.document)?);
            for index in &self.indexes {
                tx.set(&index.entry_key(&row.document)?, id.as_bytes());
            }
            response.success.insert(id.to_string(), row.document.clone());
        }

        for row in &categorized.updates {
            let id = primary_key_of(&row.document, primary_path)?;
            let previous = row
                .previous
                .as_ref()
                .ok_or_else(|| {
                    self.consistency_error(format!("update of '{id}' has no previous state"))
                })?;
            tx.set(&self.main.pack(id.as_bytes()), &encode_document(&row.document)?);
            for index in &self.indexes {
                let old_key = index.entry_key(previous)?;
                let new_key = index.entry_key(&row.document)?;
                if old_key != new_key {
                    tx.delete(&old_key);
                    tx.set(&new_key, id.as_bytes());
                }
            }
            response.success.insert(id.to_string(), row.document.clone());
        }

        let mut bulk = categorized.event_bulk;
        let bulk = if bulk.events.is_empty() {
            None
        } else {
            bulk.checkpoint = self.newest_checkpoint(&response.success);
            bulk.is_local = self.is_local;
            Some(bulk)
        };

        tx.commit().await?;
        Ok((response, bulk))
    }

    /// `{id, lwt}` of the newest document: highest lwt, ties to the greater id.
    fn newest_checkpoint(&self, written: &DocumentsById) -> Checkpoint {
        written
            .iter()
            .map(|(id, doc)| (id, last_write_time(doc)))
            .max_by(|(a_id, a_lwt), (b_id, b_lwt)| {
                a_lwt
                    .partial_cmp(b_lwt)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a_id.cmp(b_id))
            })
            .map(|(id, lwt)| Checkpoint { id: id.clone(), lwt })
            .unwrap_or_else(Checkpoint::zero)
    }

    /// Point lookups in one transaction. Tombstones are left out unless
    /// `include_deleted` is set; unknown ids are simply absent.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn find_documents_by_id<S: AsRef<str>>(
        &self,
        ids: &[S],
        include_deleted: bool,
    ) -> Result<DocumentsById> {
        let ids: Vec<String> = ids.iter().map(|id| id.as_ref().to_string()).collect();
        let backend = self.backend()?;
        let mut tx = backend.begin().await?;
        let mut found = DocumentsById::new();
        for id in ids {
            let Some(raw) = tx.get(&self.main.pack(id.as_bytes())).await? else {
                continue;
            };
            let doc = decode_document(&raw)?;
            if include_deleted || !is_deleted(&doc) {
                found.insert(id, doc);
            }
        }
        Ok(found)
    }

    /// Documents matching a prepared query, in query order.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn query(
        &self,
        prepared: &PreparedQuery,
        matcher: &dyn QueryMatcher,
    ) -> Result<Vec<Document>> {
        let backend = self.backend()?;
        let index = self.index_for(&prepared.plan.index)?;
        let mut tx = backend.begin().await?;
        run_query(tx.as_mut(), &self.main, index, prepared, matcher).await
    }

    /// Number of documents matching a prepared query, ignoring skip and limit.
    pub async fn count(
        &self,
        prepared: &PreparedQuery,
        matcher: &dyn QueryMatcher,
    ) -> Result<usize> {
        let mut unbounded = prepared.clone();
        unbounded.query.skip = None;
        unbounded.query.limit = None;
        Ok(self.query(&unbounded, matcher).await?.len())
    }

    /// Up to `limit` documents written strictly after `checkpoint`, ordered
    /// by `(lwt, id)`, tombstones included.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<ChangedDocuments> {
        let backend = self.backend()?;
        let index = self.index_for(&changes_index_fields(self.primary_path()))?;
        let after = checkpoint
            .map(|c| encode_prefix(&index.fields, &[json!(c.lwt), json!(c.id)]))
            .transpose()?;
        let start = match &after {
            Some(key) => Bound::Excluded(key.as_bytes()),
            None => Bound::Unbounded,
        };
        let range = index.subspace.range_between(start, Bound::Unbounded);

        let mut tx = backend.begin().await?;
        let entries = tx.get_range(&range, Some(limit)).await?;
        let mut documents = Vec::with_capacity(entries.len());
        for (_, id) in entries {
            match tx.get(&self.main.pack(&id)).await? {
                Some(raw) => documents.push(decode_document(&raw)?),
                None => {
                    return Err(self.consistency_error(format!(
                        "changes index points at missing document '{}'",
                        String::from_utf8_lossy(&id)
                    )));
                }
            }
        }

        let checkpoint = match documents.last() {
            Some(last) => Checkpoint {
                id: primary_key_of(last, self.primary_path())?.to_string(),
                lwt: last_write_time(last),
            },
            None => checkpoint.cloned().unwrap_or_else(Checkpoint::zero),
        };
        Ok(ChangedDocuments { documents, checkpoint })
    }

    /// Permanently erase one batch of tombstones older than
    /// `minimum_deleted_age_ms`. Returns `true` when no eligible tombstone
    /// is left after this batch.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn cleanup(&self, minimum_deleted_age_ms: f64) -> Result<bool> {
        self.backend()?;
        let _writer = self.write_lock.lock().await;
        let backend = self.backend()?;
        let backend = backend.as_ref();
        let threshold = self.clock.now_ms() - minimum_deleted_age_ms;

        let (removed, no_more) = self
            .with_retries("cleanup", move || self.try_cleanup(backend, threshold))
            .await?;
        info!(collection = %self.collection_name, removed, no_more, "cleanup finished");
        Ok(no_more)
    }

    async fn try_cleanup(&self, backend: &dyn KvBackend, threshold: f64) -> Result<(usize, bool)> {
        let index = self.index_for(&cleanup_index_fields())?;
        let lower = encode_prefix(&index.fields, &[json!(true), json!(1)])?;
        let upper = encode_prefix(&index.fields, &[json!(true), json!(threshold)])?;
        let range = index
            .subspace
            .range_between(Bound::Excluded(lower.as_bytes()), Bound::Excluded(upper.as_bytes()));
        let batch_size = self.settings.batch_size;

        let mut tx = backend.begin().await?;
        let mut entries = tx.get_range(&range, Some(batch_size.saturating_add(1))).await?;
        let no_more = entries.len() <= batch_size;
        entries.truncate(batch_size);

        for (_, id) in &entries {
            let main_key = self.main.pack(id);
            let Some(raw) = tx.get(&main_key).await? else {
                return Err(self.consistency_error(format!(
                    "cleanup index points at missing document '{}'",
                    String::from_utf8_lossy(id)
                )));
            };
            let doc = decode_document(&raw)?;
            for index in &self.indexes {
                tx.delete(&index.entry_key(&doc)?);
            }
            tx.delete(&main_key);
        }
        tx.commit().await?;
        Ok((entries.len(), no_more))
    }

    /// Event bulks of every write committed from now on.
    pub fn change_stream(&self) -> Result<ChangeStreamReceiver> {
        self.backend()?;
        Ok(self.changes.subscribe())
    }

    /// Conflict resolution requests. This storage never emits any; the
    /// stream ends when the instance closes.
    pub fn conflict_resolution_tasks(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<ConflictResolutionTask>> {
        self.backend()?;
        Ok(self.conflict_tasks.subscribe())
    }

    pub async fn resolve_conflict_resolution_task(
        &self,
        solution: ConflictResolutionSolution,
    ) -> Result<()> {
        self.backend()?;
        trace!(task = %solution.id, "conflict resolution task resolved");
        Ok(())
    }

    pub async fn get_attachment_data(
        &self,
        _document_id: &str,
        _attachment_id: &str,
    ) -> Result<Vec<u8>> {
        self.backend()?;
        Err(Error::NotImplemented("attachments"))
    }

    /// Delete every key of this instance, then close it.
    pub async fn remove(&self) -> Result<()> {
        self.backend()?;
        {
            let _writer = self.write_lock.lock().await;
            let backend = self.backend()?;
            let backend = backend.as_ref();
            let root = &self.root;
            self.with_retries("remove", move || async move {
                let mut tx = backend.begin().await?;
                tx.clear_range(&root.range());
                tx.commit().await
            })
            .await?;
        }
        info!(collection = %self.collection_name, "removed storage instance data");
        self.close().await
    }

    /// Complete the change streams and release the backend handle.
    /// Closing twice is a programming error.
    pub async fn close(&self) -> Result<()> {
        let released = self.backend.write().take();
        if released.is_none() {
            return Err(self.consistency_error("storage instance closed twice"));
        }
        self.changes.complete();
        self.conflict_tasks.complete();
        debug!(collection = %self.collection_name, "closed storage instance");
        Ok(())
    }
}
