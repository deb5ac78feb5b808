//! Core types: documents, write rows, checkpoints, change events, schemas.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, SchemaError};

/// A stored document. Always a JSON object.
pub type Document = Value;

/// Documents keyed by primary key.
pub type DocumentsById = HashMap<String, Document>;

/// Field holding the tombstone flag.
pub const DELETED_FIELD: &str = "_deleted";

/// Field path of the last-write-time, in milliseconds.
pub const LWT_FIELD: &str = "_meta.lwt";

/// Resolve a dotted field path (`"_meta.lwt"`) inside a document.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Whether the document is a tombstone. A missing flag means `false`.
pub fn is_deleted(doc: &Value) -> bool {
    doc.get(DELETED_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// The document's `_meta.lwt`, or `0.0` when absent.
pub fn last_write_time(doc: &Value) -> f64 {
    get_path(doc, LWT_FIELD)
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Set `_meta.lwt`, creating `_meta` when missing. Non-objects are left alone.
pub fn set_last_write_time(doc: &mut Value, lwt: f64) {
    let Some(fields) = doc.as_object_mut() else {
        return;
    };
    let meta = fields
        .entry("_meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    if let Some(meta) = meta.as_object_mut() {
        meta.insert("lwt".to_string(), Value::from(lwt));
    }
}

/// Extract the string primary key of a document.
pub fn primary_key_of<'a>(doc: &'a Value, primary_path: &str) -> Result<&'a str, Error> {
    if !doc.is_object() {
        return Err(SchemaError::NotAnObject.into());
    }
    let value = get_path(doc, primary_path)
        .ok_or_else(|| SchemaError::MissingPrimaryKey(primary_path.to_string()))?;
    value
        .as_str()
        .ok_or_else(|| SchemaError::PrimaryKeyNotString(primary_path.to_string()).into())
}

/// The subset of a JSON schema the storage layer needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxSchema {
    /// Name of the primary key field.
    pub primary_key: String,
    /// Secondary index definitions; each is an ordered list of field paths.
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
    #[serde(default)]
    pub version: u32,
}

impl RxSchema {
    pub fn new(primary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            indexes: Vec::new(),
            version: 0,
        }
    }

    pub fn with_index<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.indexes
            .push(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// Resumable cursor into the change history, ordered by `lwt` then `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub lwt: f64,
}

impl Checkpoint {
    /// The checkpoint returned when nothing has ever been read.
    pub fn zero() -> Self {
        Self {
            id: String::new(),
            lwt: 0.0,
        }
    }
}

/// A single write submitted to `bulk_write`.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteRow {
    /// The new state of the document.
    pub document: Document,
    /// The state the writer last saw, `None` for inserts.
    pub previous: Option<Document>,
}

impl BulkWriteRow {
    pub fn insert(document: Document) -> Self {
        Self {
            document,
            previous: None,
        }
    }

    pub fn update(previous: Document, document: Document) -> Self {
        Self {
            document,
            previous: Some(previous),
        }
    }
}

/// A per-document write rejection: `previous` did not match the stored state.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteConflict {
    pub document_id: String,
    pub write_row: BulkWriteRow,
    /// What is actually stored, if anything.
    pub document_in_db: Option<Document>,
}

/// Result of a bulk write. Partial conflicts never fail the whole call.
#[derive(Debug, Clone, Default)]
pub struct BulkWriteResponse {
    pub success: DocumentsById,
    pub error: HashMap<String, WriteConflict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub document_id: String,
    pub document: Document,
    pub previous: Option<Document>,
}

/// Events of one write transaction plus the checkpoint reached after them.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBulk {
    pub id: String,
    pub events: Vec<ChangeEvent>,
    pub checkpoint: Checkpoint,
    /// Free-form tag passed by the writer.
    pub context: String,
    /// Emitted by a local-document store; live queries ignore these.
    pub is_local: bool,
}

/// Result of `get_changed_documents_since`.
#[derive(Debug, Clone)]
pub struct ChangedDocuments {
    pub documents: Vec<Document>,
    pub checkpoint: Checkpoint,
}
