use std::collections::HashMap;

use crate::clock::monotonic_micros;
use crate::error::Result;
use crate::types::{
    BulkWriteRow, ChangeEvent, ChangeOperation, Checkpoint, Document, DocumentsById, EventBulk,
    WriteConflict, is_deleted, primary_key_of,
};

/// The outcome of checking a batch of writes against the stored state.
#[derive(Debug, Clone)]
pub struct CategorizedWrites {
    /// Rows for ids with nothing stored.
    pub inserts: Vec<BulkWriteRow>,
    /// Rows replacing a stored document. `previous` is the stored document.
    pub updates: Vec<BulkWriteRow>,
    pub errors: Vec<WriteConflict>,
    /// Events for every accepted row. The checkpoint is filled in by the
    /// storage instance after the writes are applied.
    pub event_bulk: EventBulk,
}

/// Splits a batch of writes into inserts, updates and conflicts, and derives
/// the change events the accepted writes produce.
pub trait BulkWriteCategorizer: Send + Sync {
    fn categorize(
        &self,
        primary_path: &str,
        docs_in_db: &DocumentsById,
        rows: &[BulkWriteRow],
        context: &str,
    ) -> Result<CategorizedWrites>;
}

/// Optimistic concurrency on `previous`.
///
/// A row is accepted when its `previous` deep-equals the stored document, or
/// when nothing is stored and `previous` is absent. A row without `previous`
/// whose id holds a tombstone revives the document. Rows are checked in
/// order, so later rows in the batch see the state left by earlier ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCategorizer;

impl BulkWriteCategorizer for DefaultCategorizer {
    fn categorize(
        &self,
        primary_path: &str,
        docs_in_db: &DocumentsById,
        rows: &[BulkWriteRow],
        context: &str,
    ) -> Result<CategorizedWrites> {
        let mut view: HashMap<&str, &Document> =
            docs_in_db.iter().map(|(id, doc)| (id.as_str(), doc)).collect();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut errors = Vec::new();
        let mut events = Vec::new();

        for row in rows {
            let id = primary_key_of(&row.document, primary_path)?;
            let stored = view.get(id).copied();

            match (stored, &row.previous) {
                (None, None) => {
                    if !is_deleted(&row.document) {
                        events.push(ChangeEvent {
                            operation: ChangeOperation::Insert,
                            document_id: id.to_string(),
                            document: row.document.clone(),
                            previous: None,
                        });
                    }
                    inserts.push(row.clone());
                }
                (Some(stored), previous)
                    if previous.as_ref() == Some(stored)
                        || (previous.is_none() && is_deleted(stored)) =>
                {
                    if let Some(event) = update_event(id, stored, &row.document) {
                        events.push(event);
                    }
                    updates.push(BulkWriteRow::update(stored.clone(), row.document.clone()));
                }
                (stored, _) => {
                    errors.push(WriteConflict {
                        document_id: id.to_string(),
                        write_row: row.clone(),
                        document_in_db: stored.cloned(),
                    });
                    continue;
                }
            }
            view.insert(id, &row.document);
        }

        Ok(CategorizedWrites {
            inserts,
            updates,
            errors,
            event_bulk: EventBulk {
                id: format!("{:016x}", monotonic_micros()),
                events,
                checkpoint: Checkpoint::zero(),
                context: context.to_string(),
                is_local: false,
            },
        })
    }
}

fn update_event(id: &str, previous: &Document, document: &Document) -> Option<ChangeEvent> {
    let operation = match (is_deleted(previous), is_deleted(document)) {
        (true, true) => return None,
        (true, false) => ChangeOperation::Insert,
        (false, true) => ChangeOperation::Delete,
        (false, false) => ChangeOperation::Update,
    };
    Some(ChangeEvent {
        operation,
        document_id: id.to_string(),
        document: document.clone(),
        previous: Some(previous.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(docs: &[Document]) -> DocumentsById {
        docs.iter()
            .map(|d| (d["id"].as_str().unwrap().to_string(), d.clone()))
            .collect()
    }

    #[test]
    fn test_insert_and_update() {
        let a1 = json!({"id": "a", "n": 1});
        let a2 = json!({"id": "a", "n": 2});
        let b = json!({"id": "b"});
        let db = stored(&[a1.clone()]);
        let rows = vec![
            BulkWriteRow::update(a1.clone(), a2.clone()),
            BulkWriteRow::insert(b.clone()),
        ];

        let out = DefaultCategorizer.categorize("id", &db, &rows, "test").unwrap();
        assert_eq!(out.inserts, vec![BulkWriteRow::insert(b)]);
        assert_eq!(out.updates, vec![BulkWriteRow::update(a1, a2)]);
        assert!(out.errors.is_empty());
        let ops: Vec<ChangeOperation> = out.event_bulk.events.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![ChangeOperation::Update, ChangeOperation::Insert]);
        assert_eq!(out.event_bulk.context, "test");
    }

    #[test]
    fn test_stale_previous_conflicts() {
        let a1 = json!({"id": "a", "n": 1});
        let a2 = json!({"id": "a", "n": 2});
        let db = stored(&[a2.clone()]);
        let rows = vec![BulkWriteRow::update(a1, json!({"id": "a", "n": 3}))];

        let out = DefaultCategorizer.categorize("id", &db, &rows, "test").unwrap();
        assert!(out.updates.is_empty());
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].document_in_db, Some(a2));
        assert!(out.event_bulk.events.is_empty());
    }

    #[test]
    fn test_insert_over_existing_conflicts() {
        let db = stored(&[json!({"id": "a"})]);
        let rows = vec![BulkWriteRow::insert(json!({"id": "a", "n": 1}))];
        let out = DefaultCategorizer.categorize("id", &db, &rows, "test").unwrap();
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn test_update_of_missing_conflicts() {
        let rows = vec![BulkWriteRow::update(json!({"id": "a"}), json!({"id": "a", "n": 1}))];
        let out = DefaultCategorizer
            .categorize("id", &DocumentsById::new(), &rows, "test")
            .unwrap();
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].document_in_db, None);
    }

    #[test]
    fn test_insert_over_tombstone_revives() {
        let tomb = json!({"id": "a", "_deleted": true});
        let db = stored(&[tomb.clone()]);
        let rows = vec![BulkWriteRow::insert(json!({"id": "a", "n": 1}))];

        let out = DefaultCategorizer.categorize("id", &db, &rows, "test").unwrap();
        assert_eq!(out.updates.len(), 1);
        assert_eq!(out.updates[0].previous, Some(tomb));
        assert_eq!(out.event_bulk.events[0].operation, ChangeOperation::Insert);
    }

    #[test]
    fn test_delete_events() {
        let a = json!({"id": "a"});
        let a_deleted = json!({"id": "a", "_deleted": true});
        let db = stored(&[a.clone()]);
        let rows = vec![BulkWriteRow::update(a, a_deleted.clone())];
        let out = DefaultCategorizer.categorize("id", &db, &rows, "test").unwrap();
        assert_eq!(out.event_bulk.events[0].operation, ChangeOperation::Delete);

        // Tombstone to tombstone and tombstone inserts emit nothing.
        let db = stored(&[a_deleted.clone()]);
        let rows = vec![BulkWriteRow::update(
            a_deleted.clone(),
            json!({"id": "a", "_deleted": true, "n": 1}),
        )];
        let out = DefaultCategorizer.categorize("id", &db, &rows, "test").unwrap();
        assert_eq!(out.updates.len(), 1);
        assert!(out.event_bulk.events.is_empty());

        let rows = vec![BulkWriteRow::insert(json!({"id": "b", "_deleted": true}))];
        let out = DefaultCategorizer
            .categorize("id", &DocumentsById::new(), &rows, "test")
            .unwrap();
        assert_eq!(out.inserts.len(), 1);
        assert!(out.event_bulk.events.is_empty());
    }

    #[test]
    fn test_rows_in_batch_chain() {
        let a1 = json!({"id": "a", "n": 1});
        let a2 = json!({"id": "a", "n": 2});
        let rows = vec![BulkWriteRow::insert(a1.clone()), BulkWriteRow::update(a1, a2)];
        let out = DefaultCategorizer
            .categorize("id", &DocumentsById::new(), &rows, "test")
            .unwrap();
        assert_eq!(out.inserts.len(), 1);
        assert_eq!(out.updates.len(), 1);
        assert!(out.errors.is_empty());
    }

    #[test]
    fn test_missing_primary_key_fails() {
        let rows = vec![BulkWriteRow::insert(json!({"name": "x"}))];
        assert!(DefaultCategorizer.categorize("id", &DocumentsById::new(), &rows, "test").is_err());
    }
}
