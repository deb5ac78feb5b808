//! # ReactDB
//!
//! The storage and live-query core of a reactive document database.
//!
//! Collections store JSON documents in a transactional ordered key-value
//! store, one subspace per collection, with a secondary index entry per
//! document and index. Every committed write becomes a bulk of change events
//! that live queries fold into their cached results, so subscribers see new
//! results without re-running the query against storage where possible.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use reactdb_core::collection::Database;
//! use reactdb_core::kv::ConnectionPool;
//! use reactdb_core::query::{MangoQuery, SortDirection};
//! use reactdb_core::types::RxSchema;
//! use serde_json::json;
//!
//! # async fn run() -> reactdb_core::error::Result<()> {
//! let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
//! let users = db
//!     .collection("users", RxSchema::new("id").with_index(["age"]))
//!     .execute()?;
//!
//! let adults = users.find(
//!     MangoQuery::with_selector(json!({"age": {"$gte": 18}})).sort_by("age", SortDirection::Asc),
//! );
//! let mut live = adults.subscribe();
//!
//! users.insert(json!({"id": "alice", "age": 30})).await?;
//!
//! while let Some(result) = live.next().await {
//!     println!("{} adults", result?.into_documents().len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod collection;
pub mod config;
pub mod encoding;
pub mod error;
pub mod kv;
pub mod query;
pub mod storage;
pub mod types;
