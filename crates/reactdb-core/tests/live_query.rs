//! Integration tests for live queries: subscribe, write, observe the new result.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tokio::time::{Duration, timeout};

use reactdb_core::collection::{Collection, Database};
use reactdb_core::config::StorageSettings;
use reactdb_core::error::{Error, QueryError};
use reactdb_core::kv::ConnectionPool;
use reactdb_core::query::{
    FullRerunReducer, IndexScanPlanner, MangoQuery, MangoQueryBuilder, PreparedQuery, QueryOutput,
    QueryPlanner, SortDirection,
};
use reactdb_core::types::{BulkWriteRow, RxSchema};

fn user(id: &str, age: i64, lwt: f64) -> Value {
    json!({"id": id, "age": age, "_deleted": false, "_meta": {"lwt": lwt}})
}

fn tombstone(doc: &Value, lwt: f64) -> Value {
    let mut doc = doc.clone();
    doc["_deleted"] = json!(true);
    doc["_meta"]["lwt"] = json!(lwt);
    doc
}

fn ids(output: QueryOutput) -> Vec<String> {
    output
        .into_documents()
        .into_iter()
        .map(|doc| doc["id"].as_str().unwrap().to_string())
        .collect()
}

fn users(db: &Database) -> Arc<Collection> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    db.collection("users", RxSchema::new("id").with_index(["age"]))
        .query_builder(Arc::new(MangoQueryBuilder))
        .execute()
        .unwrap()
}

async fn next_ids(sub: &mut reactdb_core::query::QuerySubscription) -> Vec<String> {
    let result = timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("no emission in time")
        .expect("subscription ended");
    ids(result.unwrap())
}

#[tokio::test]
async fn test_subscription_follows_writes() {
    let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
    let users = users(&db);
    users.insert(user("a", 30, 1.0)).await.unwrap();

    let adults = users.find(
        MangoQuery::with_selector(json!({"age": {"$gte": 18}})).sort_by("age", SortDirection::Asc),
    );
    let mut sub = adults.subscribe();
    assert_eq!(next_ids(&mut sub).await, vec!["a"]);

    users.insert(user("b", 20, 2.0)).await.unwrap();
    assert_eq!(next_ids(&mut sub).await, vec!["b", "a"]);

    // Not matching: no new result, so the next one is the insert after it.
    users.insert(user("kid", 9, 3.0)).await.unwrap();
    users.insert(user("c", 40, 4.0)).await.unwrap();
    assert_eq!(next_ids(&mut sub).await, vec!["b", "a", "c"]);

    // Only the first run touched storage.
    assert_eq!(adults.stats().exec_over_database_count, 1);
}

#[tokio::test]
async fn test_subscribers_share_recomputation() {
    let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
    let users = users(&db);
    users.insert(user("a", 30, 1.0)).await.unwrap();

    let over_five = || MangoQuery::with_selector(json!({"age": {"$gt": 5}}));
    let query = users.find(over_five());
    let mut first = query.subscribe();
    let mut second = users.find(over_five()).subscribe();
    assert_eq!(query.subscriber_count(), 2);

    assert_eq!(next_ids(&mut first).await, vec!["a"]);
    assert_eq!(next_ids(&mut second).await, vec!["a"]);
    assert_eq!(query.stats().exec_over_database_count, 1);

    users.insert(user("b", 6, 2.0)).await.unwrap();
    assert_eq!(next_ids(&mut first).await, vec!["a", "b"]);
    assert_eq!(next_ids(&mut second).await, vec!["a", "b"]);
    assert_eq!(query.stats().exec_over_database_count, 1);

    drop(first);
    assert_eq!(query.subscriber_count(), 1);
    users.insert(user("c", 7, 3.0)).await.unwrap();
    assert_eq!(next_ids(&mut second).await, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_find_one_emits_none_then_document() {
    let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
    let users = users(&db);

    let query = users.find_one_by_id("x");
    let mut sub = query.subscribe();
    let first = timeout(Duration::from_secs(5), sub.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(first, QueryOutput::One(None));

    users.insert(user("x", 1, 1.0)).await.unwrap();
    let second = timeout(Duration::from_secs(5), sub.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(second.into_one().unwrap()["id"], json!("x"));
}

#[tokio::test]
async fn test_subscription_ends_on_destroy() {
    let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
    let users = users(&db);

    let mut sub = users.find(MangoQuery::all()).subscribe();
    assert!(next_ids(&mut sub).await.is_empty());

    users.destroy().await.unwrap();
    let ended = timeout(Duration::from_secs(5), sub.next()).await.unwrap();
    assert!(ended.is_none());
    assert!(matches!(
        users.find(MangoQuery::all()).exec().await,
        Err(Error::Query(QueryError::Destroyed))
    ));
}

/// Every reduced result must equal what a full run would have returned.
#[tokio::test]
async fn test_incremental_matches_full_run() {
    let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
    let reduced = db
        .collection("reduced", RxSchema::new("id").with_index(["age"]))
        .execute()
        .unwrap();
    let full = db
        .collection("full", RxSchema::new("id").with_index(["age"]))
        .reducer(Arc::new(FullRerunReducer))
        .execute()
        .unwrap();

    let queries = [
        MangoQuery::all(),
        MangoQuery::all().sort_by("age", SortDirection::Asc).limit(3),
        MangoQuery::with_selector(json!({"age": {"$lt": 50}}))
            .sort_by("age", SortDirection::Desc)
            .limit(2),
        MangoQuery::all().sort_by("age", SortDirection::Asc).skip(1).limit(2),
    ];

    let mut docs: Vec<Value> = (0..6).map(|i| user(&format!("u{i}"), i * 10, 1.0)).collect();
    let mut writes: Vec<Vec<BulkWriteRow>> =
        vec![docs.iter().cloned().map(BulkWriteRow::insert).collect()];

    let mut lwt = 2.0;
    let step = |docs: &mut Vec<Value>, index: usize, next: Value| {
        let row = BulkWriteRow::update(docs[index].clone(), next.clone());
        docs[index] = next;
        row
    };
    // Move the smallest to the end, delete from the middle, insert at the front.
    let moved = {
        let mut d = docs[0].clone();
        d["age"] = json!(99);
        d["_meta"]["lwt"] = json!(lwt);
        d
    };
    writes.push(vec![step(&mut docs, 0, moved)]);
    lwt += 1.0;
    let deleted = tombstone(&docs[2], lwt);
    writes.push(vec![step(&mut docs, 2, deleted)]);
    lwt += 1.0;
    writes.push(vec![BulkWriteRow::insert(user("front", -1, lwt))]);
    lwt += 1.0;
    let lowered = {
        let mut d = docs[5].clone();
        d["age"] = json!(1);
        d["_meta"]["lwt"] = json!(lwt);
        d
    };
    writes.push(vec![step(&mut docs, 5, lowered)]);

    let reduced_queries: Vec<_> = queries.iter().map(|q| reduced.find(q.clone())).collect();
    let full_queries: Vec<_> = queries.iter().map(|q| full.find(q.clone())).collect();

    for rows in writes {
        reduced.bulk_write(rows.clone()).await.unwrap();
        full.bulk_write(rows).await.unwrap();
        for (r, f) in reduced_queries.iter().zip(&full_queries) {
            assert_eq!(
                r.exec().await.unwrap(),
                f.exec().await.unwrap(),
                "diverged for {}",
                r.signature()
            );
        }
    }
    let reduced_runs = reduced_queries[0].stats().exec_over_database_count;
    let full_runs = full_queries[0].stats().exec_over_database_count;
    assert!(reduced_runs < full_runs);
}

#[tokio::test]
async fn test_identical_rerun_advances_counter() {
    let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
    let users = db
        .collection("users", RxSchema::new("id"))
        .reducer(Arc::new(FullRerunReducer))
        .execute()
        .unwrap();
    let adults = users.find(MangoQuery::with_selector(json!({"age": {"$gte": 18}})));
    assert!(adults.ensure_equal().await.unwrap());
    let before = adults.result().unwrap();

    users.insert(user("kid", 3, 1.0)).await.unwrap();
    assert!(!adults.is_in_sync());
    assert!(!adults.ensure_equal().await.unwrap());
    assert!(adults.is_in_sync());
    assert_eq!(adults.result().unwrap().time, before.time);
    assert_eq!(adults.stats().exec_over_database_count, 2);
}

#[tokio::test]
async fn test_exec_required_and_remove() {
    let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
    let users = users(&db);
    users.insert(user("a", 30, 1.0)).await.unwrap();
    users.insert(user("b", 10, 2.0)).await.unwrap();

    let all = users.find(MangoQuery::all());
    assert!(matches!(
        all.exec_required().await,
        Err(Error::Query(QueryError::RequiredOnFind))
    ));

    let old = users.find(MangoQuery::with_selector(json!({"age": {"$gt": 20}})));
    assert_eq!(ids(old.remove().await.unwrap()), vec!["a"]);
    assert_eq!(ids(all.exec().await.unwrap()), vec!["b"]);
    assert!(users.find_one_by_id("a").exec().await.unwrap().into_one().is_none());
}

#[tokio::test]
async fn test_builder_methods() {
    let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
    let users = users(&db);
    let plain = db.collection("plain", RxSchema::new("id")).execute().unwrap();

    assert!(matches!(
        plain.find(MangoQuery::all()).where_eq("age", json!(3)),
        Err(Error::PluginMissing(_))
    ));

    let derived = users
        .find(MangoQuery::all())
        .where_eq("age", json!(3))
        .unwrap()
        .sort_by("id", SortDirection::Asc)
        .unwrap();
    let direct =
        users.find(MangoQuery::with_selector(json!({"age": 3})).sort_by("id", SortDirection::Asc));
    assert!(Arc::ptr_eq(&derived, &direct));

    assert!(matches!(
        users.find_one(MangoQuery::all()).limit(Some(5)),
        Err(Error::Query(QueryError::Invalid(_)))
    ));
}

/// Plans like the default planner, except once after `fail_next` is set.
#[derive(Default)]
struct FailingPlanner {
    fail_next: AtomicBool,
}

impl QueryPlanner for FailingPlanner {
    fn prepare(
        &self,
        schema: &RxSchema,
        query: &MangoQuery,
    ) -> reactdb_core::error::Result<PreparedQuery> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(QueryError::Invalid("planner unavailable".to_string()).into());
        }
        IndexScanPlanner.prepare(schema, query)
    }
}

#[tokio::test]
async fn test_failed_recompute_keeps_pending_changes() {
    let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
    let planner = Arc::new(FailingPlanner::default());
    let docs = db
        .collection("docs", RxSchema::new("id"))
        .planner(planner.clone())
        .execute()
        .unwrap();
    let first = json!({"id": "x", "n": 1, "_deleted": false, "_meta": {"lwt": 1.0}});
    docs.insert(first.clone()).await.unwrap();

    let query = docs.find_one_by_id("x");
    assert_eq!(query.exec().await.unwrap().into_one().unwrap()["n"], json!(1));

    let mut second = first.clone();
    second["n"] = json!(2);
    second["_meta"]["lwt"] = json!(2.0);
    let response = docs.bulk_write(vec![BulkWriteRow::update(first, second)]).await.unwrap();
    assert!(response.error.is_empty());

    planner.fail_next.store(true, Ordering::SeqCst);
    assert!(matches!(
        query.exec().await,
        Err(Error::Query(QueryError::Invalid(_)))
    ));
    assert!(!query.is_in_sync());

    assert_eq!(query.exec().await.unwrap().into_one().unwrap()["n"], json!(2));
    assert!(query.is_in_sync());
}

#[tokio::test]
async fn test_buffer_overrun_runs_query_again() {
    let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
    let settings = StorageSettings {
        change_buffer_limit: 2,
        ..StorageSettings::default()
    };
    let users = db
        .collection("users", RxSchema::new("id"))
        .settings(settings)
        .execute()
        .unwrap();

    let all = users.find(MangoQuery::all());
    assert!(ids(all.exec().await.unwrap()).is_empty());
    assert_eq!(all.stats().exec_over_database_count, 1);

    for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
        users.insert(user(id, 1, i as f64 + 1.0)).await.unwrap();
    }

    assert_eq!(ids(all.exec().await.unwrap()), vec!["a", "b", "c"]);
    assert_eq!(all.stats().exec_over_database_count, 2);
    assert!(all.is_in_sync());
}

#[tokio::test]
async fn test_local_writes_do_not_wake_subscribers() {
    let db = Database::new("app", Arc::new(ConnectionPool::in_memory()));
    let notes = db
        .collection("notes", RxSchema::new("id"))
        .local()
        .execute()
        .unwrap();

    let all = notes.find(MangoQuery::all());
    let mut sub = all.subscribe();
    assert!(next_ids(&mut sub).await.is_empty());

    notes.insert(user("a", 1, 1.0)).await.unwrap();
    assert!(timeout(Duration::from_millis(100), sub.next()).await.is_err());
    assert_eq!(all.stats().exec_over_database_count, 1);
    assert!(!all.is_in_sync());

    assert_eq!(ids(all.exec().await.unwrap()), vec!["a"]);
    assert!(all.is_in_sync());
}
