//! Integration tests for query sharing and cache replacement.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::time::{Duration, sleep};

use reactdb_core::collection::Database;
use reactdb_core::config::QueryCacheSettings;
use reactdb_core::kv::ConnectionPool;
use reactdb_core::query::{MangoQuery, QueryOp};
use reactdb_core::types::RxSchema;

fn database() -> Database {
    Database::new("app", Arc::new(ConnectionPool::in_memory()))
}

#[tokio::test]
async fn test_equal_queries_share_instance() {
    let db = database();
    let users = db.collection("users", RxSchema::new("id")).execute().unwrap();

    let a = MangoQuery::with_selector(json!({"age": {"$gt": 1, "$lt": 9}, "name": "x"}));
    let b = MangoQuery::with_selector(json!({"name": "x", "age": {"$lt": 9, "$gt": 1}}));
    let (a, b) = (users.find(a), users.find(b));
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(users.query_cache().len(), 1);

    let one = users.find_one(MangoQuery::with_selector(json!({"name": "x"})));
    let many = users.find(MangoQuery::with_selector(json!({"name": "x"})));
    assert!(!Arc::ptr_eq(&one, &many));

    let tagged = users.query(QueryOp::Find, MangoQuery::all(), json!({"tag": 1}));
    assert!(!Arc::ptr_eq(&tagged, &users.find(MangoQuery::all())));
    assert!(Arc::ptr_eq(
        &tagged,
        &users.query(QueryOp::Find, MangoQuery::all(), json!({"tag": 1}))
    ));
}

#[tokio::test]
async fn test_least_recently_used_is_uncached() {
    let db = database();
    let users = db
        .collection("users", RxSchema::new("id"))
        .cache_settings(QueryCacheSettings {
            tries_to_keep: 2,
            unexecuted_lifetime_ms: 60_000,
        })
        .execute()
        .unwrap();

    let mut queries = Vec::new();
    for limit in 1..=3 {
        let query = users.find(MangoQuery::all().limit(limit));
        query.exec().await.unwrap();
        queries.push(query);
        sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(users.query_cache().len(), 3);

    // The next lookup evicts the oldest executed query.
    let newest = users.find(MangoQuery::all().limit(4));
    assert!(newest.is_cached());
    assert!(!queries[0].is_cached());
    assert!(queries[1].is_cached());
    assert!(queries[2].is_cached());
    assert_eq!(users.query_cache().len(), 3);

    // An uncached query keeps working on its own.
    assert!(queries[0].exec().await.unwrap().into_documents().is_empty());
    assert!(!Arc::ptr_eq(&queries[0], &users.find(MangoQuery::all().limit(1))));
}

#[tokio::test]
async fn test_subscribed_queries_are_kept() {
    let db = database();
    let users = db
        .collection("users", RxSchema::new("id"))
        .cache_settings(QueryCacheSettings {
            tries_to_keep: 1,
            unexecuted_lifetime_ms: 60_000,
        })
        .execute()
        .unwrap();

    let watched = users.find(MangoQuery::with_selector(json!({"watched": true})));
    let _sub = watched.subscribe();
    let older = users.find(MangoQuery::all());
    older.exec().await.unwrap();
    let newer = users.find(MangoQuery::all().limit(2));
    newer.exec().await.unwrap();

    // Only unsubscribed queries count towards the limit.
    users.find(MangoQuery::with_selector(json!({"x": Value::Null})));
    assert!(watched.is_cached());
    assert!(!older.is_cached());
    assert!(newer.is_cached());
}

#[tokio::test]
async fn test_destroy_clears_cache() {
    let db = database();
    let users = db.collection("users", RxSchema::new("id")).execute().unwrap();
    let query = users.find(MangoQuery::all());
    users.destroy().await.unwrap();
    assert!(users.query_cache().is_empty());
    assert!(!query.is_cached());
}
