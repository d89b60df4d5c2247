//! End-to-end query planning over a populated store, including the
//! prefix push-down path on the table backend.

mod common;

use common::*;
use quickdb::{FilterOp, SortOrder, Value};

const CITIES: [&str; 3] = ["Cairo", "Alexandria", "Giza"];

async fn seed_users(db: &quickdb::Database, count: usize) {
    let entries: Vec<(String, Value)> = (1..=count)
        .map(|i| {
            let doc = Value::object([
                ("age", Value::from((20 + (i % 50)) as i64)),
                ("city", Value::from(CITIES[i % 3])),
                ("active", Value::from(i % 2 == 0)),
            ]);
            (format!("user:{i}"), doc)
        })
        .collect();
    db.bulk_set(entries).await.unwrap();
    db.set("config", Value::object([("theme", Value::from("dark"))]))
        .await
        .unwrap();
}

#[tokio::test]
async fn filtered_sorted_limited_query() {
    let (_dir, db) = open_sqlite(direct_options()).await;
    seed_users(&db, 500).await;

    let rows = db
        .query()
        .prefix("user:")
        .filter("age", FilterOp::Ge, 30)
        .filter("age", FilterOp::Lt, 40)
        .filter("city", FilterOp::Eq, "Cairo")
        .filter("active", FilterOp::Eq, true)
        .sort("age", SortOrder::Desc)
        .limit(10)
        .get()
        .await
        .unwrap();

    assert!(rows.len() <= 10);
    assert!(!rows.is_empty());
    let mut last_age = f64::MAX;
    for row in &rows {
        let age = row.field("age").unwrap().as_f64().unwrap();
        assert!((30.0..40.0).contains(&age));
        assert_eq!(row.field("city"), Some(Value::from("Cairo")));
        assert_eq!(row.field("active"), Some(Value::from(true)));
        assert!(age <= last_age, "ages must be non-increasing");
        last_age = age;
    }

    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn prefix_only_query_pushes_down_on_sqlite() {
    let (_dir, db) = open_sqlite(direct_options()).await;
    seed_users(&db, 50).await;

    // Prefix with no other predicates takes the ranged-scan path; results
    // must be identical to the streaming path semantics.
    let rows = db
        .query()
        .prefix("user:")
        .sort("key", SortOrder::Asc)
        .limit(5)
        .offset(2)
        .get()
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
    let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, ["user:11", "user:12", "user:13", "user:14", "user:15"]);

    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn prefix_query_works_without_push_down() {
    let (_dir, db) = open_json(direct_options()).await;
    seed_users(&db, 50).await;

    let rows = db
        .query()
        .prefix("user:")
        .sort("key", SortOrder::Asc)
        .limit(5)
        .offset(2)
        .get()
        .await
        .unwrap();
    let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, ["user:11", "user:12", "user:13", "user:14", "user:15"]);

    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn count_first_exists_pluck() {
    let (_dir, db) = open_sqlite(direct_options()).await;
    seed_users(&db, 60).await;

    let actives = db
        .query()
        .prefix("user:")
        .filter("active", FilterOp::Eq, true)
        .count()
        .await
        .unwrap();
    assert_eq!(actives, 30);

    let youngest = db
        .query()
        .prefix("user:")
        .sort("age", SortOrder::Asc)
        .first()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(youngest.field("age"), Some(Value::from(20)));

    assert!(
        db.query()
            .prefix("user:")
            .filter("city", FilterOp::Eq, "Giza")
            .exists()
            .await
            .unwrap()
    );

    let cities = db.query().prefix("user:").pluck("city").await.unwrap();
    assert_eq!(cities.len(), 60);

    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn result_shape_matches_document_kind() {
    let (_dir, db) = open_sqlite(direct_options()).await;
    db.set("doc", Value::object([("a", Value::from(1))]))
        .await
        .unwrap();
    db.set("num", 7).await.unwrap();

    let rows = db.query().prefix("doc").get().await.unwrap();
    let json = rows.first().unwrap().to_json();
    assert_eq!(json["key"], "doc");
    assert_eq!(json["a"], 1);

    let rows = db.query().prefix("num").get().await.unwrap();
    let json = rows.first().unwrap().to_json();
    assert_eq!(json["value"], 7);

    db.destroy(true).await.unwrap();
}
