//! Batched writes through the façade: coalescing, notification counts,
//! flush, and ordering.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use futures_util::future::join_all;
use quickdb::{Options, Value};

#[tokio::test]
async fn coalesced_writes_all_persist_and_notify() {
    let options = Options::default().with_batch_size(100).with_batch_delay(50);
    let (_dir, db) = open_sqlite(options).await;

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    db.watch(
        "key*",
        Arc::new(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    )
    .unwrap();

    let total = 1000;
    let writes = (0..total).map(|i| {
        let db = db.clone();
        async move {
            let value = Value::object([
                ("value", Value::from(i)),
                ("data", Value::from("x".repeat(100))),
            ]);
            db.set(&format!("key{i}"), value).await
        }
    });
    for result in join_all(writes).await {
        result.unwrap();
    }
    db.flush().await.unwrap();

    assert_eq!(db.get_all().await.unwrap().len(), total);
    assert_eq!(notified.load(Ordering::SeqCst), total);

    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn set_through_the_batcher_is_visible_after_completion() {
    let options = Options::default().with_batch_size(10).with_batch_delay(5);
    let (_dir, db) = open_sqlite(options).await;

    // A single awaited set resolves only after its partition flushed, so
    // the value must be durable immediately afterwards.
    db.set("solo", 1).await.unwrap();
    assert_eq!(db.len().await.unwrap(), 1);

    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn destroy_without_flush_drops_pending_writes() {
    let options = Options::default()
        .with_batch_size(1000)
        .with_batch_delay(60_000);
    let (_dir, db) = open_sqlite(options).await;

    // Enqueue without awaiting completion, then tear down dropping them.
    let pending: Vec<_> = (0..5)
        .map(|i| {
            let db = db.clone();
            tokio::spawn(async move { db.set(&format!("ghost{i}"), i).await })
        })
        .collect();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    db.destroy(false).await.unwrap();

    for handle in pending {
        // Dropped writes surface as errors to their submitters.
        assert!(handle.await.unwrap().is_err());
    }
}

#[tokio::test]
async fn batching_disabled_writes_directly() {
    let (_dir, db) = open_sqlite(direct_options()).await;
    db.set("direct", 1).await.unwrap();
    assert_eq!(db.stats().batch_queue, 0);
    assert_eq!(db.get("direct").await.unwrap(), Some(Value::from(1)));
    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn json_backend_batches_too() {
    let options = Options::default().with_batch_size(50).with_batch_delay(10);
    let (_dir, db) = open_json(options).await;

    let writes = (0..120).map(|i| {
        let db = db.clone();
        async move { db.set(&format!("j{i:03}"), i).await }
    });
    for result in join_all(writes).await {
        result.unwrap();
    }
    db.flush().await.unwrap();
    assert_eq!(db.len().await.unwrap(), 120);
    db.destroy(true).await.unwrap();
}
