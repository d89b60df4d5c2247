//! Transaction semantics through the façade: atomic commit, rollback with
//! cache restoration, and backend support gating.

mod common;

use common::*;
use quickdb::{DatabaseError, Value};

fn account(balance: i64) -> Value {
    Value::object([("balance", Value::from(balance))])
}

fn balance_of(value: &Value) -> f64 {
    value
        .resolve_path("balance")
        .and_then(Value::as_f64)
        .expect("account document with a balance")
}

#[tokio::test]
async fn bank_transfer_commits_atomically() {
    let (_dir, db) = open_sqlite(direct_options()).await;
    db.set("account:1", account(1000)).await.unwrap();
    db.set("account:2", account(500)).await.unwrap();

    db.transaction(|tx| async move {
        let from = tx.get("account:1").await?.expect("account:1");
        let to = tx.get("account:2").await?.expect("account:2");
        tx.set("account:1", account((balance_of(&from) - 200.0) as i64))
            .await?;
        tx.set("account:2", account((balance_of(&to) + 200.0) as i64))
            .await?;
        Ok(())
    })
    .await
    .unwrap();

    let acc1 = db.get("account:1").await.unwrap().unwrap();
    let acc2 = db.get("account:2").await.unwrap().unwrap();
    assert_eq!(balance_of(&acc1), 800.0);
    assert_eq!(balance_of(&acc2), 700.0);

    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn failed_transfer_leaves_no_trace() {
    let (_dir, db) = open_sqlite(direct_options()).await;
    db.set("account:1", account(1000)).await.unwrap();
    db.set("account:2", account(500)).await.unwrap();

    let err = db
        .transaction(|tx| async move {
            let from = tx.get("account:1").await?.expect("account:1");
            tx.set("account:1", account((balance_of(&from) - 200.0) as i64))
                .await?;
            Err::<(), _>(DatabaseError::InvalidValue(
                "Insufficient funds".to_string(),
            ))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Transaction(_)));

    // Backend and cache both reflect the original balances.
    let acc1 = db.get("account:1").await.unwrap().unwrap();
    let acc2 = db.get("account:2").await.unwrap().unwrap();
    assert_eq!(balance_of(&acc1), 1000.0);
    assert_eq!(balance_of(&acc2), 500.0);

    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn transaction_deletes_roll_back() {
    let (_dir, db) = open_sqlite(direct_options()).await;
    db.set("victim", 1).await.unwrap();

    let _ = db
        .transaction(|tx| async move {
            tx.delete("victim").await?;
            assert_eq!(tx.get("victim").await?, None);
            Err::<(), _>(DatabaseError::InvalidValue("abort".to_string()))
        })
        .await;

    assert_eq!(db.get("victim").await.unwrap(), Some(Value::from(1)));
    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn document_backend_rejects_transactions() {
    let (_dir, db) = open_json(direct_options()).await;
    let err = db
        .transaction(|_tx| async move { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Transaction(_)));
    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn pending_batches_flush_before_the_transaction() {
    let options = quickdb::Options::default()
        .with_batch_size(1000)
        .with_batch_delay(60_000);
    let (_dir, db) = open_sqlite(options).await;

    // Leave a write sitting in the queue; the transaction must see it.
    let pending = {
        let db = db.clone();
        tokio::spawn(async move { db.set("queued", 7).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let seen = db
        .transaction(|tx| async move { tx.get("queued").await })
        .await
        .unwrap();
    assert_eq!(seen, Some(Value::from(7)));
    pending.await.unwrap().unwrap();

    db.destroy(true).await.unwrap();
}

#[tokio::test]
async fn concurrent_transaction_conflicts_are_surfaced() {
    let (_dir, db) = open_sqlite(direct_options()).await;

    let (release, gate) = tokio::sync::oneshot::channel::<()>();
    let slow = {
        let db = db.clone();
        tokio::spawn(async move {
            db.transaction(|tx| async move {
                tx.set("held", 1).await?;
                let _ = gate.await;
                Ok(())
            })
            .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // A second transaction cannot acquire the connection.
    let err = db
        .transaction(|tx| async move { tx.set("other", 2).await })
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Transaction(_)));

    let _ = release.send(());
    slow.await.unwrap().unwrap();
    assert_eq!(db.get("held").await.unwrap(), Some(Value::from(1)));

    db.destroy(true).await.unwrap();
}
