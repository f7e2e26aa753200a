use crate::{column, count};
use std::{sync::LazyLock, time::Duration};
use tether::{Database, Driver, Result, TransactionError, Value, ambient, registry};
use tokio::{sync::Mutex, time::sleep};

static MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Inserts after `hops` suspensions.
async fn insert_later<D: Driver>(database: &Database<D>, id: i64, hops: u32) -> Result<u64> {
    for _ in 0..hops {
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(1)).await;
    }
    database
        .execute(format!(
            "INSERT INTO deferred_entity (id, name) VALUES ({}, 'hop');",
            id
        ))
        .await?;
    Ok(database
        .current_context()?
        .map(|v| v.connection_id())
        .unwrap_or_default())
}

pub async fn deferred<D: Driver>(database: &Database<D>) {
    let _lock = MUTEX.lock().await;
    let db = database;

    // Setup
    db.execute(
        "DROP TABLE IF EXISTS deferred_entity;
        CREATE TABLE deferred_entity (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
    )
    .await
    .expect("Failed to create the deferred_entity table");

    // Timer, chained steps and spawned work all land in the transaction
    let spawned = database.clone();
    let connections = db
        .transaction(|| async move {
            db.execute("INSERT INTO deferred_entity (id, name) VALUES (1, 'entry');")
                .await?;
            let entry = db.current_context()?.map(|v| v.connection_id());
            sleep(Duration::from_millis(10)).await;
            db.execute("INSERT INTO deferred_entity (id, name) VALUES (2, 'timer');")
                .await?;
            let chained = insert_later(db, 3, 5).await?;
            let task = ambient::spawn(async move {
                sleep(Duration::from_millis(5)).await;
                spawned
                    .execute("INSERT INTO deferred_entity (id, name) VALUES (4, 'spawned');")
                    .await?;
                Ok::<_, tether::Error>(spawned.current_context()?.map(|v| v.connection_id()))
            });
            let spawned = task.await??;
            Ok([entry, Some(chained), spawned])
        })
        .await
        .expect("Failed to commit the transaction");
    assert!(connections[0].is_some());
    assert!(
        connections.iter().all(|v| *v == connections[0]),
        "Every continuation must use the connection of the block: {:?}",
        connections
    );
    assert_eq!(
        column(db, "SELECT name FROM deferred_entity ORDER BY id;").await,
        ["entry", "timer", "hop", "spawned"].map(Value::from)
    );

    // Rolled back together as well
    let spawned = database.clone();
    let result = db
        .transaction(|| async move {
            db.execute("INSERT INTO deferred_entity (id, name) VALUES (5, 'entry');")
                .await?;
            ambient::spawn(async move {
                sleep(Duration::from_millis(5)).await;
                spawned
                    .execute("INSERT INTO deferred_entity (id, name) VALUES (6, 'spawned');")
                    .await
            })
            .await??;
            db.execute("INSERT INTO deferred_entity (id, name) VALUES (1, 'duplicate');")
                .await?;
            Ok(())
        })
        .await;
    assert!(result.is_err());
    assert_eq!(count(db, "SELECT COUNT(*) FROM deferred_entity;").await, 4);

    // A continuation that outlives its block is refused
    let spawned = database.clone();
    let (key, late) = db
        .transaction(|| async move {
            let key = db.current_context()?.map(|v| v.key());
            let late = ambient::spawn(async move {
                sleep(Duration::from_millis(50)).await;
                spawned
                    .execute("INSERT INTO deferred_entity (id, name) VALUES (7, 'late');")
                    .await
            });
            Ok((key, late))
        })
        .await
        .expect("Failed to commit the transaction");
    let key = key.expect("The block must run inside a transaction");
    let error = late
        .await
        .expect("The late task panicked")
        .expect_err("The late statement must not run");
    assert!(matches!(
        TransactionError::of(&error),
        Some(TransactionError::ContextPropagationFailure { key: k }) if *k == key
    ));
    assert!(registry().lookup(key).is_none());
    assert_eq!(count(db, "SELECT COUNT(*) FROM deferred_entity;").await, 4);
}
