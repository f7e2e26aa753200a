use crate::count;
use std::{sync::LazyLock, time::Duration};
use tether::{Database, Driver};
use tokio::{sync::Mutex, time::sleep};

static MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

pub async fn isolation<D: Driver>(database: &Database<D>) {
    let _lock = MUTEX.lock().await;
    let db = database;

    // Setup
    db.execute(
        "DROP TABLE IF EXISTS isolation_entity;
        CREATE TABLE isolation_entity (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
    )
    .await
    .expect("Failed to create the isolation_entity table");

    // Work started with a plain spawn is outside of the block
    let outside = database.clone();
    let seen = db
        .transaction(|| async move {
            db.execute("INSERT INTO isolation_entity (id, name) VALUES (1, 'pending');")
                .await?;
            assert_eq!(
                count(db, "SELECT COUNT(*) FROM isolation_entity;").await,
                1,
                "The block sees its own writes"
            );
            let seen = tokio::spawn(async move {
                assert!(
                    outside
                        .current_context()
                        .expect("A detached task has no context")
                        .is_none()
                );
                count(&outside, "SELECT COUNT(*) FROM isolation_entity;").await
            })
            .await?;
            Ok(seen)
        })
        .await
        .expect("Failed to commit the transaction");
    assert_eq!(seen, 0, "Uncommitted rows must not be visible from outside");
    assert_eq!(count(db, "SELECT COUNT(*) FROM isolation_entity;").await, 1);

    // Two blocks running at the same time never share a connection
    let block = |id: i64| async move {
        db.transaction(|| async move {
            let connection = db.current_context()?.map(|v| v.connection_id());
            db.execute(format!(
                "INSERT INTO isolation_entity (id, name) VALUES ({}, 'concurrent');",
                id
            ))
            .await?;
            sleep(Duration::from_millis(20)).await;
            assert_eq!(
                db.current_context()?.map(|v| v.connection_id()),
                connection
            );
            Ok(connection)
        })
        .await
    };
    let (a, b) = tokio::join!(block(2), block(3));
    let a = a.expect("Failed to commit the first block");
    let b = b.expect("Failed to commit the second block");
    assert!(a.is_some() && b.is_some());
    assert_ne!(a, b, "Concurrent blocks must lease distinct connections");
    assert_eq!(count(db, "SELECT COUNT(*) FROM isolation_entity;").await, 3);
}
