use crate::count;
use std::sync::LazyLock;
use tether::{Database, Driver, Error, TransactionError};
use tokio::sync::Mutex;

static MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

pub async fn rollback<D: Driver>(database: &Database<D>) {
    let _lock = MUTEX.lock().await;
    let db = database;

    // Setup
    db.execute(
        "DROP TABLE IF EXISTS rollback_entity;
        CREATE TABLE rollback_entity (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
    )
    .await
    .expect("Failed to create the rollback_entity table");

    // The block gives up
    let error = db
        .transaction(|| async move {
            db.execute("INSERT INTO rollback_entity (id, name) VALUES (1, 'first');")
                .await?;
            db.execute("INSERT INTO rollback_entity (id, name) VALUES (2, 'second');")
                .await?;
            Err::<(), _>(Error::msg("The block gave up"))
        })
        .await
        .expect_err("The block failed so the transaction must fail");
    assert_eq!(error.to_string(), "The block gave up");
    assert!(TransactionError::of(&error).is_none());
    assert_eq!(
        count(db, "SELECT COUNT(*) FROM rollback_entity;").await,
        0,
        "Rolled back rows must not be visible"
    );
    let status = db.pool().status();
    assert_eq!(status.leased, 0);
    assert!(status.idle >= 1, "A clean rollback keeps the connection");

    // A statement fails
    let result = db
        .transaction(|| async move {
            db.execute("INSERT INTO rollback_entity (id, name) VALUES (1, 'first');")
                .await?;
            db.execute("INSERT INTO rollback_entity (id, name) VALUES (1, 'duplicate');")
                .await?;
            Ok(())
        })
        .await;
    assert!(result.is_err(), "The primary key is violated");
    assert_eq!(count(db, "SELECT COUNT(*) FROM rollback_entity;").await, 0);

    // The table is still writable after the failures
    let inserted = db
        .transaction(|| async move {
            let affected = db
                .execute("INSERT INTO rollback_entity (id, name) VALUES (3, 'third');")
                .await?;
            Ok(affected.rows_affected)
        })
        .await
        .expect("Failed to commit the transaction");
    assert_eq!(inserted, 1);
    assert_eq!(count(db, "SELECT COUNT(*) FROM rollback_entity;").await, 1);
}
