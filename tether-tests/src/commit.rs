use crate::{column, count};
use std::sync::LazyLock;
use tether::{Database, Driver, Value, registry};
use tokio::sync::Mutex;

static MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

pub async fn commit<D: Driver>(database: &Database<D>) {
    let _lock = MUTEX.lock().await;
    let db = database;

    // Setup
    db.execute(
        "DROP TABLE IF EXISTS commit_entity;
        CREATE TABLE commit_entity (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
    )
    .await
    .expect("Failed to create the commit_entity table");

    let (key, connection) = db
        .transaction(|| async move {
            db.execute("INSERT INTO commit_entity (id, name) VALUES (1, 'first');")
                .await?;
            let affected = db
                .execute(
                    "INSERT INTO commit_entity (id, name) VALUES (2, 'second'), (3, 'third');",
                )
                .await?;
            assert_eq!(affected.rows_affected, 2);
            let context = db
                .current_context()?
                .expect("The block must run inside a transaction");
            Ok((context.key(), context.connection_id()))
        })
        .await
        .expect("Failed to commit the transaction");

    assert!(
        registry().lookup(key).is_none(),
        "The context must be unbound once committed"
    );
    assert_eq!(
        column(db, "SELECT name FROM commit_entity ORDER BY id;").await,
        ["first", "second", "third"].map(Value::from)
    );
    let status = db.pool().status();
    assert_eq!(status.leased, 0, "The connection must be released");
    assert!(status.idle >= 1);

    // The same connection is lent again, outside of any transaction
    let lease = db.acquire().await.expect("Could not acquire a connection");
    assert_eq!(lease.id(), connection);
    assert!(!lease.in_transaction());
    drop(lease);

    db.transaction(|| async move {
        db.execute("DELETE FROM commit_entity WHERE id > 1;").await?;
        Ok(())
    })
    .await
    .expect("Failed to commit the deletion");
    assert_eq!(count(db, "SELECT COUNT(*) FROM commit_entity;").await, 1);
}
